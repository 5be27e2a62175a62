//! A monitored VBD and its two most recent samples
use std::{
    fmt,
    io,
    mem
};

use crate::source::Binding;

/// Identifies a VBD by the domain that owns it and its device number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VbdId {
    pub domid: u32,
    pub vbdid: u32,
}

impl VbdId {
    pub fn new(domid: u32, vbdid: u32) -> Self {
        VbdId { domid, vbdid }
    }
}

impl fmt::Display for VbdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.domid, self.vbdid)
    }
}

/// Occupancy of a blkback shared I/O ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingStats {
    /// Number of entries in the ring
    pub size: u32,
    pub req_prod: u32,
    pub rsp_prod: u32,
}

impl RingStats {
    /// Requests produced by the frontend that have no response yet.
    pub fn in_use(&self) -> u32 {
        // The producer indices are free-running and wrap
        self.req_prod.wrapping_sub(self.rsp_prod)
    }
}

/// Raw counters read from a statistics source in a single pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sample {
    /// Completed read requests
    pub rd_reqs: u64,
    /// Completed read sectors
    pub rd_sectors: u64,
    /// Completed write requests
    pub wr_reqs: u64,
    /// Completed write sectors
    pub wr_sectors: u64,
    /// Cumulative read latency, in microseconds
    pub rd_ticks_us: u64,
    /// Cumulative write latency, in microseconds
    pub wr_ticks_us: u64,
    pub inflight_rd: u32,
    pub inflight_wr: u32,
    /// `None` if the source cannot report low memory mode
    pub low_mem_mode: Option<bool>,
    /// Only sources that expose the shared ring fill this in
    pub ring: Option<RingStats>,
}

/// A monitored VBD.
///
/// Owns the binding to its statistics source; dropping the `Device` releases
/// every descriptor and mapping it holds.
pub struct Device {
    id: VbdId,
    binding: Box<dyn Binding>,
    current: Sample,
    previous: Sample,
}

impl Device {
    pub fn new(id: VbdId, binding: Box<dyn Binding>) -> Self {
        Device {
            id,
            binding,
            current: Sample::default(),
            previous: Sample::default()
        }
    }

    pub fn id(&self) -> VbdId {
        self.id
    }

    /// The sample taken by the most recent [`Device::update`]
    pub fn current(&self) -> &Sample {
        &self.current
    }

    /// The sample taken by the update before that
    pub fn previous(&self) -> &Sample {
        &self.previous
    }

    /// Name of the backend memory pool used by this device, if the source
    /// groups devices by pool.
    pub fn pool(&self) -> Option<&str> {
        self.binding.pool()
    }

    /// Re-read the bound source, shifting the current sample into the
    /// previous slot.
    ///
    /// An error means the source has been invalidated, usually because the
    /// VBD was detached.  The samples are left untouched in that case and
    /// the caller should evict the device.
    pub fn update(&mut self) -> io::Result<()> {
        let fresh = self.binding.read()?;
        self.previous = mem::replace(&mut self.current, fresh);
        Ok(())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("binding", &self.binding)
            .field("current", &self.current)
            .field("previous", &self.previous)
            .finish()
    }
}

/// Scripted bindings for unit tests
#[cfg(test)]
pub(crate) mod fake {
    use std::{
        cell::Cell,
        collections::VecDeque,
        io,
        rc::Rc
    };

    use super::*;

    /// Returns queued samples, then fails as if the device was detached.
    #[derive(Debug, Default)]
    pub struct FakeBinding {
        pub samples: VecDeque<Sample>,
        pub pool: Option<String>,
        pub releases: Option<Rc<Cell<usize>>>,
    }

    impl FakeBinding {
        pub fn new<I: IntoIterator<Item = Sample>>(samples: I) -> Self {
            // No struct update syntax: FakeBinding implements Drop
            FakeBinding {
                samples: samples.into_iter().collect(),
                pool: None,
                releases: None,
            }
        }

        /// Never runs dry
        pub fn forever() -> Self {
            Self::new(std::iter::repeat(Sample::default()).take(1000))
        }
    }

    impl Binding for FakeBinding {
        fn read(&mut self) -> io::Result<Sample> {
            self.samples.pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound,
                                              "detached"))
        }

        fn pool(&self) -> Option<&str> {
            self.pool.as_deref()
        }
    }

    impl Drop for FakeBinding {
        fn drop(&mut self) {
            if let Some(r) = &self.releases {
                r.set(r.get() + 1);
            }
        }
    }

    pub fn device(domid: u32, vbdid: u32) -> Device {
        Device::new(VbdId::new(domid, vbdid),
                    Box::new(FakeBinding::forever()))
    }
}
