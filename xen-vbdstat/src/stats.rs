//! Rates computed from two consecutive samples of a device
use crate::{Device, RingStats, VbdId};

/// Bytes per sector in every counter source
pub const SECTOR_SIZE: u64 = 512;

/// Default divisor for throughput: decimal megabytes
pub const UNIT_MB: u32 = 1_000_000;

/// Used by [`Statistics::compute`]
macro_rules! delta {
    ($device: ident, $field:ident) => {
        // A reset device restarts its counters from zero
        $device.current().$field.saturating_sub($device.previous().$field)
    }
}

macro_rules! fields {
    ($self: ident, $meth: ident, $field: ident) => {
        pub fn $meth(&$self) -> u64 {
            $self.$field
        }
    }
}

macro_rules! fields_per_sec {
    ($self: ident, $meth: ident, $field: ident) => {
        pub fn $meth(&$self) -> f64 {
            if $self.etime > 0.0 {
                $self.$field as f64 / $self.etime
            } else {
                0.0
            }
        }
    }
}

macro_rules! units_per_sec {
    ($self: ident, $meth: ident, $sectors: ident) => {
        pub fn $meth(&$self) -> f64 {
            if $self.etime > 0.0 {
                $self.$sectors as f64 * SECTOR_SIZE as f64
                    / $self.unit as f64 / $self.etime
            } else {
                0.0
            }
        }
    }
}

macro_rules! avg_queue {
    ($self: ident, $meth: ident, $ticks: ident) => {
        pub fn $meth(&$self) -> f64 {
            if $self.etime > 0.0 {
                $self.$ticks as f64 / ($self.etime * 1_000_000.0)
            } else {
                0.0
            }
        }
    }
}

/// Computes statistics between a device's previous and current samples.
///
/// Rates are undefined when no time has elapsed; they are reported as zero.
#[derive(Clone, Debug)]
pub struct Statistics {
    id: VbdId,
    pool: Option<String>,
    etime: f64,
    unit: u32,
    total_reads: u64,
    total_writes: u64,
    total_sectors_read: u64,
    total_sectors_write: u64,
    total_ticks_read: u64,
    total_ticks_write: u64,
    inflight_read: u32,
    inflight_write: u32,
    low_memory_mode: Option<bool>,
    ring: Option<RingStats>,
}

impl Statistics {
    /// `etime` should be the elapsed time in seconds between the two samples,
    /// and `unit` the number of bytes in the throughput unit.
    pub fn compute(device: &Device, etime: f64, unit: u32) -> Self {
        let etime = if etime.is_finite() { etime } else { 0.0 };
        let cur = device.current();
        Statistics {
            id: device.id(),
            pool: device.pool().map(str::to_owned),
            etime,
            unit: unit.max(1),
            total_reads: delta!(device, rd_reqs),
            total_writes: delta!(device, wr_reqs),
            total_sectors_read: delta!(device, rd_sectors),
            total_sectors_write: delta!(device, wr_sectors),
            total_ticks_read: delta!(device, rd_ticks_us),
            total_ticks_write: delta!(device, wr_ticks_us),
            inflight_read: cur.inflight_rd,
            inflight_write: cur.inflight_wr,
            low_memory_mode: cur.low_mem_mode,
            ring: cur.ring,
        }
    }

    pub fn id(&self) -> VbdId {
        self.id
    }

    pub fn pool(&self) -> Option<&str> {
        self.pool.as_deref()
    }

    /// Elapsed time covered by these statistics, in seconds
    pub fn etime(&self) -> f64 {
        self.etime
    }

    /// Reads in flight when the current sample was taken
    pub fn inflight_read(&self) -> u32 {
        self.inflight_read
    }

    pub fn inflight_write(&self) -> u32 {
        self.inflight_write
    }

    /// `None` if the source can't tell
    pub fn low_memory_mode(&self) -> Option<bool> {
        self.low_memory_mode
    }

    pub fn ring(&self) -> Option<RingStats> {
        self.ring
    }

    fields!{self, total_reads, total_reads}
    fields!{self, total_writes, total_writes}
    fields!{self, total_sectors_read, total_sectors_read}
    fields!{self, total_sectors_write, total_sectors_write}
    fields!{self, total_ticks_read, total_ticks_read}
    fields!{self, total_ticks_write, total_ticks_write}
    fields_per_sec!{self, reads_per_second, total_reads}
    fields_per_sec!{self, writes_per_second, total_writes}
    units_per_sec!{self, units_per_second_read, total_sectors_read}
    units_per_sec!{self, units_per_second_write, total_sectors_write}
    avg_queue!{self, avg_queue_read, total_ticks_read}
    avg_queue!{self, avg_queue_write, total_ticks_write}
}
