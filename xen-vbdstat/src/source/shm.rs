//! Read-only shared memory statistics pages published by tapdisk
use std::{
    fs::File,
    io,
    num::NonZeroUsize,
    os::{raw::c_void, unix::fs::MetadataExt},
    path::Path,
    ptr::{self, NonNull}
};

use bitfield::bitfield;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nonzero_ext::nonzero;

use super::invalid_data;
use crate::Sample;

/// Every statistics page is mapped with this length.
pub const STATS_PAGE_SIZE: usize = 4096;

bitfield! {
    /// The `flags` word shared by both page layouts.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct StatsFlags(u64);
    impl Debug;
    pub low_memory_mode, _: 0;
}

/// Field indices of tapdisk3's per-VBD `struct blkback_stats`, an array of
/// native-endian 64-bit counters.
mod blkback_stats {
    pub const RD_REQ: usize = 3;
    pub const RD_CNT: usize = 4;
    pub const RD_SECT: usize = 5;
    pub const RD_SUM_USECS: usize = 6;
    pub const WR_REQ: usize = 8;
    pub const WR_CNT: usize = 9;
    pub const WR_SECT: usize = 10;
    pub const WR_SUM_USECS: usize = 11;
    pub const FLAGS: usize = 13;
    pub const NFIELDS: usize = 14;
}

/// Field indices of tapdisk's per-process `struct stats`.
mod tapdisk_stats {
    pub const READ_REQS_SUBMITTED: usize = 0;
    pub const READ_REQS_COMPLETED: usize = 1;
    pub const READ_SECTORS: usize = 2;
    pub const READ_TOTAL_TICKS: usize = 3;
    pub const WRITE_REQS_SUBMITTED: usize = 4;
    pub const WRITE_REQS_COMPLETED: usize = 5;
    pub const WRITE_SECTORS: usize = 6;
    pub const WRITE_TOTAL_TICKS: usize = 7;
    pub const NFIELDS: usize = 10;
}

/// Size in bytes of a `struct blkback_stats`
pub const BLKBACK_STATS_LEN: usize = blkback_stats::NFIELDS * 8;
/// Size in bytes of a tapdisk `struct stats`
pub const TAPDISK_STATS_LEN: usize = tapdisk_stats::NFIELDS * 8;

/// Fetch the `index`th 64-bit field of `buf`.
fn field(buf: &[u8], index: usize) -> io::Result<u64> {
    let start = index * 8;
    let bytes = buf.get(start..start + 8)
        .ok_or_else(|| invalid_data(format!(
            "statistics page truncated: need {} bytes, have {}",
            start + 8, buf.len())))?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_ne_bytes(raw))
}

fn inflight(submitted: u64, completed: u64) -> u32 {
    submitted.saturating_sub(completed).min(u32::MAX as u64) as u32
}

/// Decode a `struct blkback_stats` from the start of `buf`.
pub fn decode_blkback_stats(buf: &[u8]) -> io::Result<Sample> {
    use self::blkback_stats::*;

    if buf.len() < BLKBACK_STATS_LEN {
        return Err(invalid_data(format!(
            "blkback_stats needs {} bytes, have {}",
            BLKBACK_STATS_LEN, buf.len())));
    }
    let rd_req = field(buf, RD_REQ)?;
    let wr_req = field(buf, WR_REQ)?;
    let flags = StatsFlags(field(buf, FLAGS)?);
    Ok(Sample {
        rd_reqs: rd_req,
        rd_sectors: field(buf, RD_SECT)?,
        wr_reqs: wr_req,
        wr_sectors: field(buf, WR_SECT)?,
        rd_ticks_us: field(buf, RD_SUM_USECS)?,
        wr_ticks_us: field(buf, WR_SUM_USECS)?,
        inflight_rd: inflight(rd_req, field(buf, RD_CNT)?),
        inflight_wr: inflight(wr_req, field(buf, WR_CNT)?),
        low_mem_mode: Some(flags.low_memory_mode()),
        ring: None,
    })
}

/// Decode a tapdisk `struct stats` from the start of `buf`.
///
/// This layout carries no usable low memory mode indication.
pub fn decode_tapdisk_stats(buf: &[u8]) -> io::Result<Sample> {
    use self::tapdisk_stats::*;

    if buf.len() < TAPDISK_STATS_LEN {
        return Err(invalid_data(format!(
            "tapdisk stats needs {} bytes, have {}",
            TAPDISK_STATS_LEN, buf.len())));
    }
    let rd_done = field(buf, READ_REQS_COMPLETED)?;
    let wr_done = field(buf, WRITE_REQS_COMPLETED)?;
    Ok(Sample {
        rd_reqs: rd_done,
        rd_sectors: field(buf, READ_SECTORS)?,
        wr_reqs: wr_done,
        wr_sectors: field(buf, WRITE_SECTORS)?,
        rd_ticks_us: field(buf, READ_TOTAL_TICKS)?,
        wr_ticks_us: field(buf, WRITE_TOTAL_TICKS)?,
        inflight_rd: inflight(field(buf, READ_REQS_SUBMITTED)?, rd_done),
        inflight_wr: inflight(field(buf, WRITE_REQS_SUBMITTED)?, wr_done),
        low_mem_mode: None,
        ring: None,
    })
}

/// A statistics page mapped read-only and shared with its publisher.
///
/// The mapping and the descriptor are both released on drop.
#[derive(Debug)]
pub struct ShmPage {
    file: File,
    addr: NonNull<c_void>,
}

impl ShmPage {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        let len: NonZeroUsize = nonzero!(STATS_PAGE_SIZE);
        let raw = unsafe {
            mmap(None, len, ProtFlags::PROT_READ, MapFlags::MAP_SHARED,
                 Some(&file), 0)
        }?;
        // If mapping failed, `file` is closed on the way out
        let addr = NonNull::new(raw)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other,
                                          "mmap returned NULL"))?;
        Ok(ShmPage { file, addr })
    }

    /// Copy out the currently valid part of the page.
    ///
    /// Fails if the page's file has been unlinked, which is how its
    /// publisher signals that the VBD went away.  Only the bytes backed by
    /// the file are copied; touching the mapping past EOF would fault.
    pub fn snapshot(&self) -> io::Result<Vec<u8>> {
        let md = self.file.metadata()?;
        if md.nlink() == 0 {
            return Err(io::Error::new(io::ErrorKind::NotFound,
                                      "statistics page was unlinked"));
        }
        let len = (md.len() as usize).min(STATS_PAGE_SIZE);
        let mut buf = vec![0u8; len];
        unsafe {
            ptr::copy_nonoverlapping(self.addr.as_ptr() as *const u8,
                                     buf.as_mut_ptr(), len);
        }
        Ok(buf)
    }
}

impl Drop for ShmPage {
    fn drop(&mut self) {
        // Nothing useful can be done if this fails
        let _ = unsafe { munmap(self.addr.as_ptr(), STATS_PAGE_SIZE) };
    }
}
