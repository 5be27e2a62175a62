//! blkback and blktap2 counters exported as sysfs text files
use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf}
};

use lazy_static::lazy_static;

use super::{
    device_path,
    invalid_data,
    read_line,
    Binding,
    EntryPattern,
    StatsSource
};
use crate::{RingStats, Sample, VbdId};

const DEVICES_DIR: &str = "/sys/bus/xen-backend/devices";
const BLOCK_DIR: &str = "/sys/block";
const POOLS_DIR: &str = "/sys/kernel/blkback/pools";
const PREFIX: &str = "vbd";

lazy_static! {
    static ref ENTRY: EntryPattern = EntryPattern::new(PREFIX);
}

/// An open text file that is re-read from the start on every sample.
#[derive(Debug)]
struct TextCounter {
    path: PathBuf,
    file: File,
    buf: String,
}

impl TextCounter {
    fn open(path: PathBuf) -> io::Result<Self> {
        let file = File::open(&path)?;
        Ok(TextCounter { path, file, buf: String::new() })
    }

    /// Rewind and read the whole file.  sysfs attributes of a detached
    /// device fail here, or have already been unlinked.
    fn reread(&mut self) -> io::Result<&str> {
        if self.file.metadata()?.nlink() == 0 {
            return Err(io::Error::new(io::ErrorKind::NotFound,
                format!("{} was removed", self.path.display())));
        }
        self.buf.clear();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_string(&mut self.buf)
            .map_err(|e| io::Error::new(e.kind(),
                format!("{}: {}", self.path.display(), e)))?;
        Ok(self.buf.as_str())
    }
}

/// First integer following `label` on the line that starts with it
fn labelled(text: &str, label: &str) -> io::Result<u32> {
    text.lines()
        .find_map(|line| line.strip_prefix(label))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| invalid_data(format!("io_ring has no {:?}", label)))
}

/// Parse a blkback `io_ring` attribute:
///
/// ```text
/// nr_ents 32
/// req prod 1234 cons 1234 event 1235
/// rsp prod 1234 pvt 1234 event 1235
/// ```
pub(crate) fn parse_ring(text: &str) -> io::Result<RingStats> {
    Ok(RingStats {
        size: labelled(text, "nr_ents")?,
        req_prod: labelled(text, "req prod")?,
        rsp_prod: labelled(text, "rsp prod")?,
    })
}

/// Block layer `stat` counters, with ticks converted to microseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct BlockStat {
    pub rd_reqs: u64,
    pub rd_sectors: u64,
    pub rd_ticks_us: u64,
    pub wr_reqs: u64,
    pub wr_sectors: u64,
    pub wr_ticks_us: u64,
}

/// Parse a block device `stat` attribute.  The first eight fields are read
/// I/Os, read merges, read sectors, read ticks (ms), then the same four for
/// writes.
pub(crate) fn parse_stat(text: &str) -> io::Result<BlockStat> {
    let fields = text.split_whitespace()
        .take(8)
        .map(|f| f.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid_data(format!("bad stat field: {}", e)))?;
    if fields.len() < 8 {
        return Err(invalid_data(format!("stat has only {} fields",
                                        fields.len())));
    }
    Ok(BlockStat {
        rd_reqs: fields[0],
        rd_sectors: fields[2],
        rd_ticks_us: fields[3].saturating_mul(1000),
        wr_reqs: fields[4],
        wr_sectors: fields[6],
        wr_ticks_us: fields[7].saturating_mul(1000),
    })
}

/// Parse a block device `inflight` attribute: reads and writes in flight.
pub(crate) fn parse_inflight(text: &str) -> io::Result<(u32, u32)> {
    let mut it = text.split_whitespace().map(|f| f.parse::<u32>());
    match (it.next(), it.next()) {
        (Some(Ok(rd)), Some(Ok(wr))) => Ok((rd, wr)),
        _ => Err(invalid_data(format!("bad inflight {:?}", text.trim())))
    }
}

/// Extract the minor number from a `physical_device` attribute, which holds
/// `<major>:<minor>` in hex.
pub(crate) fn parse_physical_device(text: &str) -> Option<u32> {
    let (_major, minor) = text.trim().split_once(':')?;
    u32::from_str_radix(minor, 16).ok()
}

/// Name udev gives the blktap2 disk with this minor: `tda`..`tdz`, `tdaa`..
pub(crate) fn td_name(minor: u32) -> String {
    let mut n = minor as u64 + 1;
    let mut letters = Vec::new();
    while n > 0 {
        n -= 1;
        letters.push(char::from(b'a' + (n % 26) as u8));
        n /= 26;
    }
    let mut name = String::from("td");
    name.extend(letters.iter().rev());
    name
}

/// Binds VBDs served by blkback on top of a blktap2 disk.
///
/// Ring occupancy comes from the backend device's `io_ring`, request counts
/// from the blktap2 disk's `stat` and `inflight`.  Devices are grouped by
/// the blkback page pool named in their `mempool` attribute.
#[derive(Debug)]
pub struct Blkback {
    devices_dir: PathBuf,
    block_dir: PathBuf,
    pools_dir: PathBuf,
}

impl Blkback {
    pub fn new<P, Q, R>(devices_dir: P, block_dir: Q, pools_dir: R) -> Self
        where P: Into<PathBuf>, Q: Into<PathBuf>, R: Into<PathBuf>
    {
        Blkback {
            devices_dir: devices_dir.into(),
            block_dir: block_dir.into(),
            pools_dir: pools_dir.into()
        }
    }
}

impl Default for Blkback {
    fn default() -> Self {
        Self::new(DEVICES_DIR, BLOCK_DIR, POOLS_DIR)
    }
}

impl StatsSource for Blkback {
    fn discovery_dir(&self) -> &Path {
        &self.devices_dir
    }

    fn parse_entry(&self, name: &str) -> Option<VbdId> {
        ENTRY.parse(name)
    }

    fn bind(&self, id: VbdId) -> io::Result<Box<dyn Binding>> {
        let dev_dir = device_path(&self.devices_dir, PREFIX, id);
        let ring = TextCounter::open(dev_dir.join("io_ring"))?;
        let physdev = read_line(&dev_dir.join("physical_device"))?;
        let minor = parse_physical_device(&physdev)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound,
                format!("{} has no physical device", id)))?;
        let td_dir = self.block_dir.join(td_name(minor));
        let stat = TextCounter::open(td_dir.join("stat"))?;
        let inflight = TextCounter::open(td_dir.join("inflight"))?;
        let pool = read_line(&dev_dir.join("mempool"))?;
        Ok(Box::new(BlkbackBinding { ring, stat, inflight, pool }))
    }

    fn supports_low_memory_mode(&self) -> bool {
        false
    }

    fn pool_dir(&self) -> Option<&Path> {
        Some(&self.pools_dir)
    }
}

#[derive(Debug)]
struct BlkbackBinding {
    ring: TextCounter,
    stat: TextCounter,
    inflight: TextCounter,
    pool: String,
}

impl Binding for BlkbackBinding {
    fn read(&mut self) -> io::Result<Sample> {
        let ring = parse_ring(self.ring.reread()?)?;
        let stat = parse_stat(self.stat.reread()?)?;
        let (inflight_rd, inflight_wr) =
            parse_inflight(self.inflight.reread()?)?;
        Ok(Sample {
            rd_reqs: stat.rd_reqs,
            rd_sectors: stat.rd_sectors,
            wr_reqs: stat.wr_reqs,
            wr_sectors: stat.wr_sectors,
            rd_ticks_us: stat.rd_ticks_us,
            wr_ticks_us: stat.wr_ticks_us,
            inflight_rd,
            inflight_wr,
            low_mem_mode: None,
            ring: Some(ring),
        })
    }

    fn pool(&self) -> Option<&str> {
        Some(&self.pool)
    }
}
