//! Statistics source bindings
//!
//! A [`StatsSource`] knows where the backend advertises its devices and how
//! to turn a discovered [`VbdId`] into a live [`Binding`] that can be
//! re-read every poll cycle.  One source is selected at startup; nothing
//! else in the crate cares which.
use std::{
    fmt,
    fs,
    io,
    path::{Path, PathBuf}
};

use regex::Regex;

use crate::{Filters, Sample, VbdId};

mod blkback;
mod shm;
mod tapdisk3;
mod vbd3;
mod xenstore;

pub use self::blkback::Blkback;
pub use self::shm::{
    decode_blkback_stats,
    decode_tapdisk_stats,
    ShmPage,
    StatsFlags,
    BLKBACK_STATS_LEN,
    STATS_PAGE_SIZE,
    TAPDISK_STATS_LEN
};
pub use self::tapdisk3::Tapdisk3;
pub use self::vbd3::Vbd3;
pub use self::xenstore::{KeyValueStore, XenstoreCli};

/// A live handle to one device's raw counters.
pub trait Binding: fmt::Debug {
    /// Check that the source is still valid and read all of its counters in
    /// a single pass.
    ///
    /// Any error means the device is gone and should be evicted.
    fn read(&mut self) -> io::Result<Sample>;

    /// Name of the backend memory pool the device draws from, if known.
    fn pool(&self) -> Option<&str> {
        None
    }
}

/// A strategy for discovering and binding VBDs.
pub trait StatsSource: fmt::Debug {
    /// Directory holding one entry per live device
    fn discovery_dir(&self) -> &Path;

    /// Extract the ids encoded in the name of a discovery directory entry.
    fn parse_entry(&self, name: &str) -> Option<VbdId>;

    /// Acquire a binding for `id`.
    ///
    /// Either a complete binding is returned, or everything acquired along
    /// the way has been released.  `NotFound` means the device has no active
    /// backend, which is expected for placeholder devices.
    fn bind(&self, id: VbdId) -> io::Result<Box<dyn Binding>>;

    /// Whether samples from this source carry the low memory mode flag
    fn supports_low_memory_mode(&self) -> bool;

    /// Directory of backend pool counters, for sources whose devices are
    /// grouped by pool.
    fn pool_dir(&self) -> Option<&Path> {
        None
    }
}

/// The available [`StatsSource`] implementations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Per-VBD shared memory pages published by tapdisk3 in `/dev/shm`
    Vbd3,
    /// Per-tapdisk shared memory pages located through xenstore
    Tapdisk3,
    /// blkback and blktap2 sysfs text counters
    Blkback,
}

impl SourceKind {
    /// Construct the source with its default paths.
    pub fn build(self) -> Box<dyn StatsSource> {
        match self {
            SourceKind::Vbd3 => Box::new(Vbd3::default()),
            SourceKind::Tapdisk3 => Box::new(Tapdisk3::default()),
            SourceKind::Blkback => Box::new(Blkback::default()),
        }
    }
}

/// Matches discovery entries named `<prefix>-<domid>-<vbdid>`.
#[derive(Debug)]
pub(crate) struct EntryPattern(Regex);

impl EntryPattern {
    /// `prefix` is matched literally.  Escaped, it can't make the pattern
    /// invalid, so compiling it can't fail.
    pub(crate) fn new(prefix: &str) -> Self {
        let re = format!("^{}-([0-9]+)-([0-9]+)$", regex::escape(prefix));
        EntryPattern(Regex::new(&re).expect("escaped entry pattern"))
    }

    pub(crate) fn parse(&self, name: &str) -> Option<VbdId> {
        let caps = self.0.captures(name)?;
        // Ids that overflow u32 can't be real devices
        let domid = caps.get(1)?.as_str().parse().ok()?;
        let vbdid = caps.get(2)?.as_str().parse().ok()?;
        Some(VbdId::new(domid, vbdid))
    }
}

/// Filter directory entry names down to the ids worth binding.
///
/// The result is sorted and free of duplicates.
pub fn candidates<'a, I>(source: &dyn StatsSource, names: I, filters: &Filters)
    -> Vec<VbdId>
    where I: IntoIterator<Item = &'a str>
{
    let mut ids = names.into_iter()
        .filter_map(|name| source.parse_entry(name))
        .filter(|id| filters.accepts(*id))
        .collect::<Vec<_>>();
    ids.sort();
    ids.dedup();
    ids
}

/// List the source's discovery directory and return the matching candidates.
///
/// Failure to list the directory is fatal to the scan.
pub fn scan(source: &dyn StatsSource, filters: &Filters)
    -> io::Result<Vec<VbdId>>
{
    let mut names = Vec::new();
    for entry in fs::read_dir(source.discovery_dir())? {
        // Names that aren't UTF-8 can't match the pattern anyway
        if let Ok(name) = entry?.file_name().into_string() {
            names.push(name);
        }
    }
    Ok(candidates(source, names.iter().map(String::as_str), filters))
}

/// Read a small sysfs-style file and strip the trailing newline.
pub(crate) fn read_line(path: &Path) -> io::Result<String> {
    let s = fs::read_to_string(path)?;
    Ok(s.trim_end().to_owned())
}

pub(crate) fn invalid_data<E>(e: E) -> io::Error
    where E: Into<Box<dyn std::error::Error + Send + Sync>>
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Joins `dir` with a name built from a template, for the per-device paths.
pub(crate) fn device_path(dir: &Path, prefix: &str, id: VbdId) -> PathBuf {
    dir.join(format!("{}-{}-{}", prefix, id.domid, id.vbdid))
}
