//! tapdisk3 per-VBD shared memory pages
use std::{
    io,
    path::{Path, PathBuf}
};

use lazy_static::lazy_static;

use super::{
    decode_blkback_stats,
    device_path,
    Binding,
    EntryPattern,
    ShmPage,
    StatsSource
};
use crate::{Sample, VbdId};

const SHM_DIR: &str = "/dev/shm";
const PREFIX: &str = "vbd3";

lazy_static! {
    static ref ENTRY: EntryPattern = EntryPattern::new(PREFIX);
}

/// Binds each VBD directly to the `vbd3-<domid>-<vbdid>` page that tapdisk3
/// publishes for it.
#[derive(Debug)]
pub struct Vbd3 {
    dir: PathBuf,
}

impl Vbd3 {
    /// Look for pages in `dir` instead of `/dev/shm`
    pub fn with_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Vbd3 { dir: dir.into() }
    }
}

impl Default for Vbd3 {
    fn default() -> Self {
        Self::with_dir(SHM_DIR)
    }
}

impl StatsSource for Vbd3 {
    fn discovery_dir(&self) -> &Path {
        &self.dir
    }

    fn parse_entry(&self, name: &str) -> Option<VbdId> {
        ENTRY.parse(name)
    }

    fn bind(&self, id: VbdId) -> io::Result<Box<dyn Binding>> {
        let page = ShmPage::open(device_path(&self.dir, PREFIX, id))?;
        Ok(Box::new(Vbd3Binding { page }))
    }

    fn supports_low_memory_mode(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct Vbd3Binding {
    page: ShmPage,
}

impl Binding for Vbd3Binding {
    fn read(&mut self) -> io::Result<Sample> {
        decode_blkback_stats(&self.page.snapshot()?)
    }
}
