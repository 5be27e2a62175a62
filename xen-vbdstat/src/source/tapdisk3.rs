//! tapdisk3 per-process shared memory pages, located through xenstore
use std::{
    io,
    path::{Path, PathBuf}
};

use lazy_static::lazy_static;

use super::{
    decode_tapdisk_stats,
    device_path,
    invalid_data,
    Binding,
    EntryPattern,
    KeyValueStore,
    ShmPage,
    StatsSource,
    XenstoreCli
};
use crate::{Sample, VbdId};

const DEVICES_DIR: &str = "/sys/bus/xen-backend/devices";
const SHM_DIR: &str = "/dev/shm";
const PREFIX: &str = "vbd3";

lazy_static! {
    static ref ENTRY: EntryPattern = EntryPattern::new(PREFIX);
}

/// xenstore key holding the pid of the tapdisk serving a VBD
fn pid_key(id: VbdId) -> String {
    format!("/local/domain/0/backend/vbd3/{}/{}/kthread-pid",
            id.domid, id.vbdid)
}

/// Discovers VBDs from the xen-backend bus and binds each one to the page
/// its tapdisk process keeps under `td3-<pid>/vbd-<domid>-<vbdid>`.
#[derive(Debug)]
pub struct Tapdisk3 {
    devices_dir: PathBuf,
    shm_dir: PathBuf,
    store: Box<dyn KeyValueStore>,
}

impl Tapdisk3 {
    pub fn new<P, Q>(devices_dir: P, shm_dir: Q, store: Box<dyn KeyValueStore>)
        -> Self
        where P: Into<PathBuf>, Q: Into<PathBuf>
    {
        Tapdisk3 {
            devices_dir: devices_dir.into(),
            shm_dir: shm_dir.into(),
            store
        }
    }

    /// Resolve the pid of the tapdisk process serving `id`.
    ///
    /// Disconnected placeholder devices have no pid; that is `NotFound`.
    pub fn tapdisk_pid(&self, id: VbdId) -> io::Result<u32> {
        let value = self.store.read(&pid_key(id))?;
        value.trim()
            .parse()
            .map_err(|_| invalid_data(format!("bad tapdisk pid {:?}", value)))
    }
}

impl Default for Tapdisk3 {
    fn default() -> Self {
        Self::new(DEVICES_DIR, SHM_DIR, Box::new(XenstoreCli::default()))
    }
}

impl StatsSource for Tapdisk3 {
    fn discovery_dir(&self) -> &Path {
        &self.devices_dir
    }

    fn parse_entry(&self, name: &str) -> Option<VbdId> {
        ENTRY.parse(name)
    }

    fn bind(&self, id: VbdId) -> io::Result<Box<dyn Binding>> {
        let pid = self.tapdisk_pid(id)?;
        let dir = self.shm_dir.join(format!("td3-{}", pid));
        let page = ShmPage::open(device_path(&dir, "vbd", id))?;
        Ok(Box::new(Tapdisk3Binding { pid, page }))
    }

    fn supports_low_memory_mode(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct Tapdisk3Binding {
    pid: u32,
    page: ShmPage,
}

impl Binding for Tapdisk3Binding {
    fn read(&mut self) -> io::Result<Sample> {
        let pid = self.pid;
        self.page.snapshot()
            .and_then(|buf| decode_tapdisk_stats(&buf))
            .map_err(|e| io::Error::new(e.kind(),
                                        format!("tapdisk {}: {}", pid, e)))
    }
}
