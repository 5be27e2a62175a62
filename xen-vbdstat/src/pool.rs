//! Backend memory pools shared by groups of VBDs
use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf}
};

use log::warn;

use crate::{source::invalid_data, Registry, VbdId};

fn read_count(path: &Path) -> io::Result<u64> {
    let s = crate::source::read_line(path)?;
    s.trim()
        .parse()
        .map_err(|_| invalid_data(format!("{}: bad count {:?}",
                                          path.display(), s)))
}

/// One backend memory pool and the devices drawing from it.
#[derive(Debug)]
pub struct Pool {
    name: String,
    size: u64,
    free: u64,
    members: Vec<VbdId>,
}

impl Pool {
    /// Read a pool's counters.  The size is only read here.
    fn open(dir: &Path, name: &str) -> io::Result<Self> {
        let pool_dir = dir.join(name);
        let size = read_count(&pool_dir.join("size"))?;
        let free = read_count(&pool_dir.join("free"))?;
        Ok(Pool {
            name: name.to_owned(),
            size,
            free,
            members: Vec::new()
        })
    }

    fn refresh(&mut self, dir: &Path) -> io::Result<()> {
        self.free = read_count(&dir.join(&self.name).join("free"))?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn free(&self) -> u64 {
        self.free
    }

    pub fn in_use(&self) -> u64 {
        self.size.saturating_sub(self.free)
    }

    /// Devices currently using this pool, sorted
    pub fn members(&self) -> &[VbdId] {
        &self.members
    }
}

/// All pools in use by tracked devices, keyed by name.
#[derive(Debug)]
pub struct Pools {
    dir: PathBuf,
    pools: BTreeMap<String, Pool>,
}

impl Pools {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Pools { dir: dir.into(), pools: BTreeMap::new() }
    }

    /// Bring pool membership in line with the registry.
    ///
    /// Pools are created the first time a device names them, and dropped
    /// once no tracked device uses them.  A pool whose counters can't be
    /// read is left out; its devices are still reported.
    pub fn sync(&mut self, registry: &Registry) {
        for pool in self.pools.values_mut() {
            pool.members.clear();
        }
        for device in registry.iter() {
            let name = match device.pool() {
                Some(name) => name,
                None => continue
            };
            if !self.pools.contains_key(name) {
                match Pool::open(&self.dir, name) {
                    Ok(pool) => {
                        self.pools.insert(name.to_owned(), pool);
                    }
                    Err(e) => {
                        warn!("cannot read pool {}: {}", name, e);
                        continue;
                    }
                }
            }
            if let Some(pool) = self.pools.get_mut(name) {
                pool.members.push(device.id());
            }
        }
        self.pools.retain(|_, pool| !pool.members.is_empty());
        for pool in self.pools.values_mut() {
            pool.members.sort();
        }
    }

    /// Re-read every pool's free count.  A pool that fails keeps its last
    /// value.
    pub fn refresh(&mut self) {
        for pool in self.pools.values_mut() {
            if let Err(e) = pool.refresh(&self.dir) {
                warn!("cannot refresh pool {}: {}", pool.name, e);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Pool> {
        self.pools.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn clear(&mut self) {
        self.pools.clear();
    }
}
