//! Helpers shared by the integration tests
#![allow(dead_code)]

use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::Path
};

use xen_vbdstat::{Cycle, Report, Statistics, VbdId};

/// Saves everything the monitor reports.
#[derive(Debug, Default)]
pub struct Recorder {
    pub cycles: Vec<Vec<Statistics>>,
    /// Pool name, size, free, and members, per cycle
    pub pools: Vec<Vec<(String, u64, u64, Vec<VbdId>)>>,
    pub idles: usize,
}

impl Recorder {
    pub fn last(&self) -> &[Statistics] {
        self.cycles.last().map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Report for Recorder {
    fn report(&mut self, cycle: &Cycle<'_>) -> io::Result<()> {
        self.cycles.push(cycle.stats.clone());
        let pools = cycle.pools
            .map(|pools| pools.iter()
                .map(|p| (p.name().to_owned(), p.size(), p.free(),
                          p.members().to_vec()))
                .collect())
            .unwrap_or_default();
        self.pools.push(pools);
        Ok(())
    }

    fn idle(&mut self) -> io::Result<()> {
        self.idles += 1;
        Ok(())
    }
}

/// Create or overwrite a zero-filled statistics page and set some of its
/// 64-bit fields, in place so that existing mappings see the change.
pub fn write_page(path: &Path, len: u64, fields: &[(usize, u64)]) {
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .unwrap();
    f.set_len(len).unwrap();
    set_fields(&f, fields);
}

pub fn set_fields(f: &File, fields: &[(usize, u64)]) {
    for &(i, v) in fields {
        f.write_all_at(&v.to_ne_bytes(), i as u64 * 8).unwrap();
    }
}

pub fn update_page(path: &Path, fields: &[(usize, u64)]) {
    let f = OpenOptions::new().write(true).open(path).unwrap();
    set_fields(&f, fields);
}

pub fn write_text(path: &Path, text: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, text).unwrap();
}
