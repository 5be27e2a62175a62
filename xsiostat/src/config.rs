//! Persistent defaults, overridden by the command line
use log::warn;
use serde_derive::{Deserialize, Serialize};
use xen_vbdstat::{SourceKind, UNIT_MB};

const APP_NAME: &str = "xsiostat";

/// Where VBD counters are read from
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq,
         clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// tapdisk3's per-VBD pages in /dev/shm
    Vbd3,
    /// tapdisk3's per-process pages, located through xenstore
    Tapdisk3,
    /// blkback and blktap2 counters in sysfs
    Blkback,
}

impl From<Source> for SourceKind {
    fn from(source: Source) -> Self {
        match source {
            Source::Vbd3 => SourceKind::Vbd3,
            Source::Tapdisk3 => SourceKind::Tapdisk3,
            Source::Blkback => SourceKind::Blkback,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Poll interval, in the same syntax as `--interval`
    pub interval: String,
    /// Bytes per throughput unit
    pub unit: u32,
    pub source: Source,
    pub rescan: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            interval: "1000".to_owned(),
            unit: UNIT_MB,
            source: Source::Vbd3,
            rescan: false,
        }
    }
}

/// Load the user's configuration, creating it if it doesn't exist yet.  An
/// unusable file is reported and the built-in defaults used instead.
pub fn load() -> Config {
    match confy::load(APP_NAME, None) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("cannot load configuration: {}", e);
            Config::default()
        }
    }
}
