//! Storage I/O statistics for Xen virtual block devices
//!
//! Discovers the VBDs served by a storage backend, keeps a live binding to
//! each one's counters, and turns consecutive samples into per-second rates.
//! The backend is chosen at startup as a [`source::StatsSource`].

mod device;
mod filter;
mod monitor;
mod pool;
mod registry;
pub mod source;
mod stats;

pub use crate::device::{Device, RingStats, Sample, VbdId};
pub use crate::filter::{Filter, Filters};
pub use crate::monitor::{bind_device, Cycle, Monitor, Report, Settings, State};
pub use crate::pool::{Pool, Pools};
pub use crate::registry::Registry;
pub use crate::source::{candidates, scan, Binding, SourceKind, StatsSource};
pub use crate::stats::{Statistics, SECTOR_SIZE, UNIT_MB};
