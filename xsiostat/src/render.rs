//! Plain text table output
use std::{
    collections::HashSet,
    io::{self, Write}
};

use xen_vbdstat::{Cycle, Report, Statistics, VbdId};

/// Short name for a throughput unit, for the column headers
fn unit_label(unit: u32) -> String {
    match unit {
        1 => "B".to_owned(),
        1_000 => "kB".to_owned(),
        1_000_000 => "MB".to_owned(),
        1_000_000_000 => "GB".to_owned(),
        1_024 => "KiB".to_owned(),
        1_048_576 => "MiB".to_owned(),
        1_073_741_824 => "GiB".to_owned(),
        n => format!("{}B", n),
    }
}

/// Prints one row per device per cycle to `out`.
pub struct TableRenderer<W: Write> {
    out: W,
    unit: String,
}

impl<W: Write> TableRenderer<W> {
    pub fn new(out: W, unit: u32) -> Self {
        TableRenderer { out, unit: unit_label(unit) }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }

    fn header(&mut self, ring: bool, lmm: bool) -> io::Result<()> {
        let rate_r = format!("r{}/s", self.unit);
        let rate_w = format!("w{}/s", self.unit);
        write!(self.out, "{:>5} {:>6} {:>10} {:>10} {:>10} {:>10} {:>7} {:>7}",
               "DOM", "VBD", "r/s", "w/s", rate_r, rate_w, "rAvgQ", "wAvgQ")?;
        if lmm {
            write!(self.out, " {:>3}", "lmm")?;
        }
        write!(self.out, " {:>5} {:>5}", "r_inf", "w_inf")?;
        if ring {
            write!(self.out, " {:>9}", "ring")?;
        }
        writeln!(self.out)
    }

    fn row(&mut self, s: &Statistics, ring: bool, lmm: bool) -> io::Result<()> {
        let id = s.id();
        write!(self.out,
               "{:>5} {:>6} {:>10.2} {:>10.2} {:>10.2} {:>10.2} {:>7.2} {:>7.2}",
               id.domid, id.vbdid, s.reads_per_second(), s.writes_per_second(),
               s.units_per_second_read(), s.units_per_second_write(),
               s.avg_queue_read(), s.avg_queue_write())?;
        if lmm {
            let flag = match s.low_memory_mode() {
                Some(true) => "yes",
                Some(false) => "no",
                None => "-"
            };
            write!(self.out, " {:>3}", flag)?;
        }
        write!(self.out, " {:>5} {:>5}", s.inflight_read(), s.inflight_write())?;
        if ring {
            match s.ring() {
                Some(r) => write!(self.out, " {:>4}/{:<4}", r.in_use(), r.size)?,
                None => write!(self.out, " {:>9}", "-")?
            }
        }
        writeln!(self.out)
    }
}

impl<W: Write> Report for TableRenderer<W> {
    fn report(&mut self, cycle: &Cycle<'_>) -> io::Result<()> {
        let ring = cycle.stats.iter().any(|s| s.ring().is_some());
        let lmm = cycle.low_memory_mode;
        writeln!(self.out)?;
        self.header(ring, lmm)?;

        // Devices are listed under their pool, then the rest
        let mut shown = HashSet::<VbdId>::new();
        for pool in cycle.pools.iter().flat_map(|p| p.iter()) {
            writeln!(self.out, "pool {}: {} of {} pages in use",
                     pool.name(), pool.in_use(), pool.size())?;
            for id in pool.members() {
                if let Ok(i) = cycle.stats.binary_search_by_key(id,
                                                                Statistics::id)
                {
                    self.row(&cycle.stats[i], ring, lmm)?;
                    shown.insert(*id);
                }
            }
        }
        for s in cycle.stats.iter().filter(|s| !shown.contains(&s.id())) {
            self.row(s, ring, lmm)?;
        }
        self.out.flush()
    }

    fn idle(&mut self) -> io::Result<()> {
        writeln!(self.out, "No VBDs to monitor")?;
        self.out.flush()
    }
}
