//! The poll cycle driver
use std::io;

use log::{debug, info, warn};

use crate::{
    source::{scan, StatsSource},
    Device,
    Filters,
    Pools,
    Registry,
    Statistics,
    VbdId,
    UNIT_MB
};

/// Whether the monitor currently has anything to report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// No devices are tracked
    Idle,
    Reporting,
}

/// Receives the output of each poll cycle.
pub trait Report {
    /// One cycle's worth of statistics.  Only called when at least one
    /// device is reported.
    fn report(&mut self, cycle: &Cycle<'_>) -> io::Result<()>;

    /// The monitor has just run out of devices.  Called once per transition,
    /// not once per cycle.
    fn idle(&mut self) -> io::Result<()>;
}

/// Everything reported for one poll cycle.
#[derive(Debug)]
pub struct Cycle<'a> {
    /// Seconds since the previous cycle
    pub etime: f64,
    /// One entry per device, sorted by id
    pub stats: Vec<Statistics>,
    /// Set when the source groups devices by backend pool
    pub pools: Option<&'a Pools>,
    /// Whether [`Statistics::low_memory_mode`] is meaningful
    pub low_memory_mode: bool,
}

/// Settings fixed at startup
#[derive(Clone, Copy, Debug)]
pub struct Settings {
    /// Look for new devices at the start of every cycle
    pub rescan: bool,
    /// Bytes per throughput unit
    pub unit: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings { rescan: false, unit: UNIT_MB }
    }
}

/// Bind `id` and take its first sample.
///
/// The device is dropped, releasing whatever it acquired, if either step
/// fails.
pub fn bind_device(source: &dyn StatsSource, id: VbdId) -> io::Result<Device> {
    let mut device = Device::new(id, source.bind(id)?);
    device.update()?;
    Ok(device)
}

/// Tracks VBDs across poll cycles and computes their statistics.
#[derive(Debug)]
pub struct Monitor {
    source: Box<dyn StatsSource>,
    filters: Filters,
    settings: Settings,
    registry: Registry,
    pools: Option<Pools>,
    /// Time of the previous cycle, in seconds on a monotonic clock
    last: Option<f64>,
    /// `None` until the first discovery
    state: Option<State>,
    running: bool,
    reports: u64,
}

impl Monitor {
    pub fn new(source: Box<dyn StatsSource>, filters: Filters,
               settings: Settings) -> Self
    {
        let pools = source.pool_dir().map(Pools::new);
        Monitor {
            source,
            filters,
            settings,
            registry: Registry::new(),
            pools,
            last: None,
            state: None,
            running: true,
            reports: 0,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pools(&self) -> Option<&Pools> {
        self.pools.as_ref()
    }

    pub fn state(&self) -> State {
        self.state.unwrap_or(State::Idle)
    }

    /// Number of cycles reported so far
    pub fn reports(&self) -> u64 {
        self.reports
    }

    /// False once the monitor has nothing left to do.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Stop after the current cycle
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Bind every newly appeared device that passes the filters.
    ///
    /// Devices already tracked are left alone.  Per-device failures are
    /// skipped; only a failure to list the discovery directory is returned.
    /// Returns the ids of the devices added, each already sampled once.
    pub fn discover(&mut self) -> io::Result<Vec<VbdId>> {
        let mut added = Vec::new();
        for id in scan(&*self.source, &self.filters)? {
            if self.registry.find(id).is_some() {
                continue;
            }
            match bind_device(&*self.source, id) {
                Ok(device) => {
                    if self.registry.insert(device) {
                        added.push(id);
                    }
                }
                // Placeholder devices have no backend yet
                Err(e) if e.kind() == io::ErrorKind::NotFound => (),
                Err(e) => debug!("cannot bind VBD {}: {}", id, e)
            }
        }
        if let Some(pools) = self.pools.as_mut() {
            pools.sync(&self.registry);
        }
        Ok(added)
    }

    /// Perform the initial discovery, at time `now`.
    pub fn start<R: Report>(&mut self, now: f64, report: &mut R)
        -> io::Result<State>
    {
        self.discover()?;
        self.last = Some(now);
        self.transition(report)
    }

    /// Move to the state matching the registry's contents, announcing
    /// every entry into [`State::Idle`].
    fn transition<R: Report>(&mut self, report: &mut R) -> io::Result<State> {
        let next = if self.registry.is_empty() {
            State::Idle
        } else {
            State::Reporting
        };
        if next == State::Idle && self.state != Some(State::Idle) {
            report.idle()?;
            if !self.settings.rescan {
                // Without rescanning nothing can ever show up
                self.running = false;
            }
        }
        self.state = Some(next);
        Ok(next)
    }

    /// Run one poll cycle at time `now`.
    ///
    /// Devices found by this cycle's rescan were sampled while binding, so
    /// they are first reported by the next cycle.  If the rescan can't list
    /// the discovery directory while devices are tracked, the cycle is
    /// skipped: samples and the last cycle's time are left alone, so the
    /// next cycle's rates span both intervals.  With nothing tracked that
    /// failure is returned.
    pub fn cycle<R: Report>(&mut self, now: f64, report: &mut R)
        -> io::Result<State>
    {
        let fresh = if self.settings.rescan {
            match self.discover() {
                Ok(fresh) => fresh,
                Err(e) if !self.registry.is_empty() => {
                    warn!("skipping cycle, cannot rescan: {}", e);
                    return Ok(self.state());
                }
                Err(e) => return Err(e)
            }
        } else {
            Vec::new()
        };
        let etime = self.last.map(|last| now - last).unwrap_or(0.0);
        self.last = Some(now);

        let evicted = self.registry.sweep(|device| {
            if fresh.contains(&device.id()) {
                return true;
            }
            match device.update() {
                Ok(()) => true,
                Err(e) => {
                    info!("VBD {} went away: {}", device.id(), e);
                    false
                }
            }
        });
        if let Some(pools) = self.pools.as_mut() {
            if evicted > 0 {
                pools.sync(&self.registry);
            }
            pools.refresh();
        }

        let state = self.transition(report)?;
        if state == State::Idle {
            return Ok(state);
        }

        let mut stats = self.registry.iter()
            .filter(|d| !fresh.contains(&d.id()))
            .map(|d| Statistics::compute(d, etime, self.settings.unit))
            .collect::<Vec<_>>();
        if stats.is_empty() {
            return Ok(state);
        }
        stats.sort_by_key(Statistics::id);
        let cycle = Cycle {
            etime,
            stats,
            pools: self.pools.as_ref(),
            low_memory_mode: self.source.supports_low_memory_mode(),
        };
        report.report(&cycle)?;
        self.reports += 1;
        Ok(state)
    }

    /// Release every device.
    pub fn shutdown(&mut self) {
        self.registry.clear();
        if let Some(pools) = self.pools.as_mut() {
            pools.clear();
        }
        self.running = false;
    }
}

#[cfg(test)]
mod t {
    use std::{
        cell::{Cell, RefCell},
        collections::HashMap,
        fs,
        path::{Path, PathBuf},
        rc::Rc
    };

    use lazy_static::lazy_static;

    use super::*;
    use crate::{
        device::fake::FakeBinding,
        source::{Binding, EntryPattern},
        Filter,
        Sample
    };

    lazy_static! {
        static ref ENTRY: EntryPattern = EntryPattern::new("fake");
    }

    /// Devices appear as empty files; each can be bound at most once.
    #[derive(Clone, Debug)]
    struct FakeSource {
        dir: PathBuf,
        pending: Rc<RefCell<HashMap<VbdId, FakeBinding>>>,
    }

    impl FakeSource {
        fn new(dir: &Path) -> Self {
            FakeSource { dir: dir.to_owned(), pending: Default::default() }
        }

        fn attach(&self, domid: u32, vbdid: u32, binding: FakeBinding) {
            self.placeholder(domid, vbdid);
            self.pending.borrow_mut().insert(VbdId::new(domid, vbdid), binding);
        }

        fn placeholder(&self, domid: u32, vbdid: u32) {
            let name = format!("fake-{}-{}", domid, vbdid);
            fs::write(self.dir.join(name), b"").unwrap();
        }
    }

    impl StatsSource for FakeSource {
        fn discovery_dir(&self) -> &Path {
            &self.dir
        }

        fn parse_entry(&self, name: &str) -> Option<VbdId> {
            ENTRY.parse(name)
        }

        fn bind(&self, id: VbdId) -> io::Result<Box<dyn Binding>> {
            self.pending.borrow_mut()
                .remove(&id)
                .map(|b| Box::new(b) as Box<dyn Binding>)
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn supports_low_memory_mode(&self) -> bool {
            false
        }
    }

    #[derive(Debug, Default)]
    struct Recorder {
        reports: Vec<Vec<VbdId>>,
        etimes: Vec<f64>,
        rates: Vec<Vec<f64>>,
        idles: usize,
    }

    impl Report for Recorder {
        fn report(&mut self, cycle: &Cycle<'_>) -> io::Result<()> {
            self.reports.push(cycle.stats.iter().map(Statistics::id).collect());
            self.rates.push(cycle.stats.iter()
                .map(Statistics::reads_per_second)
                .collect());
            self.etimes.push(cycle.etime);
            Ok(())
        }

        fn idle(&mut self) -> io::Result<()> {
            self.idles += 1;
            Ok(())
        }
    }

    fn monitor(source: &FakeSource, rescan: bool) -> Monitor {
        let settings = Settings { rescan, ..Default::default() };
        Monitor::new(Box::new(source.clone()), Filters::default(), settings)
    }

    /// A binding that can be read `n` times, counting its releases
    fn lasting(n: usize, releases: &Rc<Cell<usize>>) -> FakeBinding {
        let mut b = FakeBinding::new(vec![Sample::default(); n]);
        b.releases = Some(releases.clone());
        b
    }

    #[test]
    fn nothing_to_monitor() {
        let tmp = tempfile::tempdir().unwrap();
        let source = FakeSource::new(tmp.path());
        let mut m = monitor(&source, false);
        let mut r = Recorder::default();
        assert_eq!(m.start(0.0, &mut r).unwrap(), State::Idle);
        assert_eq!(r.idles, 1);
        assert!(!m.is_running());
    }

    #[test]
    fn missing_discovery_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let source = FakeSource::new(&tmp.path().join("nonexistent"));
        let mut m = monitor(&source, false);
        let mut r = Recorder::default();
        assert!(m.start(0.0, &mut r).is_err());
        assert_eq!(r.idles, 0);
    }

    #[test]
    fn placeholders_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let source = FakeSource::new(tmp.path());
        source.placeholder(3, 768);
        source.attach(4, 768, FakeBinding::forever());
        let mut m = monitor(&source, false);
        let mut r = Recorder::default();
        assert_eq!(m.start(0.0, &mut r).unwrap(), State::Reporting);
        assert_eq!(m.registry().ids(), vec![VbdId::new(4, 768)]);
        assert_eq!(r.idles, 0);
    }

    /// A device that binds but can't be sampled is released immediately
    #[test]
    fn failed_initial_sample() {
        let tmp = tempfile::tempdir().unwrap();
        let releases = Rc::new(Cell::new(0));
        let source = FakeSource::new(tmp.path());
        source.attach(1, 768, lasting(0, &releases));
        let mut m = monitor(&source, false);
        let mut r = Recorder::default();
        m.start(0.0, &mut r).unwrap();
        assert!(m.registry().is_empty());
        assert_eq!(releases.get(), 1);
    }

    #[test]
    fn filters() {
        let tmp = tempfile::tempdir().unwrap();
        let source = FakeSource::new(tmp.path());
        source.attach(5, 768, FakeBinding::forever());
        source.attach(6, 768, FakeBinding::forever());
        source.attach(5, 832, FakeBinding::forever());
        let domains: Filter = [5].iter().copied().collect();
        let filters = Filters::new(domains, Filter::new());
        let mut m = Monitor::new(Box::new(source.clone()), filters,
                                 Settings::default());
        let mut r = Recorder::default();
        m.start(0.0, &mut r).unwrap();
        assert_eq!(m.registry().ids(),
                   vec![VbdId::new(5, 768), VbdId::new(5, 832)]);
    }

    #[test]
    fn rates_use_elapsed_time() {
        let tmp = tempfile::tempdir().unwrap();
        let source = FakeSource::new(tmp.path());
        let samples = vec![
            Sample { rd_reqs: 1000, ..Default::default() },
            Sample { rd_reqs: 1200, ..Default::default() },
        ];
        source.attach(1, 768, FakeBinding::new(samples));
        let mut m = monitor(&source, false);
        let mut r = Recorder::default();
        m.start(10.0, &mut r).unwrap();
        assert_eq!(m.cycle(12.0, &mut r).unwrap(), State::Reporting);
        assert_eq!(r.etimes, vec![2.0]);
        assert_eq!(r.rates, vec![vec![100.0]]);
    }

    /// A detached device drops out of the very cycle that notices it, and
    /// the rest keep reporting.
    #[test]
    fn eviction_before_report() {
        let tmp = tempfile::tempdir().unwrap();
        let releases = Rc::new(Cell::new(0));
        let source = FakeSource::new(tmp.path());
        source.attach(2, 768, lasting(2, &releases));
        source.attach(1, 768, FakeBinding::forever());
        let mut m = monitor(&source, false);
        let mut r = Recorder::default();
        m.start(0.0, &mut r).unwrap();
        m.cycle(1.0, &mut r).unwrap();
        m.cycle(2.0, &mut r).unwrap();
        assert_eq!(r.reports, vec![
            vec![VbdId::new(1, 768), VbdId::new(2, 768)],
            vec![VbdId::new(1, 768)],
        ]);
        assert_eq!(releases.get(), 1);
        assert!(m.is_running());
    }

    #[test]
    fn last_device_leaves() {
        let tmp = tempfile::tempdir().unwrap();
        let releases = Rc::new(Cell::new(0));
        let source = FakeSource::new(tmp.path());
        source.attach(1, 768, lasting(2, &releases));
        let mut m = monitor(&source, false);
        let mut r = Recorder::default();
        m.start(0.0, &mut r).unwrap();
        m.cycle(1.0, &mut r).unwrap();
        assert_eq!(m.cycle(2.0, &mut r).unwrap(), State::Idle);
        assert!(!m.is_running());
        // Further cycles stay quiet
        m.cycle(3.0, &mut r).unwrap();
        assert_eq!(r.idles, 1);
        assert_eq!(r.reports.len(), 1);
        assert_eq!(releases.get(), 1);
    }

    #[test]
    fn rescan_finds_new_devices() {
        let tmp = tempfile::tempdir().unwrap();
        let releases = Rc::new(Cell::new(0));
        let source = FakeSource::new(tmp.path());
        let mut m = monitor(&source, true);
        let mut r = Recorder::default();
        assert_eq!(m.start(0.0, &mut r).unwrap(), State::Idle);
        assert_eq!(m.cycle(1.0, &mut r).unwrap(), State::Idle);
        assert_eq!(r.idles, 1);
        assert!(m.is_running());

        source.attach(7, 51712, lasting(3, &releases));
        // Sampled while binding; reported from the next cycle on
        assert_eq!(m.cycle(2.0, &mut r).unwrap(), State::Reporting);
        assert!(r.reports.is_empty());
        m.cycle(3.0, &mut r).unwrap();
        m.cycle(4.0, &mut r).unwrap();
        assert_eq!(r.reports, vec![vec![VbdId::new(7, 51712)]; 2]);
        assert_eq!(m.reports(), 2);

        // Gone again: announced a second time, but keeps waiting
        assert_eq!(m.cycle(5.0, &mut r).unwrap(), State::Idle);
        assert_eq!(r.idles, 2);
        assert!(m.is_running());
        assert_eq!(releases.get(), 1);
    }

    /// A device found by a rescan gets its first rate over a whole interval
    #[test]
    fn rescan_first_rate() {
        let tmp = tempfile::tempdir().unwrap();
        let source = FakeSource::new(tmp.path());
        source.attach(1, 1, FakeBinding::forever());
        let mut m = monitor(&source, true);
        let mut r = Recorder::default();
        m.start(0.0, &mut r).unwrap();
        m.cycle(10.0, &mut r).unwrap();

        let samples = vec![
            Sample { rd_reqs: 0, ..Default::default() },
            Sample { rd_reqs: 500, ..Default::default() },
            Sample { rd_reqs: 1500, ..Default::default() },
        ];
        source.attach(2, 2, FakeBinding::new(samples));
        m.cycle(20.0, &mut r).unwrap();
        assert_eq!(r.reports[1], vec![VbdId::new(1, 1)]);
        assert_eq!(m.registry().len(), 2);

        m.cycle(30.0, &mut r).unwrap();
        assert_eq!(r.reports[2], vec![VbdId::new(1, 1), VbdId::new(2, 2)]);
        assert_eq!(r.etimes[2], 10.0);
        assert_eq!(r.rates[2], vec![0.0, 50.0]);
        m.cycle(35.0, &mut r).unwrap();
        assert_eq!(r.rates[3], vec![0.0, 200.0]);
    }

    /// An unreadable discovery directory skips the cycle while devices are
    /// tracked, and the next cycle covers both intervals.
    #[test]
    fn failed_rescan_skips_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let source = FakeSource::new(tmp.path());
        let samples = vec![
            Sample { rd_reqs: 0, ..Default::default() },
            Sample { rd_reqs: 100, ..Default::default() },
            Sample { rd_reqs: 300, ..Default::default() },
        ];
        source.attach(1, 768, FakeBinding::new(samples));
        let mut m = monitor(&source, true);
        let mut r = Recorder::default();
        m.start(0.0, &mut r).unwrap();
        m.cycle(1.0, &mut r).unwrap();

        fs::remove_dir_all(tmp.path()).unwrap();
        assert_eq!(m.cycle(2.0, &mut r).unwrap(), State::Reporting);
        assert_eq!(m.reports(), 1);
        assert_eq!(m.registry().ids(), vec![VbdId::new(1, 768)]);

        fs::create_dir(tmp.path()).unwrap();
        m.cycle(3.0, &mut r).unwrap();
        assert_eq!(r.etimes, vec![1.0, 2.0]);
        assert_eq!(r.rates, vec![vec![100.0], vec![100.0]]);
        assert!(m.is_running());
    }

    /// With nothing tracked, failing to rescan can't be papered over
    #[test]
    fn failed_rescan_while_idle() {
        let tmp = tempfile::tempdir().unwrap();
        let source = FakeSource::new(tmp.path());
        let mut m = monitor(&source, true);
        let mut r = Recorder::default();
        assert_eq!(m.start(0.0, &mut r).unwrap(), State::Idle);
        fs::remove_dir_all(tmp.path()).unwrap();
        let e = m.cycle(1.0, &mut r).unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::NotFound);
        assert_eq!(m.reports(), 0);
    }

    /// An already tracked device is not bound a second time
    #[test]
    fn rescan_keeps_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let source = FakeSource::new(tmp.path());
        source.attach(1, 768, FakeBinding::forever());
        let mut m = monitor(&source, true);
        let mut r = Recorder::default();
        m.start(0.0, &mut r).unwrap();
        for i in 1..5 {
            m.cycle(i as f64, &mut r).unwrap();
        }
        assert_eq!(m.registry().len(), 1);
        assert_eq!(r.reports.len(), 4);
    }

    #[test]
    fn shutdown_releases_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let releases = Rc::new(Cell::new(0));
        let source = FakeSource::new(tmp.path());
        for v in 0..3 {
            source.attach(1, v, lasting(100, &releases));
        }
        let mut m = monitor(&source, true);
        let mut r = Recorder::default();
        m.start(0.0, &mut r).unwrap();
        m.shutdown();
        assert!(m.registry().is_empty());
        assert!(!m.is_running());
        assert_eq!(releases.get(), 3);
    }
}
