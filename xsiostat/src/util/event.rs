use std::time::Duration;

use anyhow::{Context, Result};
use nix::{
    sys::{
        signal::{SigEvent, SigSet, SigevNotify, Signal},
        timer::{Expiration, Timer, TimerSetTimeFlags},
    },
    time::{clock_gettime, ClockId},
};

#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    /// The poll interval elapsed
    Tick,
    /// SIGINT or SIGTERM
    Quit,
}

/// Delivers an [`Event::Tick`] once per interval.
///
/// The signals involved are blocked and consumed synchronously, so no
/// handler ever runs.  Must be created before any other thread is spawned.
pub struct Ticker {
    mask: SigSet,
    // Disarmed on drop
    _timer: Timer,
}

impl Ticker {
    pub fn new(interval: Duration) -> Result<Self> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGALRM);
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.thread_block().context("blocking signals")?;

        let sev = SigEvent::new(SigevNotify::SigevSignal {
            signal: Signal::SIGALRM,
            si_value: 0,
        });
        let mut timer = Timer::new(ClockId::CLOCK_MONOTONIC, sev)
            .context("creating interval timer")?;
        timer.set(Expiration::Interval(interval.into()),
                  TimerSetTimeFlags::empty())
            .context("arming interval timer")?;
        Ok(Ticker { mask, _timer: timer })
    }

    /// Block until the next tick or termination request.
    pub fn wait(&self) -> Result<Event> {
        match self.mask.wait().context("waiting for the interval timer")? {
            Signal::SIGALRM => Ok(Event::Tick),
            _ => Ok(Event::Quit),
        }
    }
}

/// Seconds on the monotonic clock
pub fn now() -> Result<f64> {
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC)
        .context("reading the monotonic clock")?;
    Ok(ts.tv_sec() as f64 + ts.tv_nsec() as f64 * 1e-9)
}
