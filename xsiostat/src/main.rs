// vim: tw=80
use std::{
    fs::File,
    io,
    path::PathBuf,
    process::ExitCode,
    time::Duration
};

use anyhow::{anyhow, bail, ensure, Context, Result};
use clap::Parser;
use env_logger::{Builder, Env};
use log::error;
use xen_vbdstat::{Filter, Filters, Monitor, Settings, SourceKind};

mod config;
mod render;
mod util {
    pub mod event;
}

use crate::{
    config::{Config, Source},
    render::TableRenderer,
    util::event::{now, Event, Ticker},
};

/// Report storage I/O statistics for the virtual block devices of a Xen host
#[derive(Debug, Default, clap::Parser)]
struct Cli {
    /// Look for newly attached VBDs on every cycle
    #[clap(short = 'r', long = "rescan")]
    rescan: bool,
    /// Only report VBDs of this domain.  May be repeated.
    #[clap(short = 'd', long = "domain", value_name = "DOMID")]
    domains: Vec<u32>,
    /// Only report VBDs with this device number.  May be repeated, and
    /// requires a domain filter.
    #[clap(short = 'v', long = "vbd", value_name = "VBDID")]
    vbds: Vec<u32>,
    /// Update interval, in milliseconds or with the specified unit
    #[clap(short = 'i', long = "interval")]
    interval: Option<String>,
    /// Open this data file for writing.  Nothing is written to it yet.
    #[clap(short = 'o', long = "output")]
    output: Option<PathBuf>,
    /// Where to read VBD counters from
    #[clap(short = 's', long = "source", value_enum)]
    source: Option<Source>,
    /// Bytes per throughput unit
    #[clap(short = 'u', long = "unit")]
    unit: Option<u32>,
    /// Exit after this many reports.  0 means never.
    #[clap(short = 'c', long = "count", default_value = "0")]
    count: u64,
}

/// Parse a poll interval.  A bare number is in milliseconds.
fn parse_interval(s: &str) -> Result<Duration> {
    let mut s = s.trim().to_owned();
    if s.parse::<u64>().is_ok() {
        // Add the default units
        s.push_str("ms");
    }
    let interval = humanize_rs::duration::parse(&s)
        .map_err(|e| anyhow!("invalid interval {:?}: {:?}", s, e))?;
    ensure!(!interval.is_zero(), "the interval must be positive");
    Ok(interval)
}

/// Everything needed to run, from the command line and the config file
#[derive(Debug)]
struct Options {
    interval: Duration,
    source: SourceKind,
    filters: Filters,
    settings: Settings,
    count: u64,
    output: Option<PathBuf>,
}

impl Options {
    fn new(cli: Cli, cfg: Config) -> Result<Self> {
        if !cli.vbds.is_empty() && cli.domains.is_empty() {
            bail!("VBD filter requires DOM filter");
        }
        let interval = parse_interval(cli.interval.as_deref()
                                      .unwrap_or(&cfg.interval))?;
        let unit = cli.unit.unwrap_or(cfg.unit);
        ensure!(unit > 0, "the unit must be positive");
        let filters = Filters::new(cli.domains.into_iter().collect::<Filter>(),
                                   cli.vbds.into_iter().collect::<Filter>());
        Ok(Options {
            interval,
            source: cli.source.unwrap_or(cfg.source).into(),
            filters,
            settings: Settings { rescan: cli.rescan || cfg.rescan, unit },
            count: cli.count,
            output: cli.output,
        })
    }
}

fn run(opts: Options) -> Result<()> {
    // Reserved for recording raw samples
    let _datafile = opts.output.as_ref()
        .map(|p| File::create(p)
             .with_context(|| format!("creating {}", p.display())))
        .transpose()?;

    let ticker = Ticker::new(opts.interval)?;
    let mut renderer = TableRenderer::new(io::stdout().lock(),
                                          opts.settings.unit);
    let mut monitor = Monitor::new(opts.source.build(), opts.filters,
                                   opts.settings);
    monitor.start(now()?, &mut renderer).context("discovering VBDs")?;

    while monitor.is_running() {
        if ticker.wait()? == Event::Quit {
            break;
        }
        monitor.cycle(now()?, &mut renderer).context("polling VBDs")?;
        if opts.count > 0 && monitor.reports() >= opts.count {
            monitor.stop();
        }
    }
    monitor.shutdown();
    Ok(())
}

fn main() -> ExitCode {
    let cli: Cli = Cli::parse();

    // Warnings only, so they don't get lost among the table rows
    Builder::from_env(Env::default().default_filter_or("warn")).init();

    match Options::new(cli, config::load()).and_then(run) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
