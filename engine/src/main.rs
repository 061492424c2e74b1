// Copyright 2024 Oxide Computer Company
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use slog::{info, warn, Logger};

use sparemap::metadata::MetadataSnapshot;
use sparemap::store::{CopyStatus, MetadataStore};
use sparemap::*;

#[derive(Clone, Copy, Debug, PartialEq)]
enum CliReason {
    Manual,
    Preventive,
}

impl std::str::FromStr for CliReason {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "manual" => CliReason::Manual,
            "preventive" => CliReason::Preventive,
            _ => {
                bail!("reason must be manual or preventive");
            }
        })
    }
}

impl From<CliReason> for RemapReason {
    fn from(r: CliReason) -> Self {
        match r {
            CliReason::Manual => RemapReason::Manual,
            CliReason::Preventive => RemapReason::Preventive,
        }
    }
}

#[derive(Debug, clap::Args)]
struct Devices {
    /// File or block device holding the data
    #[clap(short, long, name = "MAIN", action)]
    main: PathBuf,

    /// File or block device holding spare sectors and metadata
    #[clap(short, long, name = "SPARE", action)]
    spare: PathBuf,

    #[clap(long, default_value = "512", action)]
    sector_size: usize,

    /// TOML configuration; defaults are used for anything missing
    #[clap(short, long, name = "CONFIG", action)]
    config: Option<PathBuf>,
}

#[derive(Debug, Parser)]
#[clap(about = "sector health scanner and bad-sector remapper")]
enum Args {
    /// Initialize the spare device
    Format {
        #[clap(flatten)]
        devices: Devices,

        /// Create the main file with this many sectors
        #[clap(long, action)]
        create_main: Option<u64>,

        /// Create the spare file with this many sectors
        #[clap(long, action)]
        create_spare: Option<u64>,
    },
    /// Attach, scan in the background, and detach on Ctrl-C
    Run {
        #[clap(flatten)]
        devices: Devices,

        /// Detach after this long instead of waiting for Ctrl-C
        #[clap(long, action)]
        duration: Option<humantime::Duration>,

        /// Log a health report this often
        #[clap(long, default_value = "1m", action)]
        report_every: humantime::Duration,
    },
    /// Show the state of every metadata copy
    Dump {
        #[clap(flatten)]
        devices: Devices,

        /// Also list the remap table from the best copy
        #[clap(long, action)]
        remaps: bool,
    },
    /// Rewrite bad or stale metadata copies
    Repair {
        #[clap(flatten)]
        devices: Devices,
    },
    /// Print a health report
    Status {
        #[clap(flatten)]
        devices: Devices,

        /// Scan this many chunks before reporting
        #[clap(long, default_value = "0", action)]
        scan_cycles: u32,

        /// Number of at-risk sectors to list
        #[clap(long, default_value = "10", action)]
        top: usize,

        /// Also write the report to this file as JSON
        #[clap(long, name = "FILE", action)]
        json: Option<PathBuf>,
    },
    /// Move a sector to the spare device
    Remap {
        #[clap(flatten)]
        devices: Devices,

        #[clap(long, action)]
        sector: u64,

        #[clap(long, default_value = "manual", action)]
        reason: CliReason,
    },
}

fn load_config(path: &Option<PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(p) => EngineConfig::from_toml_file(p),
        None => Ok(EngineConfig::default()),
    }
}

fn open_device(
    path: &Path,
    sector_size: usize,
) -> Result<Arc<dyn BlockDevice>> {
    let dev = FileBlockDevice::open(path, sector_size)
        .with_context(|| format!("opening {:?}", path))?;
    Ok(Arc::new(dev))
}

async fn attach(devices: &Devices, log: &Logger) -> Result<Engine> {
    let config = load_config(&devices.config)?;
    let main = open_device(&devices.main, devices.sector_size)?;
    let spare = open_device(&devices.spare, devices.sector_size)?;
    let engine =
        Engine::attach(main, spare, config, Arc::new(SystemClock), log).await?;
    if let Some(r) = &engine.attach_info().repair {
        info!(log, "attach repaired metadata copies {:?}", r.repaired);
    }
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::try_parse()?;
    let log = build_logger();

    match args {
        Args::Format {
            devices,
            create_main,
            create_spare,
        } => {
            let config = load_config(&devices.config)?;
            let ss = devices.sector_size;
            if let Some(n) = create_main {
                FileBlockDevice::create(&devices.main, ss, n)?;
            }
            if let Some(n) = create_spare {
                FileBlockDevice::create(&devices.spare, ss, n)?;
            }
            let main = open_device(&devices.main, devices.sector_size)?;
            let spare = open_device(&devices.spare, devices.sector_size)?;
            let engine =
                Engine::format(main, spare, config, Arc::new(SystemClock), &log)
                    .await?;
            println!("spare id {}", engine.attach_info().spare_id);
            engine.detach().await?;
        }

        Args::Run {
            devices,
            duration,
            report_every,
        } => {
            let engine = attach(&devices, &log).await?;
            engine.start();

            let deadline = async {
                match duration {
                    Some(d) => tokio::time::sleep(d.into()).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(deadline);
            let mut ticker = tokio::time::interval(report_every.into());
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!(log, "interrupted, detaching");
                        break;
                    }
                    _ = &mut deadline => {
                        info!(log, "run time elapsed, detaching");
                        break;
                    }
                    _ = ticker.tick() => {
                        let r = engine.report(5);
                        info!(log, "health";
                            "state" => r.scanner_state.to_string(),
                            "coverage" => r.coverage_percent,
                            "warnings" => r.active_warnings,
                            "high_risk" => r.high_risk_sectors,
                            "remaps" => r.remaps);
                        let dropped = engine.compact_health();
                        if dropped > 0 {
                            info!(log, "compacted {} health records", dropped);
                        }
                        if let Err(e) = engine.flush_metadata().await {
                            warn!(log, "periodic metadata flush failed: {}", e);
                        }
                    }
                }
            }
            engine.detach().await?;
        }

        Args::Dump { devices, remaps } => {
            let config = load_config(&devices.config)?;
            let spare = open_device(&devices.spare, devices.sector_size)?;
            let store = MetadataStore::new(
                spare,
                &config.metadata,
                &config.repair,
                Arc::new(SystemClock),
                &log,
            )?;
            println!(
                "{:>4} {:>10} {:>8} {:>20}  STATUS",
                "COPY", "SECTOR", "SEQ", "TIME"
            );
            for c in store.inspect().await {
                match &c.status {
                    CopyStatus::Valid {
                        sequence_number,
                        timestamp,
                        remaps,
                    } => {
                        let t = format_timestamp(*timestamp);
                        println!(
                            "{:>4} {:>10} {:>8} {:>20}  ok, {} remaps",
                            c.copy_index,
                            c.start_sector,
                            sequence_number,
                            t,
                            remaps
                        );
                    }
                    other => println!(
                        "{:>4} {:>10} {:>8} {:>20}  {:?}",
                        c.copy_index, c.start_sector, "-", "-", other
                    ),
                }
            }

            if remaps {
                let best = store.read_best_copy().await?;
                print_remaps(&best.snapshot);
            }
        }

        Args::Repair { devices } => {
            let engine = attach(&devices, &log).await?;
            let report = engine.run_repair().await;
            println!(
                "authoritative seq {:?}: checked {}, \
                 repaired {:?}, failed {:?}",
                report.authoritative_sequence,
                report.copies_checked,
                report.repaired,
                report.failed
            );
            let max_attempts = engine.config().repair.max_attempts;
            engine.detach().await?;
            report.into_result(max_attempts)?;
        }

        Args::Status {
            devices,
            scan_cycles,
            top,
            json,
        } => {
            let engine = attach(&devices, &log).await?;
            for _ in 0..scan_cycles {
                engine.run_scan_cycle().await?;
            }
            let report = engine.report(top);
            print!("{}", report);
            if let Some(path) = json {
                write_json(&path, &report, true)?;
                println!("report written to {:?}", path);
            }
            if scan_cycles > 0 {
                engine.detach().await?;
            }
        }

        Args::Remap {
            devices,
            sector,
            reason,
        } => {
            let engine = attach(&devices, &log).await?;
            let spare = engine.remap(sector, reason.into()).await?;
            println!("sector {} remapped to spare sector {}", sector, spare);
            engine.detach().await?;
        }
    }

    Ok(())
}

fn format_timestamp(secs: u64) -> String {
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn print_remaps(snapshot: &MetadataSnapshot) {
    println!(
        "{:>12} {:>12} {:>12} {:>8} {:>6}  FLAGS",
        "ORIGINAL", "SPARE", "REASON", "ACCESS", "ERRORS"
    );
    for e in &snapshot.remaps {
        println!(
            "{:>12} {:>12} {:>12} {:>8} {:>6}  {:#x}",
            e.original_sector,
            e.spare_sector,
            e.reason.to_string(),
            e.access_count,
            e.error_count,
            e.flags
        );
    }
}
