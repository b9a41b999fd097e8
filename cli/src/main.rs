//! `starwatch` command-line front end

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use starwatch_observatory::{
    AutofocusRequest, DarksJob, DriverRegistry, FinalPosition, FlatsJob, Observatory, ObservatoryConfig,
    OutputFolder, SequenceReport, SlewRequest, StepOutcome,
};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Keeps the non-blocking file writer flushing until exit
static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Starwatch - unattended observatory control
#[derive(Parser, Debug)]
#[command(name = "starwatch")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Connect, point, calibrate and safeguard an observatory", long_about = None)]
struct Cli {
    /// Observatory configuration file
    #[arg(global = true, long = "config", short = 'c', default_value = "observatory.toml")]
    config: PathBuf,

    /// Also write daily rolling log files to this directory
    #[arg(global = true, long = "log-dir")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect every configured device and report the result
    Connect,

    /// Connect, then put every subsystem in a safe state
    Shutdown,

    /// Slew to equatorial coordinates
    Slew {
        /// Right ascension in hours
        #[arg(long)]
        ra: f64,

        /// Declination in degrees
        #[arg(long, allow_hyphen_values = true)]
        dec: f64,

        /// Move the dome with the mount
        #[arg(long)]
        dome: bool,

        /// Rotate the field with the mount
        #[arg(long)]
        rotator: bool,
    },

    /// Take flat frames against the cover calibrator
    Flats {
        /// Exposure per configured filter, comma separated; 0 skips a filter
        #[arg(long, value_delimiter = ',', required = true)]
        exposures: Vec<f64>,

        /// Square binning factors, comma separated
        #[arg(long, value_delimiter = ',', default_value = "1")]
        binning: Vec<u32>,

        #[arg(long, default_value = "10")]
        repeat: u32,

        #[arg(long, default_value = ".")]
        out: PathBuf,

        /// Write into a new timestamped sub-folder
        #[arg(long)]
        timestamped: bool,

        /// Park the telescope afterwards
        #[arg(long)]
        park: bool,
    },

    /// Take dark frames
    Darks {
        /// Exposure times, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        exposures: Vec<f64>,

        #[arg(long, value_delimiter = ',', default_value = "1")]
        binning: Vec<u32>,

        #[arg(long, default_value = "10")]
        repeat: u32,

        #[arg(long, default_value = ".")]
        out: PathBuf,

        #[arg(long)]
        timestamped: bool,
    },

    /// Find best focus
    Autofocus {
        #[arg(long, default_value = "3")]
        exposure: f64,

        #[arg(long, default_value = "0")]
        midpoint: i32,

        #[arg(long, default_value = "5")]
        steps: usize,

        #[arg(long = "step-size", default_value = "500")]
        step_size: i32,

        /// Focus where the telescope points now instead of at zenith
        #[arg(long = "current-pointing")]
        current_pointing: bool,
    },

    /// Run the safety and weather pollers until Ctrl-C
    Monitor {
        /// Poll interval in seconds
        #[arg(long, default_value = "60")]
        interval: f64,
    },

    /// Print the resolved configuration
    ShowConfig,
}

fn init_logging(log_dir: Option<&PathBuf>) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer().with_target(false);

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry().with(env_filter).with(console_layer).init();
        return;
    };
    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Failed to create log directory {}: {}", log_dir.display(), e);
        tracing_subscriber::registry().with(env_filter).with(console_layer).init();
        return;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "starwatch.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD.set(guard).ok();

    let file_layer = fmt::layer().with_target(true).with_ansi(false).with_writer(non_blocking);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();
    tracing::info!("Logging to {}", log_dir.display());
}

fn print_report(title: &str, report: &SequenceReport) {
    println!("{}", title);
    for record in &report.steps {
        let outcome = match &record.outcome {
            StepOutcome::Done => "ok".to_string(),
            StepOutcome::Skipped(reason) => format!("skipped ({})", reason),
            StepOutcome::Failed(reason) => format!("FAILED ({})", reason),
        };
        println!("  {:<32} {}", record.step, outcome);
    }
}

fn folder(timestamped: bool) -> OutputFolder {
    if timestamped {
        OutputFolder::Timestamped
    } else {
        OutputFolder::SavePath
    }
}

fn poll_interval(seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds.max(0.1)).with_context(|| format!("invalid poll interval {} s", seconds))
}

/// Resolves once the safety loop has ended; it only ends on its own after shutting the observatory down
async fn safety_tripped(observatory: &Observatory) {
    while observatory.loop_status().await.safety_monitor {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_dir.as_ref());

    let config = ObservatoryConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Commands::ShowConfig = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let observatory = Observatory::from_config(config, &DriverRegistry::with_simulators())
        .context("assembling observatory")?;
    print_report("Connecting", &observatory.connect_all().await);

    match cli.command {
        Commands::Connect | Commands::ShowConfig => {}
        Commands::Shutdown => {
            print_report("Shutdown", &observatory.shutdown().await);
        }
        Commands::Slew { ra, dec, dome, rotator } => {
            let request = SlewRequest::equatorial(ra, dec).with_dome(dome).with_rotator(rotator);
            let report = observatory.slew(&request).await?;
            println!(
                "Pointing at RA {:.4}h Dec {:.4} (alt {:.2} az {:.2})",
                report.ra_hours, report.dec_deg, report.altitude, report.azimuth
            );
            if report.rotator_downgraded {
                println!("Rotator left in place: target angle outside its limits");
            }
        }
        Commands::Flats {
            exposures,
            binning,
            repeat,
            out,
            timestamped,
            park,
        } => {
            let mut job = FlatsJob::new(exposures, out);
            job.binnings = binning.iter().map(|&b| (b, b)).collect();
            job.repeat = repeat;
            job.folder = folder(timestamped);
            if park {
                job.final_position = FinalPosition::Park;
            }
            let report = observatory.take_flats(&job).await?;
            println!("{} flat frame(s) in {}", report.frames.len(), report.folder.display());
        }
        Commands::Darks {
            exposures,
            binning,
            repeat,
            out,
            timestamped,
        } => {
            let mut job = DarksJob::new(exposures, out);
            job.binnings = binning.iter().map(|&b| (b, b)).collect();
            job.repeat = repeat;
            job.folder = folder(timestamped);
            let report = observatory.take_darks(&job).await?;
            println!("{} dark frame(s) in {}", report.frames.len(), report.folder.display());
        }
        Commands::Autofocus {
            exposure,
            midpoint,
            steps,
            step_size,
            current_pointing,
        } => {
            let request = AutofocusRequest {
                exposure_secs: exposure,
                midpoint,
                steps,
                step_size,
                use_current_pointing: current_pointing,
            };
            let outcome = observatory.run_autofocus(&request).await?;
            println!("Focus position {} ({:?})", outcome.position, outcome.quality);
        }
        Commands::Monitor { interval } => {
            let interval = poll_interval(interval)?;
            let devices = observatory.state().devices();
            let guarded = !devices.safety_monitors.is_empty();
            if guarded {
                observatory.start_safety_monitor(interval).await?;
            }
            if devices.observing_conditions.is_some() {
                observatory.start_observing_conditions(interval).await?;
            }
            tracing::info!("Monitoring, press Ctrl-C to stop");
            tokio::select! {
                result = tokio::signal::ctrl_c() => result.context("waiting for Ctrl-C")?,
                _ = safety_tripped(&observatory), if guarded => {
                    tracing::error!("Safety monitor tripped, observatory has been shut down");
                    println!("Safety monitor tripped: observatory shut down");
                }
            }
        }
    }

    observatory.close().await;
    print_report("Disconnecting", &observatory.disconnect_all().await);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use starwatch_devices::sim::{SimMount, SimSafetyMonitor};
    use starwatch_observatory::Devices;
    use std::sync::Arc;

    #[test]
    fn test_poll_interval_rejects_infinity() {
        assert!(poll_interval(f64::INFINITY).is_err());
        assert_eq!(poll_interval(60.0).unwrap(), Duration::from_secs(60));
        assert!(poll_interval(0.0).unwrap() > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_returns_when_safety_trips() {
        let monitor = Arc::new(SimSafetyMonitor::always_safe("roof"));
        let mount = Arc::new(SimMount::new("mount"));
        let devices = Devices::default()
            .with_safety_monitor(monitor.clone())
            .with_telescope(mount.clone());
        let observatory = Observatory::new(devices, ObservatoryConfig::default());
        observatory.connect_all().await;
        observatory.start_safety_monitor(Duration::from_secs(1)).await.unwrap();

        monitor.set_safe(false);
        tokio::time::timeout(Duration::from_secs(30), safety_tripped(&observatory))
            .await
            .unwrap();
        assert!(mount.pose().parked);
        observatory.close().await;
    }
}
