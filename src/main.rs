mod config;
mod monitor;
mod procfs;
mod retry;
mod signals;
#[cfg(test)]
mod test_support;

use clap::{CommandFactory, Parser};
use config::{CliOverrides, ConfigError, MonitorConfig};
use monitor::{MonitorLoop, MonitorOutcome, StopReason};
use procfs::ProcStatReader;
use signals::SigtermTerminator;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Watch one process through /proc: log its resident memory and CPU use on a
/// fixed cadence, and send it SIGTERM if memory goes over a threshold.
#[derive(Parser, Debug)]
#[command(name = "memhold", version, about)]
pub struct Cli {
    /// PID of the process to watch (for example `$(pgrep firefox)`)
    #[arg(value_name = "PID", allow_negative_numbers = true)]
    pid: Option<String>,

    /// Settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between samples (overrides config)
    #[arg(short, long, value_name = "SECS")]
    interval: Option<f64>,

    /// Resident memory ceiling in KB (overrides config)
    #[arg(short, long, value_name = "KB")]
    mem_threshold: Option<u64>,

    /// CPU threshold in percent; reported only (overrides config)
    #[arg(long, value_name = "PCT")]
    cpu_threshold: Option<f64>,

    /// Number of samples before exiting (overrides config)
    #[arg(short = 'n', long)]
    max_iterations: Option<u32>,

    /// Consecutive read failures tolerated before aborting (overrides config)
    #[arg(long)]
    retries: Option<u32>,

    /// Skip the per-cycle CPU measurement
    #[arg(long)]
    no_cpu: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (per-cycle tick deltas, settings file loads)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            refresh_secs: self.interval,
            memory_threshold_kb: self.mem_threshold,
            cpu_threshold_percent: self.cpu_threshold,
            max_iterations: self.max_iterations,
            max_read_retries: self.retries,
            no_cpu: self.no_cpu,
        }
    }

    fn resolve_config(&self) -> Result<MonitorConfig, ConfigError> {
        let pid = config::parse_pid(self.pid.as_deref())?;
        let settings = config::load_settings(self.config.as_deref())?;
        MonitorConfig::resolve(pid, settings, &self.overrides())
    }
}

fn init_tracing(cli: &Cli) {
    let default_filter = if cli.verbose {
        "memhold=debug"
    } else if cli.quiet {
        "memhold=warn"
    } else {
        "memhold=info"
    };

    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
}

fn log_startup(config: &MonitorConfig, reader: &ProcStatReader) {
    let pid = config.target_pid;
    let name = match reader.read_process_name(pid) {
        Ok(name) => name,
        Err(e) => {
            tracing::warn!(pid, error = %e, "could not read target process name");
            "?".to_string()
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        monitor_pid = std::process::id(),
        "memhold starting"
    );
    tracing::info!(pid, name = %name, "target process");
    tracing::info!(
        memory_threshold_kb = config.memory_threshold_kb,
        cpu_threshold_percent = config.cpu_threshold_percent,
        refresh_secs = config.refresh_interval.as_secs_f64(),
        max_iterations = config.max_iterations,
        max_read_retries = config.max_read_retries,
        sample_cpu = config.sample_cpu,
        "monitor settings"
    );
    tracing::debug!(proc_root = %reader.root().display(), "reading process counters");
}

/// One-line usage rendered from the clap definition.
fn usage() -> String {
    Cli::command().render_usage().to_string()
}

fn log_outcome(pid: u32, outcome: &MonitorOutcome) {
    let elapsed_secs = outcome.elapsed.as_secs_f64();
    let iterations = outcome.iterations;
    match outcome.reason {
        StopReason::MaxIterations => {
            tracing::info!(pid, iterations, elapsed_secs, "monitoring finished");
        }
        StopReason::ThresholdExceeded { rss_kb, delivered } => {
            tracing::info!(
                pid,
                iterations,
                elapsed_secs,
                rss_kb,
                delivered,
                "monitoring finished after memory threshold"
            );
        }
        StopReason::ReadFailures { failures } => {
            tracing::error!(
                pid,
                iterations,
                elapsed_secs,
                failures,
                "monitoring aborted: repeated read failures"
            );
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            e.print().ok();
            return ExitCode::from(1);
        }
    };

    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", usage());
            eprintln!("error: {e}");
            return ExitCode::from(1);
        }
    };

    if cli.dry_run {
        return match serde_json::to_string_pretty(&config) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: failed to render settings: {e}");
                ExitCode::from(1)
            }
        };
    }

    let pid = config.target_pid;
    let reader = ProcStatReader::new(config.proc_root.clone());
    log_startup(&config, &reader);

    let mut monitor = MonitorLoop::new(
        config,
        reader,
        SigtermTerminator,
        procfs::clock_ticks_per_second(),
    );
    let outcome = monitor.run().await;
    log_outcome(pid, &outcome);
    ExitCode::from(outcome.exit_code())
}
