//! sst-courier binary
//!
//! ```bash
//! # Watch with the settings from a config file
//! sst-courier --config /etc/sst-courier.toml
//!
//! # Dry run: log what would be moved, move nothing
//! sst-courier --config /etc/sst-courier.toml --test
//!
//! # Where would these granules go?
//! sst-courier --destination /mnt/archive resolve AQUA_MODIS_orbit_049174_20110523T063000_L2_SST.nc4
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sst_courier::filename::{has_extension, resolve};
use sst_courier::{transfer, CourierConfig, DryRunIdle, RunSummary, TransferMethod, Watcher};
use sst_courier_logging::{LogSink, RunLog, RunLogConfig};
use std::path::PathBuf;
use std::process::ExitCode;

/// Prefix of the run log file names.
const RUN_LOG_NAME: &str = "copy_nc4";

#[derive(Parser, Debug)]
#[command(
    name = "sst-courier",
    version,
    about = "Move finished SST granules from the processing output tree into the year/month archive"
)]
struct Cli {
    /// Enable debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Dry run: log what would be copied and deleted without touching any file
    #[arg(long = "test")]
    test: bool,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,

    /// Print the run summary as JSON on stdout
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    settings: SettingsArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Overrides applied on top of the config file
#[derive(Args, Debug, Default)]
struct SettingsArgs {
    /// TOML config file
    #[arg(long, env = "SST_COURIER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory the producer writes granules into
    #[arg(long, global = true)]
    source: Option<PathBuf>,

    /// Archive root
    #[arg(long, global = true)]
    destination: Option<PathBuf>,

    /// Directory level between the archive root and the year ("" for none)
    #[arg(long, global = true)]
    category: Option<String>,

    /// Only consider files with this extension ("" for all files)
    #[arg(long, global = true)]
    extension: Option<String>,

    /// Minimum granule age before it is moved
    #[arg(long)]
    min_age_secs: Option<u64>,

    /// Idle timeout before the first transfer
    #[arg(long)]
    initial_idle_secs: Option<u64>,

    /// Idle timeout after the first transfer
    #[arg(long)]
    steady_idle_secs: Option<u64>,

    /// Time between passes
    #[arg(long)]
    poll_secs: Option<u64>,

    /// Wait before the first pass
    #[arg(long)]
    startup_delay_secs: Option<u64>,

    /// Transfer backend
    #[arg(long, value_enum)]
    transfer: Option<TransferArg>,

    /// Per-file transfer timeout, 0 for none
    #[arg(long)]
    transfer_timeout_secs: Option<u64>,

    /// Whether dry-run actions restart the idle clock
    #[arg(long, value_enum)]
    dry_run_idle: Option<DryRunIdleArg>,

    /// Run log directory (default: <destination>/Logs)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Write the run log file only, nothing on stderr
    #[arg(short, long)]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransferArg {
    Rsync,
    Copy,
}

impl From<TransferArg> for TransferMethod {
    fn from(arg: TransferArg) -> Self {
        match arg {
            TransferArg::Rsync => TransferMethod::Rsync,
            TransferArg::Copy => TransferMethod::Copy,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DryRunIdleArg {
    Reset,
    Ignore,
}

impl From<DryRunIdleArg> for DryRunIdle {
    fn from(arg: DryRunIdleArg) -> Self {
        match arg {
            DryRunIdleArg::Reset => DryRunIdle::Reset,
            DryRunIdleArg::Ignore => DryRunIdle::Ignore,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the archive path for granule file names
    Resolve {
        /// File names (directories are ignored)
        #[arg(required = true)]
        names: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the resolved configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn load_config(settings: &SettingsArgs) -> Result<CourierConfig> {
    let mut config = match &settings.config {
        Some(path) => CourierConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => CourierConfig::default(),
    };

    if let Some(source) = &settings.source {
        config.source_root = Some(source.clone());
    }
    if let Some(destination) = &settings.destination {
        config.destination_root = Some(destination.clone());
    }
    if let Some(category) = &settings.category {
        config.category = category.clone();
    }
    if let Some(extension) = &settings.extension {
        config.extension = extension.clone();
    }
    if let Some(secs) = settings.min_age_secs {
        config.min_file_age_secs = secs;
    }
    if let Some(secs) = settings.initial_idle_secs {
        config.initial_idle_timeout_secs = secs;
    }
    if let Some(secs) = settings.steady_idle_secs {
        config.steady_idle_timeout_secs = secs;
    }
    if let Some(secs) = settings.poll_secs {
        config.poll_interval_secs = secs;
    }
    if let Some(secs) = settings.startup_delay_secs {
        config.startup_delay_secs = secs;
    }
    if let Some(method) = settings.transfer {
        config.transfer.method = method.into();
    }
    if let Some(secs) = settings.transfer_timeout_secs {
        config.transfer.timeout_secs = secs;
    }
    if let Some(policy) = settings.dry_run_idle {
        config.dry_run_idle = policy.into();
    }
    if let Some(dir) = &settings.log_dir {
        config.log.dir = Some(dir.clone());
    }
    if settings.quiet {
        config.log.sink = LogSink::File;
    }

    Ok(config)
}

fn run_command(cli: Cli) -> Result<()> {
    let config = load_config(&cli.settings)?;

    match cli.command {
        Some(Commands::Resolve { names, json }) => run_resolve(&config, &names, json),
        Some(Commands::Config { json }) => run_config(&config, json),
        None => run_watch(config, cli.test, cli.once, cli.json, cli.verbose),
    }
}

fn run_watch(mut config: CourierConfig, test: bool, once: bool, json: bool, verbose: bool) -> Result<()> {
    if test {
        config.dry_run = true;
    }

    let mut options = config.watch_options().context("Invalid configuration")?;
    if once {
        options.max_passes = Some(1);
    }

    let run_log = RunLog::open(RunLogConfig {
        app_name: RUN_LOG_NAME,
        log_dir: config.log_dir()?,
        sink: config.log.sink,
        verbose,
        retain: config.log.retain,
    })?;

    let mut watcher = Watcher::new(options, transfer::from_config(&config.transfer));
    let summary = match run_log.in_scope(|| watcher.run()) {
        Ok(summary) => summary,
        Err(err) => {
            run_log.in_scope(|| tracing::error!("Courier stopped on error: {}", err));
            return Err(err).context("Courier run failed");
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let moved = if summary.dry_run {
        format!("{} granules would have been moved", summary.dry_run_actions)
    } else {
        format!("{} granules moved", summary.transferred)
    };
    println!(
        "{} in {} passes ({} failed attempts, {} still pending)",
        moved, summary.passes, summary.failed, summary.pending
    );
}

#[derive(Debug, Serialize)]
struct Resolved<'a> {
    name: &'a str,
    destination: Option<PathBuf>,
}

fn run_resolve(config: &CourierConfig, names: &[String], json: bool) -> Result<()> {
    let root = config.destination_root()?;
    let extension = config.extension_filter();

    let resolved: Vec<Resolved<'_>> = names
        .iter()
        .map(|name| {
            let destination = if has_extension(std::path::Path::new(name), extension) {
                resolve(&root, &config.category, name)
            } else {
                None
            };
            Resolved { name, destination }
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&resolved)?);
    } else {
        for item in &resolved {
            match &item.destination {
                Some(path) => println!("{} -> {}", item.name, path.display()),
                None => println!("{} -> ignored", item.name),
            }
        }
    }
    Ok(())
}

fn run_config(config: &CourierConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    print!("{}", config.to_toml_string()?);
    match config.log_dir() {
        Ok(dir) => println!("# run logs: {}", dir.display()),
        Err(_) => println!("# run logs: <destination_root>/Logs"),
    }
    if let Err(err) = config.validate() {
        println!("# WARNING: {}", err);
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(1)
        }
    }
}
