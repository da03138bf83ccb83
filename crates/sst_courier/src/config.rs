//! Configuration for the courier
//!
//! Loaded from a TOML file; every field has a default except the two roots.
//! Command line flags are applied on top by the binary.

use crate::error::{CourierError, Result};
use crate::paths::{ensure_disjoint_roots, expand_home};
use crate::watcher::WatchOptions;
use serde::{Deserialize, Serialize};
use sst_courier_logging::{LogSink, DEFAULT_RETAIN_RUNS};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Which file timestamp the minimum age is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgeBasis {
    /// Last modification time.
    #[default]
    Modified,
    /// Birth time where the filesystem reports it, modification time otherwise.
    Created,
}

/// What an intended action in dry-run mode does to the idle clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DryRunIdle {
    /// Counts as progress: the idle clock restarts.
    #[default]
    Reset,
    /// Leaves the idle clock alone.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMethod {
    /// External sync program (rsync by default).
    #[default]
    Rsync,
    /// In-process copy verified with BLAKE3.
    Copy,
}

/// What happens when a transfer subprocess exceeds its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// Kill it, keep the source, try again next pass.
    #[default]
    Retry,
    /// Kill it and stop the watcher.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default)]
    pub method: TransferMethod,

    /// Program run by the rsync method
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments placed before `<source> <destination>`
    #[serde(default = "default_program_args")]
    pub args: Vec<String>,

    /// Per-file limit in seconds, 0 disables it
    #[serde(default = "default_transfer_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub on_timeout: TimeoutPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Run log directory; `<destination_root>/Logs` when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,

    #[serde(default)]
    pub sink: LogSink,

    /// Run logs to keep, 0 keeps all
    #[serde(default = "default_retain")]
    pub retain: usize,
}

/// Main configuration for the courier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Local tree the producer writes granules into
    #[serde(default)]
    pub source_root: Option<PathBuf>,

    /// Archive root (usually a remote mount)
    #[serde(default)]
    pub destination_root: Option<PathBuf>,

    /// Level between the archive root and the year, empty for none
    #[serde(default = "default_category")]
    pub category: String,

    /// Only files with this extension are considered, empty for all
    #[serde(default = "default_extension")]
    pub extension: String,

    #[serde(default = "default_min_file_age")]
    pub min_file_age_secs: u64,

    /// Idle timeout until the first successful transfer
    #[serde(default = "default_initial_idle_timeout")]
    pub initial_idle_timeout_secs: u64,

    /// Idle timeout after the first successful transfer
    #[serde(default = "default_steady_idle_timeout")]
    pub steady_idle_timeout_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Wait before the first pass
    #[serde(default)]
    pub startup_delay_secs: u64,

    #[serde(default)]
    pub age_basis: AgeBasis,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub dry_run_idle: DryRunIdle,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_category() -> String {
    "SST".to_string()
}

fn default_extension() -> String {
    "nc4".to_string()
}

fn default_min_file_age() -> u64 {
    4 * 60
}

fn default_initial_idle_timeout() -> u64 {
    20 * 60
}

fn default_steady_idle_timeout() -> u64 {
    8 * 60
}

fn default_poll_interval() -> u64 {
    60
}

fn default_program() -> String {
    "rsync".to_string()
}

fn default_program_args() -> Vec<String> {
    vec!["-av".to_string()]
}

fn default_transfer_timeout() -> u64 {
    60 * 60
}

fn default_retain() -> usize {
    DEFAULT_RETAIN_RUNS
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            method: TransferMethod::default(),
            program: default_program(),
            args: default_program_args(),
            timeout_secs: default_transfer_timeout(),
            on_timeout: TimeoutPolicy::default(),
        }
    }
}

impl TransferConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: None,
            sink: LogSink::default(),
            retain: default_retain(),
        }
    }
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            source_root: None,
            destination_root: None,
            category: default_category(),
            extension: default_extension(),
            min_file_age_secs: default_min_file_age(),
            initial_idle_timeout_secs: default_initial_idle_timeout(),
            steady_idle_timeout_secs: default_steady_idle_timeout(),
            poll_interval_secs: default_poll_interval(),
            startup_delay_secs: 0,
            age_basis: AgeBasis::default(),
            dry_run: false,
            dry_run_idle: DryRunIdle::default(),
            transfer: TransferConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl CourierConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CourierError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CourierError::Config(e.to_string()))
    }

    pub fn source_root(&self) -> Result<PathBuf> {
        self.source_root
            .as_deref()
            .map(expand_home)
            .ok_or_else(|| CourierError::Config("source_root is not set".to_string()))
    }

    pub fn destination_root(&self) -> Result<PathBuf> {
        self.destination_root
            .as_deref()
            .map(expand_home)
            .ok_or_else(|| CourierError::Config("destination_root is not set".to_string()))
    }

    /// Directory for run logs.
    pub fn log_dir(&self) -> Result<PathBuf> {
        match &self.log.dir {
            Some(dir) => Ok(expand_home(dir)),
            None => Ok(self.destination_root()?.join("Logs")),
        }
    }

    pub fn extension_filter(&self) -> Option<&str> {
        let ext = self.extension.trim();
        (!ext.is_empty()).then_some(ext)
    }

    /// Check values before the watcher starts. The roots are compared with
    /// symlinks resolved where they exist.
    pub fn validate(&self) -> Result<()> {
        let source = self.source_root()?;
        let destination = self.destination_root()?;
        ensure_disjoint_roots(&source, &destination)
            .map_err(|e| CourierError::Config(format!("source_root/destination_root: {}", e)))?;

        let category = Path::new(&self.category);
        if category
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(CourierError::Config(format!(
                "category must be a relative path without '..', got '{}'",
                self.category
            )));
        }

        if self.poll_interval_secs == 0 {
            return Err(CourierError::Config(
                "poll_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.steady_idle_timeout_secs > self.initial_idle_timeout_secs {
            return Err(CourierError::Config(format!(
                "steady_idle_timeout_secs ({}) cannot exceed initial_idle_timeout_secs ({})",
                self.steady_idle_timeout_secs, self.initial_idle_timeout_secs
            )));
        }

        if self.transfer.method == TransferMethod::Rsync && self.transfer.program.trim().is_empty()
        {
            return Err(CourierError::Config(
                "transfer.program must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Validated settings for the watcher loop.
    pub fn watch_options(&self) -> Result<WatchOptions> {
        self.validate()?;
        Ok(WatchOptions {
            source_root: self.source_root()?,
            destination_root: self.destination_root()?,
            category: self.category.clone(),
            extension: self.extension_filter().map(str::to_string),
            min_file_age: Duration::from_secs(self.min_file_age_secs),
            initial_idle_timeout: Duration::from_secs(self.initial_idle_timeout_secs),
            steady_idle_timeout: Duration::from_secs(self.steady_idle_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            startup_delay: Duration::from_secs(self.startup_delay_secs),
            age_basis: self.age_basis,
            dry_run: self.dry_run,
            dry_run_idle: self.dry_run_idle,
            max_passes: None,
        })
    }
}
