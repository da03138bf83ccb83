//! Run log for the sst-courier binary.
//!
//! Every courier run gets its own timestamped text file under the log
//! directory (by default `<destination_root>/Logs`), optionally mirrored to
//! stderr. The subscriber is never installed globally: callers run their
//! work inside [`RunLog::in_scope`], so independent runs (and tests) keep
//! separate logs.

use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::Dispatch;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "sst_courier=info";
const VERBOSE_LOG_FILTER: &str = "sst_courier=debug";
const LINE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;
const MAX_SAME_SECOND_RUNS: usize = 1000;

/// Number of run logs kept in the log directory when not configured.
pub const DEFAULT_RETAIN_RUNS: usize = 30;

/// Where run log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSink {
    /// Only the run log file.
    File,
    /// Only stderr; no file is created.
    Console,
    /// The run log file and stderr.
    #[default]
    Both,
}

impl LogSink {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSink::File => "file",
            LogSink::Console => "console",
            LogSink::Both => "both",
        }
    }

    fn writes_file(self) -> bool {
        matches!(self, LogSink::File | LogSink::Both)
    }

    fn writes_console(self) -> bool {
        matches!(self, LogSink::Console | LogSink::Both)
    }
}

/// Run log configuration.
#[derive(Debug, Clone)]
pub struct RunLogConfig<'a> {
    /// Prefix of the log file name, e.g. `copy_nc4`.
    pub app_name: &'a str,
    /// Directory holding the run logs. Created on demand.
    pub log_dir: PathBuf,
    pub sink: LogSink,
    /// Lower the default filter to debug.
    pub verbose: bool,
    /// Keep at most this many run logs (including the new one). 0 keeps all.
    pub retain: usize,
}

/// Handle to one run's log. Dropping it closes the file.
#[derive(Debug)]
pub struct RunLog {
    path: Option<PathBuf>,
    dispatch: Dispatch,
}

impl RunLog {
    /// Create the log directory and file and build the scoped subscriber.
    pub fn open(config: RunLogConfig<'_>) -> Result<Self> {
        let started = Local::now();

        let mut path = None;
        let file_layer = if config.sink.writes_file() {
            fs::create_dir_all(&config.log_dir).with_context(|| {
                format!("Failed to create log directory: {}", config.log_dir.display())
            })?;

            let prefix = sanitize_name(config.app_name);
            if config.retain > 0 {
                prune_run_logs(&config.log_dir, &prefix, config.retain - 1).with_context(|| {
                    format!("Failed to prune old run logs in {}", config.log_dir.display())
                })?;
            }

            let stamp = started.format(FILE_TIMESTAMP_FORMAT).to_string();
            let file_path = claim_run_log_path(&config.log_dir, &prefix, &stamp)
                .with_context(|| {
                    format!("Failed to create run log in {}", config.log_dir.display())
                })?;
            let writer = SharedRunLogWriter::new(file_path.clone())?;
            path = Some(file_path);

            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false)
                    .with_timer(ChronoLocal::new(LINE_TIMESTAMP_FORMAT.to_string()))
                    .with_filter(build_filter(config.verbose)),
            )
        } else {
            None
        };

        let subscriber = tracing_subscriber::registry().with(file_layer);

        let console_layer = if config.sink.writes_console() {
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(false)
                    .with_timer(ChronoLocal::new(LINE_TIMESTAMP_FORMAT.to_string()))
                    .with_filter(build_filter(config.verbose)),
            )
        } else {
            None
        };

        let dispatch = Dispatch::new(subscriber.with(console_layer));

        let run_log = Self { path, dispatch };
        run_log.in_scope(|| match run_log.path() {
            Some(path) => tracing::info!(
                target: "sst_courier",
                "Run log will be written to: {} starting at: {}",
                path.display(),
                started.format(LINE_TIMESTAMP_FORMAT)
            ),
            None => tracing::info!(
                target: "sst_courier",
                "Run log started at: {} (console only)",
                started.format(LINE_TIMESTAMP_FORMAT)
            ),
        });

        Ok(run_log)
    }

    /// Path of the log file, `None` for console-only logs.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` with this log as the default subscriber.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}

fn build_filter(verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new(VERBOSE_LOG_FILTER);
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Remove the oldest `<prefix>_*.txt` run logs (and their rollovers) so that
/// at most `keep` remain. File names embed the start time, so lexical order
/// is chronological.
fn prune_run_logs(dir: &Path, prefix: &str, keep: usize) -> io::Result<usize> {
    let run_prefix = format!("{}_", prefix);
    let mut runs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name.starts_with(&run_prefix) && name.ends_with(".txt"))
        })
        .collect();

    if runs.len() <= keep {
        return Ok(0);
    }
    runs.sort();

    let excess = runs.len() - keep;
    for run in &runs[..excess] {
        fs::remove_file(run)?;
        for idx in 1..MAX_LOG_FILES {
            let rolled = rolled_path(run, idx);
            if rolled.exists() {
                fs::remove_file(rolled)?;
            }
        }
    }
    Ok(excess)
}

/// Create a fresh `<prefix>_<stamp>.txt`. Runs started within the same
/// second get `_1`, `_2`, ... appended so no two runs share a file.
fn claim_run_log_path(dir: &Path, prefix: &str, stamp: &str) -> io::Result<PathBuf> {
    let mut attempt = 0usize;
    loop {
        let name = if attempt == 0 {
            format!("{}_{}.txt", prefix, stamp)
        } else {
            format!("{}_{}_{}.txt", prefix, stamp, attempt)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt < MAX_SAME_SECOND_RUNS => {
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn rolled_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", index));
    PathBuf::from(name)
}

/// Append-only run log file with size-based rollover.
struct RunLogFile {
    path: PathBuf,
    max_files: usize,
    max_size: u64,
    file: Option<File>,
    current_size: u64,
}

impl RunLogFile {
    fn open(path: PathBuf, max_files: usize, max_size: u64) -> io::Result<Self> {
        let mut log = Self {
            path,
            max_files: max_files.max(1),
            max_size,
            file: None,
            current_size: 0,
        };
        let (file, size) = log.open_current()?;
        log.file = Some(file);
        log.current_size = size;
        Ok(log)
    }

    fn open_current(&self) -> io::Result<(File, u64)> {
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let size = file.metadata()?.len();
        Ok((file, size))
    }

    fn roll_over(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }

        let max_index = self.max_files.saturating_sub(1);
        if max_index > 0 {
            let oldest = rolled_path(&self.path, max_index);
            if oldest.exists() {
                fs::remove_file(&oldest)?;
            }
            for idx in (1..max_index).rev() {
                let src = rolled_path(&self.path, idx);
                if src.exists() {
                    fs::rename(&src, rolled_path(&self.path, idx + 1))?;
                }
            }
            if self.path.exists() {
                fs::rename(&self.path, rolled_path(&self.path, 1))?;
            }
        } else if self.path.exists() {
            fs::remove_file(&self.path)?;
        }

        let (file, size) = self.open_current()?;
        self.file = Some(file);
        self.current_size = size;
        Ok(())
    }
}

impl Write for RunLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size > 0 && self.current_size + buf.len() as u64 > self.max_size {
            self.roll_over()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "run log file unavailable"))?;
        let bytes = file.write(buf)?;
        self.current_size += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

#[derive(Clone)]
struct SharedRunLogWriter {
    inner: Arc<Mutex<RunLogFile>>,
}

impl SharedRunLogWriter {
    fn new(path: PathBuf) -> Result<Self> {
        let file = RunLogFile::open(path.clone(), MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
            .with_context(|| format!("Failed to open run log {}", path.display()))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

struct SharedRunLogWriterGuard {
    inner: Arc<Mutex<RunLogFile>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedRunLogWriter {
    type Writer = SharedRunLogWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedRunLogWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedRunLogWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "run log lock poisoned"))?;
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "run log lock poisoned"))?;
        guard.flush()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_config(dir: &Path, retain: usize) -> RunLogConfig<'static> {
        RunLogConfig {
            app_name: "copy_nc4",
            log_dir: dir.to_path_buf(),
            sink: LogSink::File,
            verbose: false,
            retain,
        }
    }

    #[test]
    fn test_open_creates_timestamped_file() {
        let temp = TempDir::new().unwrap();
        let log_dir = temp.path().join("Logs");

        let run_log = RunLog::open(file_config(&log_dir, 0)).unwrap();
        let path = run_log.path().unwrap().to_path_buf();

        assert!(path.starts_with(&log_dir));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("copy_nc4_"), "unexpected name {}", name);
        assert!(name.ends_with(".txt"));
        // copy_nc4_YYYYMMDD_HHMMSS.txt
        assert_eq!(name.len(), "copy_nc4_".len() + 15 + ".txt".len());

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("Run log will be written to:"));
    }

    #[test]
    fn test_runs_in_the_same_second_get_separate_files() {
        let temp = TempDir::new().unwrap();
        let stamp = "20240523_063000";

        let first = claim_run_log_path(temp.path(), "copy_nc4", stamp).unwrap();
        let second = claim_run_log_path(temp.path(), "copy_nc4", stamp).unwrap();
        let third = claim_run_log_path(temp.path(), "copy_nc4", stamp).unwrap();

        assert_eq!(first, temp.path().join("copy_nc4_20240523_063000.txt"));
        assert_eq!(second, temp.path().join("copy_nc4_20240523_063000_1.txt"));
        assert_eq!(third, temp.path().join("copy_nc4_20240523_063000_2.txt"));
        assert!(first.is_file() && second.is_file() && third.is_file());
    }

    #[test]
    fn test_back_to_back_runs_do_not_share_a_log() {
        let temp = TempDir::new().unwrap();

        let first = RunLog::open(file_config(temp.path(), 0)).unwrap();
        let second = RunLog::open(file_config(temp.path(), 0)).unwrap();
        first.in_scope(|| tracing::info!(target: "sst_courier", "first run line"));
        second.in_scope(|| tracing::info!(target: "sst_courier", "second run line"));

        assert_ne!(first.path(), second.path());
        let second_text = fs::read_to_string(second.path().unwrap()).unwrap();
        assert!(second_text.contains("second run line"));
        assert!(!second_text.contains("first run line"));
    }

    #[test]
    fn test_in_scope_routes_events_to_file() {
        let temp = TempDir::new().unwrap();
        let run_log = RunLog::open(file_config(temp.path(), 0)).unwrap();

        run_log.in_scope(|| {
            tracing::warn!(target: "sst_courier", "rsync failed for: /tmp/a.nc4");
        });
        // Outside the scope nothing reaches this log.
        tracing::warn!(target: "sst_courier", "not in the run log");

        let contents = fs::read_to_string(run_log.path().unwrap()).unwrap();
        assert!(contents.contains("rsync failed for: /tmp/a.nc4"));
        assert!(contents.contains("WARN"));
        assert!(!contents.contains("not in the run log"));
    }

    #[test]
    fn test_console_sink_creates_no_file() {
        let temp = TempDir::new().unwrap();
        let log_dir = temp.path().join("Logs");
        let config = RunLogConfig {
            sink: LogSink::Console,
            ..file_config(&log_dir, 0)
        };

        let run_log = RunLog::open(config).unwrap();
        assert!(run_log.path().is_none());
        assert!(!log_dir.exists());
    }

    #[test]
    fn test_prune_keeps_newest_runs() {
        let temp = TempDir::new().unwrap();
        for stamp in ["20240101_000000", "20240102_000000", "20240103_000000"] {
            fs::write(temp.path().join(format!("copy_nc4_{}.txt", stamp)), "old").unwrap();
        }
        fs::write(temp.path().join("copy_nc4_20240101_000000.txt.1"), "rolled").unwrap();
        fs::write(temp.path().join("other_20230101_000000.txt"), "keep").unwrap();

        let removed = prune_run_logs(temp.path(), "copy_nc4", 1).unwrap();
        assert_eq!(removed, 2);

        assert!(!temp.path().join("copy_nc4_20240101_000000.txt").exists());
        assert!(!temp.path().join("copy_nc4_20240101_000000.txt.1").exists());
        assert!(!temp.path().join("copy_nc4_20240102_000000.txt").exists());
        assert!(temp.path().join("copy_nc4_20240103_000000.txt").exists());
        assert!(temp.path().join("other_20230101_000000.txt").exists());
    }

    #[test]
    fn test_open_respects_retain() {
        let temp = TempDir::new().unwrap();
        for stamp in ["20200101_000000", "20200102_000000"] {
            fs::write(temp.path().join(format!("copy_nc4_{}.txt", stamp)), "old").unwrap();
        }

        let _run_log = RunLog::open(file_config(temp.path(), 2)).unwrap();

        let names: Vec<String> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 2, "{:?}", names);
        assert!(!names.contains(&"copy_nc4_20200101_000000.txt".to_string()));
        assert!(names.contains(&"copy_nc4_20200102_000000.txt".to_string()));
    }

    #[test]
    fn test_log_file_rolls_over_at_size_cap() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("copy_nc4_20240101_000000.txt");
        let mut file = RunLogFile::open(path.clone(), 3, 16).unwrap();

        file.write_all(b"0123456789").unwrap();
        file.write_all(b"abcdefghij").unwrap();
        file.write_all(b"ABCDEFGHIJ").unwrap();
        file.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "ABCDEFGHIJ");
        assert_eq!(fs::read_to_string(rolled_path(&path, 1)).unwrap(), "abcdefghij");
        assert_eq!(fs::read_to_string(rolled_path(&path, 2)).unwrap(), "0123456789");
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("copy nc4/run"), "copy_nc4_run");
        assert_eq!(sanitize_name("sst-courier_1"), "sst-courier_1");
    }
}
