//! Watcher/mover loop
//!
//! Polls the source tree for granules, moves the ones that have been quiet
//! long enough into the archive, and stops once production has been idle for
//! longer than the idle timeout.
//!
//! # Pass
//!
//! 1. Walk the source root (sorted, so passes are reproducible).
//! 2. Skip anything without the wanted extension or a granule date. The
//!    archive is never walked, even if it sits inside the source tree.
//! 3. Granules younger than the minimum age are *pending*: they keep the
//!    loop alive.
//! 4. Older granules are transferred; the source is deleted only after the
//!    backend reports success. Failures are logged and retried next pass.
//!
//! After the pass the loop stops if nothing is pending and the idle clock in
//! [`RunState`] has run past the current timeout; otherwise it sleeps for
//! the poll interval.

use crate::config::{AgeBasis, DryRunIdle};
use crate::error::{CourierError, Result};
use crate::filename::{destination_dir, has_extension, parse_granule_date, GranuleDate};
use crate::paths::{comparable_path, same_path, validate_source_root};
use crate::run_state::RunState;
use crate::transfer::{ensure_destination_dir, Transfer};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs::{self, Metadata};
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Settings for one watcher run.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub source_root: PathBuf,
    pub destination_root: PathBuf,
    pub category: String,
    pub extension: Option<String>,
    pub min_file_age: Duration,
    pub initial_idle_timeout: Duration,
    pub steady_idle_timeout: Duration,
    pub poll_interval: Duration,
    pub startup_delay: Duration,
    pub age_basis: AgeBasis,
    pub dry_run: bool,
    pub dry_run_idle: DryRunIdle,
    /// Stop after this many passes even if work remains.
    pub max_passes: Option<u64>,
}

/// A granule found in the source tree.
#[derive(Debug, Clone)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub file_name: String,
    pub date: GranuleDate,
    pub timestamp: SystemTime,
    pub size: u64,
}

impl WatchedFile {
    /// Age relative to `now`; timestamps in the future count as zero.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.timestamp).unwrap_or(Duration::ZERO)
    }
}

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Regular files walked
    pub files_seen: u64,
    /// Wrong extension, no granule date, or already at its archive path
    pub ignored: u64,
    /// Granules still younger than the minimum age
    pub pending: usize,
    pub transferred: u64,
    pub failed: u64,
    pub dry_run_actions: u64,
    /// Transferred but the source could not be removed
    pub delete_failures: u64,
    pub walk_errors: u64,
}

impl PassReport {
    fn absorb(&mut self, other: &PassReport) {
        self.files_seen += other.files_seen;
        self.ignored += other.ignored;
        self.pending = other.pending;
        self.transferred += other.transferred;
        self.failed += other.failed;
        self.dry_run_actions += other.dry_run_actions;
        self.delete_failures += other.delete_failures;
        self.walk_errors += other.walk_errors;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Nothing pending and the idle timeout ran out.
    Idle,
    /// `max_passes` reached.
    PassLimit,
}

/// What a finished run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub dry_run: bool,
    pub passes: u64,
    pub transferred: u64,
    pub failed: u64,
    pub dry_run_actions: u64,
    pub delete_failures: u64,
    pub walk_errors: u64,
    /// Granules still pending after the last pass
    pub pending: usize,
    pub final_idle_timeout_secs: u64,
    pub stop_reason: StopReason,
}

/// The watcher loop and the state it carries between passes.
pub struct Watcher {
    options: WatchOptions,
    transfer: Box<dyn Transfer>,
    state: RunState,
}

impl Watcher {
    pub fn new(options: WatchOptions, transfer: Box<dyn Transfer>) -> Self {
        let state = RunState::new(
            Instant::now(),
            options.initial_idle_timeout,
            options.steady_idle_timeout,
        );
        Self {
            options,
            transfer,
            state,
        }
    }

    pub fn options(&self) -> &WatchOptions {
        &self.options
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Run passes until the idle timeout fires (or the pass limit is hit).
    pub fn run(&mut self) -> Result<RunSummary> {
        validate_source_root(&self.options.source_root)
            .map_err(|e| CourierError::SourceRoot(e.to_string()))?;

        let started_at = Local::now();
        info!(
            source = %self.options.source_root.display(),
            destination = %self.options.destination_root.display(),
            transfer = self.transfer.name(),
            dry_run = self.options.dry_run,
            "Courier started"
        );

        if !self.options.startup_delay.is_zero() {
            info!(
                "Waiting {:?} before the first scan to give the producer time to write its first granule",
                self.options.startup_delay
            );
            thread::sleep(self.options.startup_delay);
        }

        self.state = RunState::new(
            Instant::now(),
            self.options.initial_idle_timeout,
            self.options.steady_idle_timeout,
        );

        let mut totals = PassReport::default();
        let mut passes = 0u64;
        let stop_reason = loop {
            let report = self.scan_pass(SystemTime::now())?;
            passes += 1;
            totals.absorb(&report);

            let now = Instant::now();
            if self.state.should_stop(now, report.pending) {
                info!(
                    "No new granules for {:?} (idle timeout {:?}), stopping",
                    self.state.idle_for(now),
                    self.state.idle_timeout()
                );
                break StopReason::Idle;
            }
            if self.options.max_passes.map_or(false, |max| passes >= max) {
                info!(passes, "Pass limit reached, stopping");
                break StopReason::PassLimit;
            }

            info!("Pausing for {:?}.", self.options.poll_interval);
            thread::sleep(self.options.poll_interval);
        };

        let summary = RunSummary {
            started_at,
            finished_at: Local::now(),
            dry_run: self.options.dry_run,
            passes,
            transferred: totals.transferred,
            failed: totals.failed,
            dry_run_actions: totals.dry_run_actions,
            delete_failures: totals.delete_failures,
            walk_errors: totals.walk_errors,
            pending: totals.pending,
            final_idle_timeout_secs: self.state.idle_timeout().as_secs(),
            stop_reason,
        };

        info!(
            passes = summary.passes,
            transferred = summary.transferred,
            failed = summary.failed,
            dry_run_actions = summary.dry_run_actions,
            "Courier stopped"
        );
        Ok(summary)
    }

    /// One scan of the source tree. `now` is the reference time for file ages.
    pub fn scan_pass(&mut self, now: SystemTime) -> Result<PassReport> {
        let mut report = PassReport::default();
        let files = self.discover(&mut report);

        for file in &files {
            let age = file.age(now);
            if age <= self.options.min_file_age {
                debug!(
                    file = %file.path.display(),
                    age_secs = age.as_secs(),
                    "Granule too young, waiting for the producer to finish"
                );
                report.pending += 1;
                continue;
            }
            self.move_granule(file, &mut report)?;
        }

        debug!(
            seen = report.files_seen,
            ignored = report.ignored,
            pending = report.pending,
            transferred = report.transferred,
            failed = report.failed,
            phase = ?self.state.phase(Instant::now()),
            "Pass complete"
        );
        Ok(report)
    }

    fn discover(&self, report: &mut PassReport) -> Vec<WatchedFile> {
        let mut files = Vec::new();
        let archive_root = comparable_path(&self.options.destination_root);
        let walker = WalkDir::new(&self.options.source_root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let is_archive = entry.depth() > 0
                    && entry.file_type().is_dir()
                    && (entry.path() == self.options.destination_root.as_path()
                        || comparable_path(entry.path()) == archive_root);
                if is_archive {
                    debug!(dir = %entry.path().display(), "Not descending into the archive");
                }
                !is_archive
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable entry in source tree");
                    report.walk_errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            report.files_seen += 1;

            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                debug!(file = %path.display(), "Ignoring non UTF-8 file name");
                report.ignored += 1;
                continue;
            };
            if !has_extension(path, self.options.extension.as_deref()) {
                report.ignored += 1;
                continue;
            }
            let Some(date) = parse_granule_date(file_name) else {
                debug!(file = %path.display(), "Ignoring file without a granule date");
                report.ignored += 1;
                continue;
            };

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    // Usually the file vanished between readdir and stat.
                    debug!(file = %path.display(), error = %e, "Cannot stat granule, skipping");
                    report.walk_errors += 1;
                    continue;
                }
            };

            let timestamp = match file_timestamp(&metadata, self.options.age_basis) {
                Ok(timestamp) => timestamp,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "No usable file timestamp, treating as just written");
                    SystemTime::now()
                }
            };

            files.push(WatchedFile {
                path: path.to_path_buf(),
                file_name: file_name.to_string(),
                date,
                timestamp,
                size: metadata.len(),
            });
        }
        files
    }

    fn move_granule(&mut self, file: &WatchedFile, report: &mut PassReport) -> Result<()> {
        let dest_dir = destination_dir(
            &self.options.destination_root,
            &self.options.category,
            file.date,
        );

        let destination = dest_dir.join(&file.file_name);
        if same_path(&destination, &file.path) {
            warn!(
                file = %file.path.display(),
                "Granule is already at its archive path, leaving it in place"
            );
            report.ignored += 1;
            return Ok(());
        }

        if self.options.dry_run {
            info!(
                "[TEST MODE] Would copy and delete: {} to {}",
                file.file_name,
                dest_dir.display()
            );
            report.dry_run_actions += 1;
            if self.options.dry_run_idle == DryRunIdle::Reset {
                self.state.record_progress(Instant::now());
            }
            return Ok(());
        }

        ensure_destination_dir(&dest_dir)?;
        let outcome = self.transfer.transfer(&file.path, &destination)?;

        if !outcome.succeeded {
            warn!(
                "{} failed for: {}. Error: {}",
                self.transfer.name(),
                file.path.display(),
                outcome.diagnostics()
            );
            report.failed += 1;
            return Ok(());
        }

        info!(
            size = file.size,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "{} successful for: {}",
            self.transfer.name(),
            file.path.display()
        );
        match fs::remove_file(&file.path) {
            Ok(()) => info!("Deleted original file: {}", file.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(file = %file.path.display(), "Source vanished before it could be deleted")
            }
            Err(e) => {
                error!(
                    file = %file.path.display(),
                    error = %e,
                    "Transferred but could not delete the source; it will be sent again"
                );
                report.delete_failures += 1;
            }
        }

        report.transferred += 1;
        self.state.record_transfer(Instant::now());
        if self.state.transfers() == 1 {
            info!(
                "First granule archived, idle timeout lowered to {:?}",
                self.state.idle_timeout()
            );
        }
        Ok(())
    }
}

fn file_timestamp(metadata: &Metadata, basis: AgeBasis) -> io::Result<SystemTime> {
    match basis {
        AgeBasis::Modified => metadata.modified(),
        AgeBasis::Created => metadata.created().or_else(|_| metadata.modified()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_age_clamps_future_timestamps() {
        let now = SystemTime::now();
        let file = WatchedFile {
            path: PathBuf::from("/src/A_000001_20110523T0630.nc4"),
            file_name: "A_000001_20110523T0630.nc4".to_string(),
            date: GranuleDate { year: 2011, month: 5 },
            timestamp: now + Duration::from_secs(30),
            size: 0,
        };
        assert_eq!(file.age(now), Duration::ZERO);
        assert_eq!(file.age(now + Duration::from_secs(90)), Duration::from_secs(60));
    }

    #[test]
    fn test_absorb_accumulates_and_keeps_last_pending() {
        let mut totals = PassReport::default();
        totals.absorb(&PassReport {
            transferred: 2,
            pending: 3,
            ..PassReport::default()
        });
        totals.absorb(&PassReport {
            transferred: 1,
            failed: 1,
            pending: 0,
            ..PassReport::default()
        });
        assert_eq!(totals.transferred, 3);
        assert_eq!(totals.failed, 1);
        assert_eq!(totals.pending, 0);
    }
}
