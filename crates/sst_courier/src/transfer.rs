//! Transfer backends: moving one granule into the archive.
//!
//! A backend copies `source` to `destination` and reports what happened.
//! It never deletes the source; the watcher does that after a successful
//! outcome. `Err` is reserved for conditions that should stop the watcher
//! (missing program, aborted timeout); everything else is a failed
//! [`TransferOutcome`] and the file is retried on the next pass.

use crate::config::{TimeoutPolicy, TransferConfig, TransferMethod};
use crate::error::{CourierError, Result};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const COPY_BUFFER_SIZE: usize = 256 * 1024;

/// Result of one transfer attempt.
#[derive(Debug, Clone, Default)]
pub struct TransferOutcome {
    pub succeeded: bool,
    /// Exit status of the transfer program, if one ran to completion.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl TransferOutcome {
    /// Best single-line explanation of a failure.
    pub fn diagnostics(&self) -> String {
        let text = if !self.stderr.trim().is_empty() {
            self.stderr.trim()
        } else {
            self.stdout.trim()
        };
        if !text.is_empty() {
            return text.lines().collect::<Vec<_>>().join(" | ");
        }
        if self.timed_out {
            return "timed out".to_string();
        }
        match self.exit_code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Pluggable transfer mechanism.
pub trait Transfer {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Copy `source` to `destination` (a full file path whose parent exists).
    fn transfer(&self, source: &Path, destination: &Path) -> Result<TransferOutcome>;
}

/// Build the backend selected in the config.
pub fn from_config(config: &TransferConfig) -> Box<dyn Transfer> {
    match config.method {
        TransferMethod::Rsync => Box::new(RsyncTransfer::from_config(config)),
        TransferMethod::Copy => Box::new(CopyTransfer),
    }
}

/// Create the destination directory and any missing parents.
///
/// An existing directory is fine. Anything else (permissions, a regular file
/// in the way, an unmounted archive) is fatal.
pub fn ensure_destination_dir(dir: &Path) -> Result<()> {
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(source) => Err(CourierError::CreateDir {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

/// Runs an external sync program: `<program> <args...> <source> <destination>`.
#[derive(Debug, Clone)]
pub struct RsyncTransfer {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
    on_timeout: TimeoutPolicy,
}

impl RsyncTransfer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
            on_timeout: TimeoutPolicy::Retry,
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
            .with_timeout(config.timeout(), config.on_timeout)
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>, on_timeout: TimeoutPolicy) -> Self {
        self.timeout = timeout;
        self.on_timeout = on_timeout;
        self
    }
}

impl Transfer for RsyncTransfer {
    fn name(&self) -> &str {
        &self.program
    }

    fn transfer(&self, source: &Path, destination: &Path) -> Result<TransferOutcome> {
        let start = Instant::now();
        debug!(program = %self.program, args = ?self.args, source = %source.display(), destination = %destination.display(), "Starting transfer");

        let spawned = Command::new(&self.program)
            .args(&self.args)
            .arg(source)
            .arg(destination)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied) => {
                return Err(CourierError::TransferSpawn {
                    program: self.program.clone(),
                    source: e,
                });
            }
            Err(e) => {
                return Ok(TransferOutcome {
                    stderr: format!("failed to start {}: {}", self.program, e),
                    elapsed: start.elapsed(),
                    ..TransferOutcome::default()
                });
            }
        };

        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        match wait_with_deadline(&mut child, self.timeout)? {
            Some(status) => Ok(TransferOutcome {
                succeeded: status.success(),
                exit_code: status.code(),
                timed_out: false,
                stdout: join_reader(stdout_reader),
                stderr: join_reader(stderr_reader),
                elapsed: start.elapsed(),
            }),
            None => {
                // Readers are left detached: a grandchild may still hold the pipes.
                let timeout = self.timeout.unwrap_or_default();
                match self.on_timeout {
                    TimeoutPolicy::Abort => Err(CourierError::TransferTimeout {
                        path: source.to_path_buf(),
                        timeout,
                    }),
                    TimeoutPolicy::Retry => Ok(TransferOutcome {
                        timed_out: true,
                        stderr: format!(
                            "{} killed after {}s",
                            self.program,
                            timeout.as_secs_f64()
                        ),
                        elapsed: start.elapsed(),
                        ..TransferOutcome::default()
                    }),
                }
            }
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            String::from_utf8_lossy(&bytes).into_owned()
        })
    })
}

fn join_reader(reader: Option<JoinHandle<String>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn cleanup_process(process: &mut Child) {
    let _ = process.kill();
    let _ = process.wait();
}

/// Wait for the child to exit. `None` means the deadline passed and the
/// child was killed.
fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>) -> Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return Ok(Some(child.wait()?));
    };

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            cleanup_process(child);
            return Ok(None);
        }
        thread::sleep(WAIT_POLL_INTERVAL.min(deadline - now));
    }
}

/// In-process copy verified with BLAKE3.
///
/// Writes to a hidden `.<name>.partial` file next to the destination, syncs
/// it, re-reads it and compares digests before renaming it into place, so
/// the archive never holds a truncated granule under its real name.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyTransfer;

impl Transfer for CopyTransfer {
    fn name(&self) -> &str {
        "copy"
    }

    fn transfer(&self, source: &Path, destination: &Path) -> Result<TransferOutcome> {
        let start = Instant::now();
        let outcome = match verified_copy(source, destination) {
            Ok(digest) => TransferOutcome {
                succeeded: true,
                stdout: format!("blake3 {}", digest.to_hex()),
                elapsed: start.elapsed(),
                ..TransferOutcome::default()
            },
            Err(e) => TransferOutcome {
                stderr: e.to_string(),
                elapsed: start.elapsed(),
                ..TransferOutcome::default()
            },
        };
        Ok(outcome)
    }
}

fn partial_path(destination: &Path) -> io::Result<PathBuf> {
    let file_name = destination.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("destination has no file name: {}", destination.display()),
        )
    })?;
    let mut partial = std::ffi::OsString::from(".");
    partial.push(file_name);
    partial.push(".partial");
    Ok(destination.with_file_name(partial))
}

fn verified_copy(source: &Path, destination: &Path) -> io::Result<blake3::Hash> {
    let partial = partial_path(destination)?;
    let result = copy_then_verify(source, &partial).and_then(|digest| {
        fs::rename(&partial, destination)?;
        Ok(digest)
    });
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

fn copy_then_verify(source: &Path, partial: &Path) -> io::Result<blake3::Hash> {
    let mut reader = File::open(source)?;
    let permissions = reader.metadata()?.permissions();
    let mut writer = File::create(partial)?;

    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
    }
    writer.sync_all()?;
    drop(writer);
    fs::set_permissions(partial, permissions)?;

    let source_digest = hasher.finalize();
    let copied_digest = hash_file(partial)?;
    if source_digest != copied_digest {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "checksum mismatch after copy: source {} copy {}",
                source_digest.to_hex(),
                copied_digest.to_hex()
            ),
        ));
    }
    Ok(source_digest)
}

fn hash_file(path: &Path) -> io::Result<blake3::Hash> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn granule(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_ensure_destination_dir_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("SST").join("2011").join("05");

        ensure_destination_dir(&dir).unwrap();
        assert!(dir.is_dir());
        ensure_destination_dir(&dir).unwrap();
    }

    #[test]
    fn test_ensure_destination_dir_fails_on_file_in_the_way() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("SST");
        fs::write(&blocker, b"not a directory").unwrap();

        let err = ensure_destination_dir(&blocker.join("2011")).unwrap_err();
        assert!(matches!(err, CourierError::CreateDir { .. }), "{:?}", err);
    }

    #[test]
    fn test_copy_transfer_copies_and_verifies() {
        let temp = TempDir::new().unwrap();
        let source = granule(temp.path(), "A_000001_20110523T0630.nc4", &[7u8; 300_000]);
        let dest_dir = temp.path().join("archive");
        fs::create_dir_all(&dest_dir).unwrap();
        let destination = dest_dir.join("A_000001_20110523T0630.nc4");

        let outcome = CopyTransfer.transfer(&source, &destination).unwrap();

        assert!(outcome.succeeded, "{}", outcome.diagnostics());
        assert!(outcome.stdout.starts_with("blake3 "));
        assert_eq!(fs::read(&destination).unwrap(), vec![7u8; 300_000]);
        assert!(source.exists(), "the backend must not delete the source");
        assert!(!dest_dir.join(".A_000001_20110523T0630.nc4.partial").exists());
    }

    #[test]
    fn test_copy_transfer_missing_source_is_a_failed_outcome() {
        let temp = TempDir::new().unwrap();
        let destination = temp.path().join("out.nc4");

        let outcome = CopyTransfer
            .transfer(&temp.path().join("gone.nc4"), &destination)
            .unwrap();

        assert!(!outcome.succeeded);
        assert!(!outcome.stderr.is_empty());
        assert!(!destination.exists());
        assert!(!temp.path().join(".out.nc4.partial").exists());
    }

    #[test]
    fn test_diagnostics_prefers_stderr() {
        let outcome = TransferOutcome {
            stdout: "sending incremental file list".to_string(),
            stderr: "rsync: connection unexpectedly closed\nrsync error: code 12\n".to_string(),
            exit_code: Some(12),
            ..TransferOutcome::default()
        };
        assert_eq!(
            outcome.diagnostics(),
            "rsync: connection unexpectedly closed | rsync error: code 12"
        );

        let silent = TransferOutcome {
            exit_code: Some(23),
            ..TransferOutcome::default()
        };
        assert_eq!(silent.diagnostics(), "exit status 23");
    }

    #[test]
    fn test_from_config_selects_backend() {
        let mut config = TransferConfig::default();
        assert_eq!(from_config(&config).name(), "rsync");
        config.method = TransferMethod::Copy;
        assert_eq!(from_config(&config).name(), "copy");
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;

        fn sh(script: &str) -> RsyncTransfer {
            RsyncTransfer::new(
                "sh",
                vec!["-c".to_string(), script.to_string(), "sh".to_string()],
            )
        }

        #[test]
        fn test_program_success() {
            let temp = TempDir::new().unwrap();
            let source = granule(temp.path(), "in.nc4", b"granule");
            let destination = temp.path().join("out.nc4");

            let outcome = RsyncTransfer::new("cp", Vec::new())
                .transfer(&source, &destination)
                .unwrap();

            assert!(outcome.succeeded);
            assert_eq!(outcome.exit_code, Some(0));
            assert_eq!(fs::read(&destination).unwrap(), b"granule");
        }

        #[test]
        fn test_program_failure_captures_stderr() {
            let temp = TempDir::new().unwrap();
            let source = granule(temp.path(), "in.nc4", b"granule");

            let outcome = sh("echo \"cannot reach $2\" >&2; exit 3")
                .transfer(&source, &temp.path().join("out.nc4"))
                .unwrap();

            assert!(!outcome.succeeded);
            assert!(!outcome.timed_out);
            assert_eq!(outcome.exit_code, Some(3));
            assert!(outcome.stderr.contains("cannot reach"));
            assert!(outcome.stderr.contains("out.nc4"));
        }

        #[test]
        fn test_missing_program_is_fatal() {
            let temp = TempDir::new().unwrap();
            let source = granule(temp.path(), "in.nc4", b"granule");

            let err = RsyncTransfer::new("sst-courier-no-such-sync-tool", Vec::new())
                .transfer(&source, &temp.path().join("out.nc4"))
                .unwrap_err();

            assert!(matches!(err, CourierError::TransferSpawn { .. }), "{:?}", err);
        }

        #[test]
        fn test_timeout_retry_kills_program() {
            let temp = TempDir::new().unwrap();
            let source = granule(temp.path(), "in.nc4", b"granule");

            let outcome = sh("exec sleep 5")
                .with_timeout(Some(Duration::from_millis(200)), TimeoutPolicy::Retry)
                .transfer(&source, &temp.path().join("out.nc4"))
                .unwrap();

            assert!(!outcome.succeeded);
            assert!(outcome.timed_out);
            assert!(outcome.elapsed < Duration::from_secs(4));
        }

        #[test]
        fn test_timeout_abort_is_fatal() {
            let temp = TempDir::new().unwrap();
            let source = granule(temp.path(), "in.nc4", b"granule");

            let err = sh("exec sleep 5")
                .with_timeout(Some(Duration::from_millis(200)), TimeoutPolicy::Abort)
                .transfer(&source, &temp.path().join("out.nc4"))
                .unwrap_err();

            assert!(matches!(err, CourierError::TransferTimeout { .. }), "{:?}", err);
        }
    }
}
