//! sst-courier - granule arrival watcher and archive mover
//!
//! The SST processing jobs write Level-2 granules (`*.nc4`) into a local
//! output tree. The courier polls that tree, waits until each granule has
//! been left alone for a while, copies it into the year/month archive on the
//! remote mount, deletes the local copy, and exits by itself once the
//! producer has gone quiet.
//!
//! # Core Concepts
//!
//! - **Granule date**: year and month parsed from the file name, see [`filename`]
//! - **Transfer**: pluggable copy backend (rsync subprocess or verified copy)
//! - **RunState**: idle clock and idle timeout carried between passes
//! - **Watcher**: the polling loop

pub mod config;
pub mod error;
pub mod filename;
pub mod paths;
pub mod run_state;
pub mod transfer;
pub mod watcher;

// Re-exports for the binary and tests
pub use config::{AgeBasis, CourierConfig, DryRunIdle, TimeoutPolicy, TransferMethod};
pub use error::{CourierError, Result};
pub use filename::{parse_granule_date, GranuleDate, GRANULE_DATE_PATTERN};
pub use run_state::{Phase, RunState};
pub use transfer::{CopyTransfer, RsyncTransfer, Transfer, TransferOutcome};
pub use watcher::{PassReport, RunSummary, StopReason, WatchOptions, WatchedFile, Watcher};
