//! Error types for the courier

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Courier error type
///
/// Everything here stops the watcher. Transient transfer failures are not
/// errors; they come back as a failed [`crate::transfer::TransferOutcome`].
#[derive(Error, Debug)]
pub enum CourierError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Source root not usable: {0}")]
    SourceRoot(String),

    #[error("Failed to create destination directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to start transfer program '{program}': {source}")]
    TransferSpawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Transfer of {} did not finish within {}s", path.display(), timeout.as_secs())]
    TransferTimeout { path: PathBuf, timeout: Duration },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, CourierError>;
