use std::path::PathBuf;

use thiserror::Error;

/// Failures while fetching or unpacking a chosen artifact.
#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("unknown hash name: {0}")]
    UnknownHash(String),
    #[error("hash mismatch for {link}: expected one of {expected}, got {got}")]
    HashMismatch {
        link: String,
        expected: String,
        got: String,
    },
    #[error("download failed for {link}: status {status}")]
    DownloadFailed { link: String, status: u16 },
    #[error("unknown archive type: {0}")]
    UnknownArchive(String),
    #[error("the archive entry {entry} would be extracted outside of {}", dest.display())]
    UnsafeEntry { entry: String, dest: PathBuf },
}
