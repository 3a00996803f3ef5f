//! Error taxonomy shared across the workspace.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type CryptainerResult<T> = Result<T, CryptainerError>;

/// Failures surfaced by lifecycle operations and their collaborators.
///
/// Every variant names the resource that failed; callers print these
/// verbatim, so messages must stand on their own without surrounding
/// context.
#[derive(Debug, Error)]
pub enum CryptainerError {
    #[error("mapper name `{0}` is already active on this system")]
    NameInUse(String),

    #[error("failed to allocate backing file {}: {reason}", path.display())]
    AllocationFailed { path: PathBuf, reason: String },

    #[error("failed to open encrypted mapping `{0}`: wrong passphrase")]
    AuthenticationFailed(String),

    #[error("passphrase entries do not match")]
    PassphraseMismatch,

    #[error("backing file {} no longer exists on disk", .0.display())]
    BackingFileMissing(PathBuf),

    #[error("cannot unmount {}: filesystem is busy", .0.display())]
    ResourceBusy(PathBuf),

    #[error("no loop device available: {0}")]
    ResourceExhausted(String),

    #[error("registry record on line {line} is corrupt: {reason}")]
    RegistryCorrupt { line: usize, reason: String },

    #[error("container deleted, but cleanup was incomplete: {0}")]
    PartialFailure(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("system command failed: {0}")]
    System(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
