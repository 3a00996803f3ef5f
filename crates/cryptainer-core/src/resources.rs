//! Collaborator contracts for the OS resources the manager coordinates.
//!
//! Concrete implementations live in `cryptainer-system` and wrap host
//! tooling. The kernel owns the live resource state; these traits are how
//! the manager asks for ground truth instead of trusting the registry.

use std::error::Error;
use std::path::Path;

/// Normalised state for an encrypted mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingState {
    Active,
    Inactive,
    Unknown(String),
}

/// One active loop device and the file it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopBinding {
    /// Device node, e.g. `/dev/loop3`.
    pub device: String,
    /// Backing file the kernel reports for the device.
    pub backing_file: std::path::PathBuf,
}

/// Kernel loop-device subsystem.
pub trait LoopDevices {
    type Error: Error + Send + Sync + 'static;

    /// Bind `backing` to the next free loop device and return its node.
    fn attach(&self, backing: &Path) -> Result<String, Self::Error>;

    /// Release a loop device. Releasing an already-detached device is a
    /// success.
    fn detach(&self, device: &str) -> Result<(), Self::Error>;

    /// Snapshot of all active loop bindings on the system.
    fn list_active(&self) -> Result<Vec<LoopBinding>, Self::Error>;
}

/// Block-encryption subsystem (dm-crypt via `cryptsetup` in production).
pub trait BlockCrypto {
    type Error: Error + Send + Sync + 'static;

    /// Initialise encryption on `device`, keyed by `passphrase`.
    fn format(&self, device: &str, passphrase: &[u8]) -> Result<(), Self::Error>;

    /// Open `device` as mapping `name`.
    fn open(&self, device: &str, name: &str, passphrase: &[u8]) -> Result<(), Self::Error>;

    /// Close mapping `name`. Closing an inactive mapping is a success.
    fn close(&self, name: &str) -> Result<(), Self::Error>;

    /// Live state of mapping `name`.
    fn status(&self, name: &str) -> Result<MappingState, Self::Error>;
}

/// Filesystem creation on a freshly opened mapping.
pub trait FilesystemFormatter {
    type Error: Error + Send + Sync + 'static;

    fn format(&self, device: &str, fs_type: &str) -> Result<(), Self::Error>;
}

/// The VFS mount table.
pub trait MountTable {
    type Error: Error + Send + Sync + 'static;

    fn mount(&self, device: &str, target: &Path) -> Result<(), Self::Error>;

    /// Unmount `target`. Unmounting a path that is not mounted is a
    /// success; a busy filesystem is not.
    fn unmount(&self, target: &Path) -> Result<(), Self::Error>;

    fn is_mounted(&self, target: &Path) -> Result<bool, Self::Error>;
}
