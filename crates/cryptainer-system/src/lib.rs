#![forbid(unsafe_code)]

//! Host-tool backed implementations of the cryptainer OS collaborators.
//!
//! Integrates with the host via:
//! - `losetup` (loop attach/detach/list)
//! - `cryptsetup` (format/open/close/status)
//! - `mkfs.<type>` (filesystem creation)
//! - `mount`/`umount` plus `/proc/mounts` (mount table)

mod command;
mod crypt;
mod fs;
mod loopdev;
mod mounts;

pub use crypt::SystemBlockCrypto;
pub use fs::SystemFilesystemFormatter;
pub use loopdev::SystemLoopDevices;
pub use mounts::{SystemMountTable, MOUNTS_OVERRIDE_ENV};

use cryptainer_core::config::CryptainerConfig;
use cryptainer_core::error::CryptainerResult;

/// The four system collaborators, resolved from one configuration snapshot.
#[derive(Debug, Clone)]
pub struct SystemResources {
    pub loops: SystemLoopDevices,
    pub crypto: SystemBlockCrypto,
    pub mkfs: SystemFilesystemFormatter,
    pub mounts: SystemMountTable,
}

impl SystemResources {
    pub fn from_config(config: &CryptainerConfig) -> CryptainerResult<Self> {
        Ok(Self {
            loops: SystemLoopDevices::from_config(config)?,
            crypto: SystemBlockCrypto::from_config(config)?,
            mkfs: SystemFilesystemFormatter::from_config(config),
            mounts: SystemMountTable::from_config(config)?,
        })
    }
}
