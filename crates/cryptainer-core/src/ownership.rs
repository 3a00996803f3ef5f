//! Invoking-user capture and ownership fixing.
//!
//! The manager frequently runs elevated (loop attach and mount require it),
//! but backing files, mountpoints, and the registry belong to the person who
//! ran the tool. `Ownership` is resolved once when configuration is loaded
//! and threaded through every component call.

use crate::error::{CryptainerError, CryptainerResult};
use std::env;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Uid/gid pair the manager hands created resources to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

impl Ownership {
    /// Resolve the invoking user: the sudo caller when running elevated,
    /// otherwise the effective uid/gid of this process.
    pub fn invoking_user() -> Self {
        let uid = env::var("SUDO_UID")
            .ok()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .unwrap_or_else(|| unsafe { libc::geteuid() });
        let gid = env::var("SUDO_GID")
            .ok()
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .unwrap_or_else(|| unsafe { libc::getegid() });
        Self { uid, gid }
    }

    /// Hand `path` to the captured user.
    pub fn apply(&self, path: &Path) -> CryptainerResult<()> {
        let raw = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
            CryptainerError::InvalidConfig(format!(
                "path {} contains an interior NUL byte",
                path.display()
            ))
        })?;
        let rc = unsafe { libc::chown(raw.as_ptr(), self.uid, self.gid) };
        if rc != 0 {
            return Err(CryptainerError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Default for Ownership {
    fn default() -> Self {
        Self::invoking_user()
    }
}
