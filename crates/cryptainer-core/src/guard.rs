//! Scoped rollback guards for acquired OS resources.
//!
//! Each acquisition during create/mount returns a guard whose `Drop`
//! releases the resource best-effort. Once the operation has committed (the
//! registry append succeeded), every guard is disarmed. Declaration order
//! matters: Rust drops in reverse order, so declaring file, loop, mapping,
//! mount yields the unwind sequence unmount, close, detach, remove file.

use crate::resources::{BlockCrypto, LoopDevices, MountTable};
use log::warn;
use std::fs;
use std::path::{Path, PathBuf};

/// Removes a freshly allocated backing file unless disarmed.
pub struct FileGuard {
    path: PathBuf,
    armed: bool,
}

impl FileGuard {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            armed: true,
        }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = fs::remove_file(&self.path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "rollback: failed to remove backing file {}: {err}",
                        self.path.display()
                    );
                }
            }
        }
    }
}

/// Detaches a loop device unless disarmed.
pub struct LoopGuard<'a, L: LoopDevices> {
    loops: &'a L,
    device: String,
    armed: bool,
}

impl<'a, L: LoopDevices> LoopGuard<'a, L> {
    pub fn new(loops: &'a L, device: String) -> Self {
        Self {
            loops,
            device,
            armed: true,
        }
    }

    /// A guard over a binding this call did not create; dropping it must
    /// leave the pre-existing binding alone.
    pub fn pre_existing(loops: &'a L, device: String) -> Self {
        Self {
            loops,
            device,
            armed: false,
        }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl<L: LoopDevices> Drop for LoopGuard<'_, L> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.loops.detach(&self.device) {
                warn!("rollback: failed to detach {}: {err}", self.device);
            }
        }
    }
}

/// Closes an encrypted mapping unless disarmed.
pub struct MappingGuard<'a, C: BlockCrypto> {
    crypto: &'a C,
    name: String,
    armed: bool,
}

impl<'a, C: BlockCrypto> MappingGuard<'a, C> {
    pub fn new(crypto: &'a C, name: String) -> Self {
        Self {
            crypto,
            name,
            armed: true,
        }
    }

    pub fn pre_existing(crypto: &'a C, name: String) -> Self {
        Self {
            crypto,
            name,
            armed: false,
        }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl<C: BlockCrypto> Drop for MappingGuard<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.crypto.close(&self.name) {
                warn!("rollback: failed to close mapping {}: {err}", self.name);
            }
        }
    }
}

/// Unmounts a mountpoint unless disarmed.
pub struct MountGuard<'a, M: MountTable> {
    mounts: &'a M,
    target: PathBuf,
    armed: bool,
}

impl<'a, M: MountTable> MountGuard<'a, M> {
    pub fn new(mounts: &'a M, target: &Path) -> Self {
        Self {
            mounts,
            target: target.to_path_buf(),
            armed: true,
        }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl<M: MountTable> Drop for MountGuard<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.mounts.unmount(&self.target) {
                warn!(
                    "rollback: failed to unmount {}: {err}",
                    self.target.display()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_guard_removes_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("allocated.img");
        fs::write(&path, b"x").unwrap();

        FileGuard::new(&path);
        assert!(!path.exists());
    }

    #[test]
    fn disarmed_file_guard_keeps_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("allocated.img");
        fs::write(&path, b"x").unwrap();

        FileGuard::new(&path).disarm();
        assert!(path.exists());
    }

    #[test]
    fn file_guard_tolerates_missing_file() {
        let dir = tempdir().unwrap();
        FileGuard::new(&dir.path().join("never-created.img"));
    }
}
