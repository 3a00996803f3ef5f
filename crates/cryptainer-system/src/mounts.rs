//! System-backed `MountTable`: `mount`/`umount` invocation plus live mount
//! state read from the kernel's mount table.

use crate::command::{output_diagnostic, resolve_binary, ToolCommand};
use cryptainer_core::config::CryptainerConfig;
use cryptainer_core::error::{CryptainerError, CryptainerResult};
use cryptainer_core::resources::MountTable;
use std::env;
use std::fs;
use std::path::Path;

/// Test hook: read the mount table from this file instead of /proc/mounts.
pub const MOUNTS_OVERRIDE_ENV: &str = "CRYPTAINER_MOUNTS_PATH";

const PROC_MOUNTS: &str = "/proc/mounts";
const DEFAULT_MOUNT_PATHS: &[&str] = &["/usr/bin/mount", "/bin/mount", "/usr/sbin/mount"];
const DEFAULT_UMOUNT_PATHS: &[&str] = &["/usr/bin/umount", "/bin/umount", "/usr/sbin/umount"];

#[derive(Debug, Clone)]
pub struct SystemMountTable {
    mount: ToolCommand,
    umount: ToolCommand,
}

impl SystemMountTable {
    pub fn from_config(config: &CryptainerConfig) -> CryptainerResult<Self> {
        let timeout = config.command_timeout();
        let mount = resolve_binary(
            config.system.mount_path.as_deref(),
            DEFAULT_MOUNT_PATHS,
            "mount",
        )?;
        let umount = resolve_binary(
            config.system.umount_path.as_deref(),
            DEFAULT_UMOUNT_PATHS,
            "umount",
        )?;
        Ok(Self {
            mount: ToolCommand::new(mount, timeout),
            umount: ToolCommand::new(umount, timeout),
        })
    }
}

impl MountTable for SystemMountTable {
    type Error = CryptainerError;

    fn mount(&self, device: &str, target: &Path) -> CryptainerResult<()> {
        let target_arg = target.to_string_lossy();
        let out = self.mount.run(&[device, target_arg.as_ref()], None)?;
        if out.status == 0 {
            return Ok(());
        }

        Err(CryptainerError::System(format!(
            "mount of {device} at {} failed: {} (exit code {})",
            target.display(),
            output_diagnostic(&out),
            out.status
        )))
    }

    fn unmount(&self, target: &Path) -> CryptainerResult<()> {
        let target_arg = target.to_string_lossy();
        let out = self.umount.run(&[target_arg.as_ref()], None)?;
        if out.status == 0 {
            return Ok(());
        }

        let diagnostic = output_diagnostic(&out);
        let lower = diagnostic.to_ascii_lowercase();
        if lower.contains("not mounted") || lower.contains("not currently mounted") {
            return Ok(());
        }
        if lower.contains("target is busy") || lower.contains("device is busy") {
            return Err(CryptainerError::ResourceBusy(target.to_path_buf()));
        }

        Err(CryptainerError::System(format!(
            "umount of {} failed: {diagnostic} (exit code {})",
            target.display(),
            out.status
        )))
    }

    fn is_mounted(&self, target: &Path) -> CryptainerResult<bool> {
        let table = read_mount_table()?;
        Ok(mount_table_contains(&table, target))
    }
}

fn read_mount_table() -> CryptainerResult<String> {
    if let Ok(path) = env::var(MOUNTS_OVERRIDE_ENV) {
        return fs::read_to_string(&path).map_err(|err| {
            CryptainerError::System(format!("cannot read mount table override {path}: {err}"))
        });
    }
    fs::read_to_string(PROC_MOUNTS)
        .map_err(|err| CryptainerError::System(format!("cannot read {PROC_MOUNTS}: {err}")))
}

fn mount_table_contains(table: &str, target: &Path) -> bool {
    let wanted = target.to_string_lossy();
    for line in table.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let _device = parts.next();
        let Some(mountpoint) = parts.next() else {
            continue;
        };
        if unescape_mount_field(mountpoint) == wanted {
            return true;
        }
    }
    false
}

/// The kernel escapes spaces and other separators as octal (`\040`).
fn unescape_mount_field(input: &str) -> String {
    let mut chars = input.chars().peekable();
    let mut output = String::with_capacity(input.len());

    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let mut oct = String::new();
            for _ in 0..3 {
                if let Some(next) = chars.peek() {
                    if !next.is_ascii_digit() {
                        break;
                    }
                }
                if let Some(next) = chars.next() {
                    oct.push(next);
                }
            }
            if oct.len() == 3 {
                if let Ok(value) = u8::from_str_radix(&oct, 8) {
                    output.push(value as char);
                    continue;
                }
            }
            output.push('\\');
            output.push_str(&oct);
        } else {
            output.push(ch);
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_matching_mountpoint() {
        let table = "/dev/mapper/luks_secure_1 /media/cryptainer/secure ext4 rw 0 0\n";
        assert!(mount_table_contains(
            table,
            Path::new("/media/cryptainer/secure")
        ));
        assert!(!mount_table_contains(
            table,
            Path::new("/media/cryptainer/other")
        ));
    }

    #[test]
    fn decodes_octal_escapes_in_mountpoint() {
        let table = "/dev/mapper/m /media/my\\040vault ext4 rw 0 0\n";
        assert!(mount_table_contains(table, Path::new("/media/my vault")));
    }

    #[test]
    fn unescape_leaves_plain_paths_alone() {
        assert_eq!(unescape_mount_field("/mnt/keys"), "/mnt/keys");
        assert_eq!(unescape_mount_field("/m/a\\040b"), "/m/a b");
    }

    #[test]
    fn ignores_malformed_lines() {
        assert!(!mount_table_contains("garbage\n\n", Path::new("/mnt")));
    }
}
