//! System-backed `LoopDevices` implementation wrapping `losetup`.

use crate::command::{action_unsupported, output_diagnostic, resolve_binary, ToolCommand};
use cryptainer_core::config::CryptainerConfig;
use cryptainer_core::error::{CryptainerError, CryptainerResult};
use cryptainer_core::resources::{LoopBinding, LoopDevices};
use log::warn;
use std::path::{Path, PathBuf};

const DEFAULT_LOSETUP_PATHS: &[&str] = &[
    "/usr/sbin/losetup",
    "/usr/bin/losetup",
    "/sbin/losetup",
    "/bin/losetup",
    "/usr/local/sbin/losetup",
];

#[derive(Debug, Clone)]
pub struct SystemLoopDevices {
    losetup: ToolCommand,
}

impl SystemLoopDevices {
    pub fn from_config(config: &CryptainerConfig) -> CryptainerResult<Self> {
        let binary = resolve_binary(
            config.system.losetup_path.as_deref(),
            DEFAULT_LOSETUP_PATHS,
            "losetup",
        )?;
        Ok(Self {
            losetup: ToolCommand::new(binary, config.command_timeout()),
        })
    }
}

impl LoopDevices for SystemLoopDevices {
    type Error = CryptainerError;

    fn attach(&self, backing: &Path) -> CryptainerResult<String> {
        let backing_arg = backing.to_string_lossy();
        let out = self
            .losetup
            .run(&["--find", "--show", backing_arg.as_ref()], None)?;

        if out.status == 0 {
            let device = out.stdout.trim();
            if device.is_empty() {
                return Err(CryptainerError::System(
                    "losetup returned an empty loop device path".into(),
                ));
            }
            return Ok(device.to_string());
        }

        let diagnostic = output_diagnostic(&out);
        let lower = diagnostic.to_ascii_lowercase();
        if lower.contains("could not find any free loop device")
            || lower.contains("no free loop")
            || lower.contains("out of free loop devices")
        {
            return Err(CryptainerError::ResourceExhausted(diagnostic));
        }

        Err(CryptainerError::System(format!(
            "losetup failed to attach {}: {diagnostic} (exit code {})",
            backing.display(),
            out.status
        )))
    }

    fn detach(&self, device: &str) -> CryptainerResult<()> {
        let out = self.losetup.run(&["-d", device], None)?;
        if out.status == 0 {
            return Ok(());
        }

        let diagnostic = output_diagnostic(&out);
        let lower = diagnostic.to_ascii_lowercase();
        if lower.contains("no such device")
            || lower.contains("no such file")
            || lower.contains("not a loop device")
        {
            // Already detached; the state we wanted.
            return Ok(());
        }

        Err(CryptainerError::System(format!(
            "losetup failed to detach {device}: {diagnostic} (exit code {})",
            out.status
        )))
    }

    fn list_active(&self) -> CryptainerResult<Vec<LoopBinding>> {
        let mut out = self.losetup.run(
            &["--list", "--noheadings", "--raw", "--output", "NAME,BACK-FILE"],
            None,
        )?;

        if out.status == 0 {
            return Ok(parse_list_output(&out.stdout));
        }

        if action_unsupported(&out) {
            warn!("losetup does not support --list; falling back to `losetup -a` parsing");
            out = self.losetup.run(&["-a"], None)?;
            if out.status == 0 {
                return Ok(parse_legacy_output(&out.stdout));
            }
        }

        Err(CryptainerError::System(format!(
            "losetup failed to list active devices: {} (exit code {})",
            output_diagnostic(&out),
            out.status
        )))
    }
}

/// Parse `losetup --list --raw --output NAME,BACK-FILE` lines.
fn parse_list_output(payload: &str) -> Vec<LoopBinding> {
    payload
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let device = parts.next()?;
            let backing = parts.collect::<Vec<_>>().join(" ");
            if backing.is_empty() {
                return None;
            }
            Some(LoopBinding {
                device: device.to_string(),
                backing_file: PathBuf::from(strip_deleted_marker(&backing)),
            })
        })
        .collect()
}

/// Parse legacy `losetup -a` lines of the form
/// `/dev/loop0: [2049]:131 (/path/to/file)`.
fn parse_legacy_output(payload: &str) -> Vec<LoopBinding> {
    payload
        .lines()
        .filter_map(|line| {
            let (device, rest) = line.split_once(':')?;
            let start = rest.find('(')?;
            let end = rest.rfind(')')?;
            if end <= start {
                return None;
            }
            let backing = &rest[start + 1..end];
            Some(LoopBinding {
                device: device.trim().to_string(),
                backing_file: PathBuf::from(strip_deleted_marker(backing)),
            })
        })
        .collect()
}

/// The kernel appends ` (deleted)` to bindings whose file was unlinked.
fn strip_deleted_marker(backing: &str) -> &str {
    backing
        .trim()
        .strip_suffix("(deleted)")
        .map(str::trim_end)
        .unwrap_or_else(|| backing.trim())
}
