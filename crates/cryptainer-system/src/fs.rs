//! System-backed `FilesystemFormatter` wrapping `mkfs.<type>`.

use crate::command::{output_diagnostic, resolve_binary, ToolCommand};
use cryptainer_core::config::CryptainerConfig;
use cryptainer_core::error::{CryptainerError, CryptainerResult};
use cryptainer_core::resources::FilesystemFormatter;
use std::time::Duration;

const DEFAULT_MKFS_DIRS: &[&str] = &["/usr/sbin", "/sbin", "/usr/bin", "/usr/local/sbin"];

#[derive(Debug, Clone)]
pub struct SystemFilesystemFormatter {
    mkfs_override: Option<String>,
    timeout: Duration,
}

impl SystemFilesystemFormatter {
    pub fn from_config(config: &CryptainerConfig) -> Self {
        Self {
            mkfs_override: config.system.mkfs_path.clone(),
            timeout: config.command_timeout(),
        }
    }
}

impl FilesystemFormatter for SystemFilesystemFormatter {
    type Error = CryptainerError;

    fn format(&self, device: &str, fs_type: &str) -> CryptainerResult<()> {
        // Resolved per call because the binary name depends on fs_type.
        let tool_name = format!("mkfs.{fs_type}");
        let defaults: Vec<String> = DEFAULT_MKFS_DIRS
            .iter()
            .map(|dir| format!("{dir}/{tool_name}"))
            .collect();
        let default_refs: Vec<&str> = defaults.iter().map(String::as_str).collect();
        let binary = resolve_binary(self.mkfs_override.as_deref(), &default_refs, &tool_name)?;

        let mkfs = ToolCommand::new(binary, self.timeout);
        let out = mkfs.run(&[device], None)?;
        if out.status == 0 {
            return Ok(());
        }

        Err(CryptainerError::System(format!(
            "{tool_name} failed on {device}: {} (exit code {})",
            output_diagnostic(&out),
            out.status
        )))
    }
}
