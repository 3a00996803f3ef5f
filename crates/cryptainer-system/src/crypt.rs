//! System-backed `BlockCrypto` implementation wrapping `cryptsetup`.
//!
//! Passphrases are fed through stdin (`--key-file -`) so they never appear
//! in the process table. Old cryptsetup releases without the unified
//! `open`/`close` verbs are handled via `luksOpen`/`luksClose` fallbacks.

use crate::command::{action_unsupported, output_diagnostic, resolve_binary, Output, ToolCommand};
use cryptainer_core::config::CryptainerConfig;
use cryptainer_core::error::{CryptainerError, CryptainerResult};
use cryptainer_core::resources::{BlockCrypto, MappingState};
use std::path::Path;

const DEFAULT_CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];

#[derive(Debug, Clone)]
pub struct SystemBlockCrypto {
    cryptsetup: ToolCommand,
}

impl SystemBlockCrypto {
    pub fn from_config(config: &CryptainerConfig) -> CryptainerResult<Self> {
        let binary = resolve_binary(
            config.system.cryptsetup_path.as_deref(),
            DEFAULT_CRYPTSETUP_PATHS,
            "cryptsetup",
        )?;
        Ok(Self {
            cryptsetup: ToolCommand::new(binary, config.command_timeout()),
        })
    }
}

impl BlockCrypto for SystemBlockCrypto {
    type Error = CryptainerError;

    fn format(&self, device: &str, passphrase: &[u8]) -> CryptainerResult<()> {
        let out = self.cryptsetup.run(
            &[
                "luksFormat",
                "--type",
                "luks2",
                "--batch-mode",
                "--key-file",
                "-",
                device,
            ],
            Some(passphrase),
        )?;
        if out.status == 0 {
            return Ok(());
        }

        Err(CryptainerError::System(format!(
            "cryptsetup failed to initialise encryption on {device}: {} (exit code {})",
            output_diagnostic(&out),
            out.status
        )))
    }

    fn open(&self, device: &str, name: &str, passphrase: &[u8]) -> CryptainerResult<()> {
        let primary_args = [
            "open",
            "--type",
            "luks",
            "--batch-mode",
            "--key-file",
            "-",
            device,
            name,
        ];
        let mut out = self.cryptsetup.run(&primary_args, Some(passphrase))?;

        if out.status != 0 && action_unsupported(&out) {
            let fallback_args = ["luksOpen", "--batch-mode", "--key-file", "-", device, name];
            out = self.cryptsetup.run(&fallback_args, Some(passphrase))?;
        }

        if out.status == 0 || dev_mapper_node_exists(name) {
            return Ok(());
        }

        let diagnostic = output_diagnostic(&out);
        if wrong_passphrase(&diagnostic) {
            return Err(CryptainerError::AuthenticationFailed(name.to_string()));
        }

        Err(CryptainerError::System(format!(
            "cryptsetup failed to open mapping `{name}` from {device}: {diagnostic} (exit code {})",
            out.status
        )))
    }

    fn close(&self, name: &str) -> CryptainerResult<()> {
        let mut out = self.cryptsetup.run(&["close", name], None)?;
        if out.status != 0 && action_unsupported(&out) {
            out = self.cryptsetup.run(&["luksClose", name], None)?;
        }

        if out.status == 0 {
            return Ok(());
        }

        let diagnostic = output_diagnostic(&out);
        let lower = diagnostic.to_ascii_lowercase();
        if lower.contains("does not exist")
            || lower.contains("doesn't exist")
            || lower.contains("not active")
        {
            // Already closed; the state we wanted.
            return Ok(());
        }

        Err(CryptainerError::System(format!(
            "cryptsetup failed to close mapping `{name}`: {diagnostic} (exit code {})",
            out.status
        )))
    }

    fn status(&self, name: &str) -> CryptainerResult<MappingState> {
        if dev_mapper_node_exists(name) {
            return Ok(MappingState::Active);
        }
        let out = self.cryptsetup.run(&["status", name], None)?;
        Ok(classify_status(name, &out))
    }
}

fn dev_mapper_node_exists(name: &str) -> bool {
    let root = Path::new("/dev/mapper");
    root.is_dir() && root.join(name).exists()
}

fn wrong_passphrase(diagnostic: &str) -> bool {
    let lower = diagnostic.to_ascii_lowercase();
    lower.contains("no key available")
        || lower.contains("wrong key")
        || lower.contains("passphrase is incorrect")
        || lower.contains("invalid passphrase")
}

fn classify_status(name: &str, output: &Output) -> MappingState {
    match output.status {
        0 => return MappingState::Active,
        4 => return MappingState::Inactive,
        _ => {}
    }

    let diagnostic = output_diagnostic(output);
    let lower = diagnostic.to_ascii_lowercase();
    if lower.contains("is inactive")
        || lower.contains("not active")
        || lower.contains("does not exist")
        || lower.contains("doesn't exist")
    {
        return MappingState::Inactive;
    }

    MappingState::Unknown(if diagnostic.is_empty() {
        format!("cryptsetup status {name} exited with code {}", output.status)
    } else {
        format!(
            "cryptsetup status {name} exited with code {}: {diagnostic}",
            output.status
        )
    })
}
