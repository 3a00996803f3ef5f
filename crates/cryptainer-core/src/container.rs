//! The container record and its on-disk line codec.

use crate::error::{CryptainerError, CryptainerResult};
use std::path::{Path, PathBuf};

/// Reserved field separator for registry records. Not legal in any field;
/// creation rejects paths and names containing it.
pub const FIELD_DELIMITER: char = '|';

/// One managed encrypted container.
///
/// `device_handle` is whatever loop device was bound last time we touched
/// the container. Loop devices are renumbered freely by the kernel, so the
/// handle is a hint to be re-validated against live state, never trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub backing_path: PathBuf,
    pub device_handle: Option<String>,
    pub mapper_name: String,
    pub mount_point: PathBuf,
}

impl Container {
    /// Serialize to the four-field registry line.
    pub fn to_record_line(&self) -> String {
        format!(
            "{}{FIELD_DELIMITER}{}{FIELD_DELIMITER}{}{FIELD_DELIMITER}{}",
            self.backing_path.display(),
            self.device_handle.as_deref().unwrap_or(""),
            self.mapper_name,
            self.mount_point.display(),
        )
    }

    /// Parse a registry line into a record; `line_number` is 1-based and
    /// only used for error reporting.
    pub fn from_record_line(line: &str, line_number: usize) -> CryptainerResult<Self> {
        let fields: Vec<&str> = line.split(FIELD_DELIMITER).collect();
        if fields.len() != 4 {
            return Err(CryptainerError::RegistryCorrupt {
                line: line_number,
                reason: format!("expected 4 fields, found {}", fields.len()),
            });
        }

        let backing_path = fields[0].trim();
        let mapper_name = fields[2].trim();
        let mount_point = fields[3].trim();
        if backing_path.is_empty() || mapper_name.is_empty() || mount_point.is_empty() {
            return Err(CryptainerError::RegistryCorrupt {
                line: line_number,
                reason: "backing path, mapper name, and mount point must be non-empty".to_string(),
            });
        }

        let device_handle = match fields[1].trim() {
            "" => None,
            handle => Some(handle.to_string()),
        };

        Ok(Self {
            backing_path: PathBuf::from(backing_path),
            device_handle,
            mapper_name: mapper_name.to_string(),
            mount_point: PathBuf::from(mount_point),
        })
    }

    /// Reject any field that would break the line codec.
    pub fn check_encodable(&self) -> CryptainerResult<()> {
        for (label, value) in [
            ("backing path", self.backing_path.display().to_string()),
            ("mapper name", self.mapper_name.clone()),
            ("mount point", self.mount_point.display().to_string()),
        ] {
            if value.contains(FIELD_DELIMITER) {
                return Err(CryptainerError::InvalidConfig(format!(
                    "{label} `{value}` contains the reserved `{FIELD_DELIMITER}` separator"
                )));
            }
            if value.contains('\n') {
                return Err(CryptainerError::InvalidConfig(format!(
                    "{label} `{value}` contains a newline"
                )));
            }
        }
        Ok(())
    }

    /// Mountpoint a container gets by default: the backing file's base name
    /// (without extension) under the configured mount root.
    pub fn derive_mount_point(mount_root: &Path, backing_path: &Path) -> PathBuf {
        let base = backing_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "container".to_string());
        mount_root.join(base)
    }
}
