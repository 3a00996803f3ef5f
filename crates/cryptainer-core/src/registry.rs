//! Durable container registry with atomic line-oriented persistence.
//!
//! The registry never holds key material, but it does reveal which encrypted
//! containers exist and where they mount, so it is written `0o600` and
//! chowned to the invoking user. Every mutation rewrites the file through a
//! temp-file-plus-rename so a crash mid-write cannot corrupt it.

use crate::config::CryptainerConfig;
use crate::container::Container;
use crate::error::{CryptainerError, CryptainerResult};
use crate::ownership::Ownership;
use log::warn;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const HEADER_LINE: &str = "# cryptainer registry v1";

/// Registry line that failed to parse; kept for reporting, dropped from
/// subsequent rewrites.
#[derive(Debug, Clone)]
pub struct QuarantinedRecord {
    pub line_number: usize,
    pub contents: String,
    pub reason: String,
}

/// In-memory snapshot of the registry file.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    pub entries: Vec<Container>,
    pub quarantined: Vec<QuarantinedRecord>,
}

impl Registry {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: usize) -> CryptainerResult<&Container> {
        self.entries.get(index).ok_or_else(|| {
            CryptainerError::InvalidConfig(format!(
                "no container at registry index {index} (registry holds {})",
                self.entries.len()
            ))
        })
    }

    pub fn find_by_backing_path(&self, path: &Path) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.backing_path == path)
    }

    pub fn find_by_mapper_name(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.mapper_name == name)
    }
}

/// Owner of the on-disk registry file.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
    owner: Ownership,
}

impl RegistryStore {
    pub fn new(path: PathBuf, owner: Ownership) -> Self {
        Self { path, owner }
    }

    pub fn from_config(config: &CryptainerConfig) -> Self {
        Self::new(config.registry_path(), config.owner)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the registry; an absent file is an empty registry. Malformed
    /// lines are quarantined with a warning instead of aborting the load.
    pub fn load(&self) -> CryptainerResult<Registry> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Registry::default())
            }
            Err(err) => return Err(CryptainerError::Io(err)),
        };

        let mut registry = Registry::default();
        for (idx, line) in contents.lines().enumerate() {
            let line_number = idx + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            match Container::from_record_line(trimmed, line_number) {
                Ok(container) => registry.entries.push(container),
                Err(err) => {
                    warn!(
                        "skipping corrupt registry record at {}:{line_number}: {err}",
                        self.path.display()
                    );
                    registry.quarantined.push(QuarantinedRecord {
                        line_number,
                        contents: line.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        Ok(registry)
    }

    /// Append a record; `backing_path` and `mapper_name` must be unique
    /// within the registry.
    pub fn append(&self, container: Container) -> CryptainerResult<Registry> {
        container.check_encodable()?;
        let mut registry = self.load()?;
        if registry
            .find_by_backing_path(&container.backing_path)
            .is_some()
        {
            return Err(CryptainerError::InvalidConfig(format!(
                "container {} is already registered",
                container.backing_path.display()
            )));
        }
        if registry.find_by_mapper_name(&container.mapper_name).is_some() {
            return Err(CryptainerError::NameInUse(container.mapper_name));
        }

        registry.entries.push(container);
        self.persist(&registry)?;
        Ok(registry)
    }

    /// Replace the record at `index`, keeping registry order stable.
    pub fn replace(&self, index: usize, container: Container) -> CryptainerResult<Registry> {
        container.check_encodable()?;
        let mut registry = self.load()?;
        if index >= registry.entries.len() {
            return Err(CryptainerError::InvalidConfig(format!(
                "no container at registry index {index} (registry holds {})",
                registry.entries.len()
            )));
        }
        registry.entries[index] = container;
        self.persist(&registry)?;
        Ok(registry)
    }

    /// Remove the record at `index`.
    pub fn remove(&self, index: usize) -> CryptainerResult<Registry> {
        let mut registry = self.load()?;
        if index >= registry.entries.len() {
            return Err(CryptainerError::InvalidConfig(format!(
                "no container at registry index {index} (registry holds {})",
                registry.entries.len()
            )));
        }
        registry.entries.remove(index);
        self.persist(&registry)?;
        Ok(registry)
    }

    /// Rewrite the whole file atomically: temp file in the same directory,
    /// restrictive permissions, fsync, rename over the original, fsync the
    /// parent directory.
    fn persist(&self, registry: &Registry) -> CryptainerResult<()> {
        if !registry.quarantined.is_empty() {
            warn!(
                "rewriting {} drops {} quarantined record(s)",
                self.path.display(),
                registry.quarantined.len()
            );
        }

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        let mut temp = NamedTempFile::new_in(parent)?;
        writeln!(temp.as_file_mut(), "{HEADER_LINE}")?;
        for entry in &registry.entries {
            writeln!(temp.as_file_mut(), "{}", entry.to_record_line())?;
        }
        temp.as_file_mut().flush()?;
        fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o600))?;
        let _ = self.owner.apply(temp.path());
        temp.as_file().sync_all()?;

        temp.persist(&self.path)
            .map_err(|err| CryptainerError::Io(err.error))?;
        let _ = sync_parent_dir(parent);
        Ok(())
    }
}

fn sync_parent_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).and_then(|file| file.sync_all())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> RegistryStore {
        RegistryStore::new(
            dir.join("registry"),
            Ownership {
                uid: unsafe { libc::geteuid() },
                gid: unsafe { libc::getegid() },
            },
        )
    }

    fn container(name: &str) -> Container {
        Container {
            backing_path: PathBuf::from(format!("/data/{name}.img")),
            device_handle: Some("/dev/loop0".into()),
            mapper_name: format!("luks_{name}_1"),
            mount_point: PathBuf::from(format!("/media/cryptainer/{name}")),
        }
    }

    #[test]
    fn absent_file_loads_empty() {
        let dir = tempdir().unwrap();
        let registry = store(dir.path()).load().unwrap();
        assert!(registry.is_empty());
        assert!(registry.quarantined.is_empty());
    }

    #[test]
    fn append_load_round_trip_with_header() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.append(container("alpha")).unwrap();
        store.append(container("beta")).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.starts_with(HEADER_LINE));

        let registry = store.load().unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.entries[0].mapper_name, "luks_alpha_1");
        assert_eq!(registry.entries[1].mapper_name, "luks_beta_1");
    }

    #[test]
    fn registry_file_is_owner_only() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.append(container("alpha")).unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn duplicate_backing_path_rejected() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.append(container("alpha")).unwrap();
        let err = store.append(container("alpha")).unwrap_err();
        assert!(matches!(err, CryptainerError::InvalidConfig(_)));
    }

    #[test]
    fn duplicate_mapper_name_rejected() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.append(container("alpha")).unwrap();

        let mut clash = container("gamma");
        clash.mapper_name = "luks_alpha_1".into();
        let err = store.append(clash).unwrap_err();
        assert!(matches!(err, CryptainerError::NameInUse(name) if name == "luks_alpha_1"));
    }

    #[test]
    fn corrupt_line_is_quarantined_not_fatal() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.append(container("alpha")).unwrap();

        let mut raw = fs::read_to_string(store.path()).unwrap();
        raw.push_str("not a record\n");
        raw.push_str(&container("beta").to_record_line());
        raw.push('\n');
        fs::write(store.path(), raw).unwrap();

        let registry = store.load().unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.quarantined.len(), 1);
        assert!(registry.quarantined[0].reason.contains("4 fields"));
    }

    #[test]
    fn replace_and_remove_keep_order() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.append(container("alpha")).unwrap();
        store.append(container("beta")).unwrap();

        let mut refreshed = container("alpha");
        refreshed.device_handle = Some("/dev/loop7".into());
        let registry = store.replace(0, refreshed).unwrap();
        assert_eq!(registry.entries[0].device_handle.as_deref(), Some("/dev/loop7"));
        assert_eq!(registry.entries[1].mapper_name, "luks_beta_1");

        let registry = store.remove(0).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.entries[0].mapper_name, "luks_beta_1");
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.remove(0).is_err());
        assert!(store.replace(3, container("alpha")).is_err());
    }
}
