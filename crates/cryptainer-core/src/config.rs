//! Configuration model and helpers used by cryptainer binaries.

use crate::container::FIELD_DELIMITER;
use crate::error::{CryptainerError, CryptainerResult};
use crate::ownership::Ownership;
use directories_next::ProjectDirs;
use log::{info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/cryptainer.toml";
const BOOTSTRAP_FILE_NAME: &str = "cryptainer.toml";
const REGISTRY_FILE_NAME: &str = "registry";
const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "Cryptainer";
const APP_NAME: &str = "cryptainer";

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
}

/// Lightweight sanity check that a mapper name or prefix is safe to hand to
/// the encryption subsystem and the registry codec.
pub fn looks_like_mapper_name(name: &str) -> bool {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.contains(FIELD_DELIMITER) {
        return false;
    }
    !trimmed.starts_with('-')
        && trimmed
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.'))
}

/// Where containers are mounted and how the registry is stored.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StorageCfg {
    /// Fixed root directory under which container mountpoints are created.
    #[serde(default = "default_mount_root")]
    pub mount_root: String,

    /// Registry file path; empty selects the per-user data directory.
    #[serde(default)]
    pub registry_path: Option<String>,

    /// Filesystem created inside new containers.
    #[serde(default = "default_fs_type")]
    pub fs_type: String,

    /// Prefix used when deriving mapper names from a hint.
    #[serde(default = "default_mapper_prefix")]
    pub mapper_prefix: String,
}

fn default_mount_root() -> String {
    "/media/cryptainer".to_string()
}

fn default_fs_type() -> String {
    "ext4".to_string()
}

fn default_mapper_prefix() -> String {
    "luks".to_string()
}

impl Default for StorageCfg {
    fn default() -> Self {
        Self {
            mount_root: default_mount_root(),
            registry_path: None,
            fs_type: default_fs_type(),
            mapper_prefix: default_mapper_prefix(),
        }
    }
}

/// Paths to host tooling plus the shared command timeout.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SystemCfg {
    #[serde(default)]
    pub losetup_path: Option<String>,

    #[serde(default)]
    pub cryptsetup_path: Option<String>,

    /// Override for the filesystem formatter; defaults to `mkfs.<fs_type>`.
    #[serde(default)]
    pub mkfs_path: Option<String>,

    #[serde(default)]
    pub mount_path: Option<String>,

    #[serde(default)]
    pub umount_path: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for SystemCfg {
    fn default() -> Self {
        Self {
            losetup_path: None,
            cryptsetup_path: None,
            mkfs_path: None,
            mount_path: None,
            umount_path: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

/// Top-level configuration snapshot loaded from disk.
///
/// Ambient process state (invoking user, config origin) is captured once at
/// load time into the skipped fields so lifecycle code never re-reads the
/// environment mid-operation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CryptainerConfig {
    #[serde(default)]
    pub storage: StorageCfg,

    #[serde(default)]
    pub system: SystemCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,

    #[serde(skip)]
    pub owner: Ownership,
}

impl Default for CryptainerConfig {
    fn default() -> Self {
        Self {
            storage: StorageCfg::default(),
            system: SystemCfg::default(),
            path: PathBuf::from(DEFAULT_CONFIG_PATH),
            format: ConfigFormat::Toml,
            owner: Ownership::invoking_user(),
        }
    }
}

impl CryptainerConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Resolve the per-user configuration path used for bootstrapping.
    pub fn user_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(BOOTSTRAP_FILE_NAME))
    }

    /// Load configuration from disk, creating a bootstrap copy when missing.
    ///
    /// If the caller requested the global default and the process lacks
    /// permission to create it, a per-user configuration is written to the
    /// platform config directory instead.
    pub fn load_or_bootstrap<P: AsRef<Path>>(path: P) -> CryptainerResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        match ensure_bootstrap_file(target) {
            Ok(created) => {
                if created {
                    info!("cryptainer config bootstrap created at {}", target.display());
                }
                Self::load(target)
            }
            Err(err) => {
                if target != Self::default_path() {
                    return Err(CryptainerError::InvalidConfig(format!(
                        "failed to initialise configuration at {}: {err}",
                        target.display()
                    )));
                }

                let user_path = Self::user_config_path().ok_or_else(|| {
                    CryptainerError::InvalidConfig(
                        "unable to determine user configuration directory; \
                        create /etc/cryptainer.toml manually"
                            .to_string(),
                    )
                })?;

                let created_user = ensure_bootstrap_file(&user_path).map_err(|io_err| {
                    CryptainerError::InvalidConfig(format!(
                        "failed to prepare bootstrap configuration at {}: {io_err}",
                        user_path.display()
                    ))
                })?;

                if created_user {
                    info!(
                        "cryptainer config bootstrap created at {}",
                        user_path.display()
                    );
                }

                warn!(
                    "configuration missing at {}; using per-user bootstrap at {}",
                    target.display(),
                    user_path.display()
                );

                Self::load(&user_path)
            }
        }
    }

    /// Read a config file from disk, detect format, and validate basics.
    pub fn load<P: AsRef<Path>>(path: P) -> CryptainerResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)
                .map_err(|err| CryptainerError::InvalidConfig(err.to_string()))?
        } else {
            serde_yaml::from_str::<Self>(&contents)
                .map_err(|err| CryptainerError::InvalidConfig(err.to_string()))?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };
        cfg.owner = Ownership::invoking_user();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the lifecycle manager cannot safely act on.
    pub fn validate(&self) -> CryptainerResult<()> {
        if self.storage.mount_root.trim().is_empty() {
            return Err(CryptainerError::InvalidConfig(
                "storage.mount_root must not be empty".to_string(),
            ));
        }
        if self.storage.mount_root.contains(FIELD_DELIMITER) {
            return Err(CryptainerError::InvalidConfig(format!(
                "storage.mount_root must not contain `{FIELD_DELIMITER}`"
            )));
        }
        if !looks_like_mapper_name(&self.storage.mapper_prefix) {
            return Err(CryptainerError::InvalidConfig(format!(
                "storage.mapper_prefix `{}` is not a valid mapper name fragment",
                self.storage.mapper_prefix
            )));
        }
        let fs_type = self.storage.fs_type.trim();
        if fs_type.is_empty()
            || !fs_type
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '.')
        {
            return Err(CryptainerError::InvalidConfig(format!(
                "storage.fs_type `{}` is not a valid filesystem type",
                self.storage.fs_type
            )));
        }
        Ok(())
    }

    /// Root directory under which container mountpoints live.
    pub fn mount_root(&self) -> &Path {
        Path::new(&self.storage.mount_root)
    }

    /// Resolve the registry path, preferring explicit config over the
    /// per-user data directory.
    pub fn registry_path(&self) -> PathBuf {
        if let Some(path) = self
            .storage
            .registry_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
        {
            return PathBuf::from(path);
        }

        project_dirs()
            .map(|dirs| dirs.data_dir().join(REGISTRY_FILE_NAME))
            .unwrap_or_else(|| PathBuf::from("/etc/cryptainer/registry"))
    }

    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.system.timeout_secs.max(1))
    }
}

/// Render the commented bootstrap template written on first run.
pub fn bootstrap_template() -> String {
    format!(
        "# Auto-generated cryptainer configuration bootstrap.\n\
         # Customize these values before managing production containers.\n\
         \n\
         [storage]\n\
         # Directory under which decrypted containers are mounted.\n\
         mount_root = \"{mount_root}\"\n\
         # Registry file location; leave unset to use the per-user data directory.\n\
         # registry_path = \"/var/lib/cryptainer/registry\"\n\
         fs_type = \"{fs_type}\"\n\
         mapper_prefix = \"{mapper_prefix}\"\n\
         \n\
         [system]\n\
         # Binary overrides; leave unset to probe well-known paths and PATH.\n\
         # losetup_path = \"/usr/sbin/losetup\"\n\
         # cryptsetup_path = \"/usr/sbin/cryptsetup\"\n\
         # mkfs_path = \"/usr/sbin/mkfs.ext4\"\n\
         # mount_path = \"/usr/bin/mount\"\n\
         # umount_path = \"/usr/bin/umount\"\n\
         timeout_secs = 30\n",
        mount_root = default_mount_root(),
        fs_type = default_fs_type(),
        mapper_prefix = default_mapper_prefix(),
    )
}

fn ensure_bootstrap_file(path: &Path) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => return Err(err),
    };
    file.write_all(bootstrap_template().as_bytes())?;

    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bootstrap_template_parses_back() {
        let cfg: CryptainerConfig = toml::from_str(&bootstrap_template()).unwrap();
        assert_eq!(cfg.storage.mount_root, default_mount_root());
        assert_eq!(cfg.storage.mapper_prefix, "luks");
        assert_eq!(cfg.system.timeout_secs, 30);
    }

    #[test]
    fn load_detects_toml_and_validates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cryptainer.toml");
        fs::write(
            &path,
            "[storage]\nmount_root = \"/mnt/vaults\"\nfs_type = \"ext4\"\n",
        )
        .unwrap();

        let cfg = CryptainerConfig::load(&path).unwrap();
        assert_eq!(cfg.storage.mount_root, "/mnt/vaults");
        assert!(matches!(cfg.format, ConfigFormat::Toml));
        assert_eq!(cfg.path, path);
    }

    #[test]
    fn load_rejects_delimiter_in_mount_root() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cryptainer.toml");
        fs::write(&path, "[storage]\nmount_root = \"/mnt/bad|path\"\n").unwrap();

        let err = CryptainerConfig::load(&path).unwrap_err();
        assert!(matches!(err, CryptainerError::InvalidConfig(_)));
    }

    #[test]
    fn registry_path_prefers_explicit_setting() {
        let mut cfg = CryptainerConfig::default();
        cfg.storage.registry_path = Some("/var/lib/cryptainer/registry".into());
        assert_eq!(
            cfg.registry_path(),
            PathBuf::from("/var/lib/cryptainer/registry")
        );
    }

    #[test]
    fn mapper_name_validation() {
        assert!(looks_like_mapper_name("luks_data_1"));
        assert!(looks_like_mapper_name("vault-2.img"));
        assert!(!looks_like_mapper_name(""));
        assert!(!looks_like_mapper_name("-leading"));
        assert!(!looks_like_mapper_name("has|pipe"));
        assert!(!looks_like_mapper_name("has space"));
    }
}
