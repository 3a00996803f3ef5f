//! Container lifecycle orchestration.
//!
//! One manager instance executes one operation at a time to completion
//! (single-operator model). Kernel state is re-validated before every
//! decision because other tools may mutate loop devices and mappings while
//! we are not looking; the registry is bookkeeping, not ground truth.

use crate::allocator::{ensure_loop_attached, next_free_mapper_name};
use crate::config::CryptainerConfig;
use crate::container::Container;
use crate::error::{CryptainerError, CryptainerResult};
use crate::guard::{FileGuard, LoopGuard, MappingGuard, MountGuard};
use crate::ownership::Ownership;
use crate::registry::{Registry, RegistryStore};
use crate::report::{event, EventObserver, OperationEvent, OperationLevel, OperationReport};
use crate::resources::{BlockCrypto, FilesystemFormatter, LoopDevices, MappingState, MountTable};
use log::warn;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

#[cfg(test)]
mod tests;

/// Parameters for creating a new container.
pub struct CreateRequest {
    pub backing_path: PathBuf,
    pub size_bytes: u64,
    /// Basename hint for the mapper name; defaults to the backing file's
    /// stem.
    pub mapper_hint: Option<String>,
    pub passphrase: Zeroizing<Vec<u8>>,
    pub passphrase_confirm: Zeroizing<Vec<u8>>,
    /// Destroys the prior content of an existing backing file.
    pub overwrite: bool,
}

/// Both confirmations the deletion controller demands. The restated path
/// guards against destroying the wrong entry after a slip in a list UI.
#[derive(Debug, Clone)]
pub struct DeletionConfirmation {
    pub acknowledged_irreversible: bool,
    pub confirmed_path: PathBuf,
}

/// Result of a mount call.
#[derive(Debug)]
pub struct MountOutcome {
    pub report: OperationReport,
    pub already_mounted: bool,
}

/// Live view of one registry entry.
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub index: usize,
    pub container: Container,
    pub attached: bool,
    pub unlocked: bool,
    pub mounted: bool,
    pub backing_missing: bool,
}

/// The mapper node the encryption subsystem exposes for an open mapping.
pub fn mapper_device_path(name: &str) -> String {
    format!("/dev/mapper/{name}")
}

/// Orchestrates the container lifecycle against the four OS collaborators.
pub struct ContainerManager<L, C, F, M> {
    config: Arc<CryptainerConfig>,
    store: RegistryStore,
    loops: L,
    crypto: C,
    mkfs: F,
    mounts: M,
}

impl<L, C, F, M> ContainerManager<L, C, F, M>
where
    L: LoopDevices<Error = CryptainerError>,
    C: BlockCrypto<Error = CryptainerError>,
    F: FilesystemFormatter<Error = CryptainerError>,
    M: MountTable<Error = CryptainerError>,
{
    pub fn new(config: Arc<CryptainerConfig>, loops: L, crypto: C, mkfs: F, mounts: M) -> Self {
        let store = RegistryStore::from_config(&config);
        Self {
            config,
            store,
            loops,
            crypto,
            mkfs,
            mounts,
        }
    }

    pub fn config(&self) -> &CryptainerConfig {
        &self.config
    }

    pub fn registry(&self) -> CryptainerResult<Registry> {
        self.store.load()
    }

    /// Create a container, reporting progress through `observer` as each
    /// step completes. On any failure every resource acquired by this call
    /// is rolled back before the error returns; the registry is only
    /// touched once the container is fully created and mounted.
    pub fn create_observed(
        &self,
        req: CreateRequest,
        observer: &mut EventObserver<'_>,
    ) -> CryptainerResult<OperationReport> {
        if req.passphrase.is_empty() {
            return Err(CryptainerError::InvalidConfig(
                "passphrase must not be empty".to_string(),
            ));
        }
        if *req.passphrase != *req.passphrase_confirm {
            return Err(CryptainerError::PassphraseMismatch);
        }
        if req.size_bytes == 0 {
            return Err(CryptainerError::InvalidConfig(
                "container size must be positive".to_string(),
            ));
        }

        let backing = req.backing_path.clone();
        let mount_point = Container::derive_mount_point(self.config.mount_root(), &backing);

        let registry = self.store.load()?;
        if registry.find_by_backing_path(&backing).is_some() {
            return Err(CryptainerError::InvalidConfig(format!(
                "container {} is already registered",
                backing.display()
            )));
        }
        if backing.exists() && !req.overwrite {
            return Err(CryptainerError::InvalidConfig(format!(
                "backing file {} already exists; confirm overwrite to destroy its contents",
                backing.display()
            )));
        }

        let hint = req
            .mapper_hint
            .as_deref()
            .map(str::to_string)
            .unwrap_or_else(|| {
                backing
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
        let reserved: HashSet<String> = registry
            .entries
            .iter()
            .map(|entry| entry.mapper_name.clone())
            .collect();
        let mapper_name = next_free_mapper_name(
            &self.crypto,
            &self.config.storage.mapper_prefix,
            &hint,
            &reserved,
        )?;

        // Pre-flight against concurrent external mutation: the name was
        // probed free a moment ago, but the kernel has the last word.
        if matches!(self.crypto.status(&mapper_name)?, MappingState::Active) {
            return Err(CryptainerError::NameInUse(mapper_name));
        }

        let container = Container {
            backing_path: backing.clone(),
            device_handle: None,
            mapper_name: mapper_name.clone(),
            mount_point: mount_point.clone(),
        };
        container.check_encodable()?;

        let mut events = Vec::new();
        let mut emit = |ev: OperationEvent, observer: &mut dyn FnMut(&OperationEvent)| {
            observer(&ev);
            events.push(ev);
        };

        emit(
            event(
                OperationLevel::Info,
                format!("allocated mapper name {mapper_name}"),
            ),
            observer,
        );

        allocate_backing_file(&backing, req.size_bytes, req.overwrite)?;
        apply_ownership(&self.config.owner, &backing);
        let file_guard = FileGuard::new(&backing);
        emit(
            event(
                OperationLevel::Info,
                format!(
                    "allocated backing file {} ({} bytes)",
                    backing.display(),
                    req.size_bytes
                ),
            ),
            observer,
        );

        let (device, newly_attached) = ensure_loop_attached(&self.loops, &backing)?;
        let loop_guard = if newly_attached {
            LoopGuard::new(&self.loops, device.clone())
        } else {
            LoopGuard::pre_existing(&self.loops, device.clone())
        };
        emit(
            event(
                OperationLevel::Info,
                format!("attached {} to {device}", backing.display()),
            ),
            observer,
        );

        self.crypto.format(&device, &req.passphrase)?;
        emit(
            event(
                OperationLevel::Info,
                format!("initialised block encryption on {device}"),
            ),
            observer,
        );

        self.crypto.open(&device, &mapper_name, &req.passphrase)?;
        let mapping_guard = MappingGuard::new(&self.crypto, mapper_name.clone());
        emit(
            event(
                OperationLevel::Info,
                format!("opened encrypted mapping {mapper_name}"),
            ),
            observer,
        );

        let mapper_device = mapper_device_path(&mapper_name);
        emit(
            event(
                OperationLevel::Info,
                format!(
                    "creating {} filesystem on {mapper_device} (this can take a while)",
                    self.config.storage.fs_type
                ),
            ),
            observer,
        );
        self.mkfs
            .format(&mapper_device, &self.config.storage.fs_type)?;

        fs::create_dir_all(&mount_point)?;
        self.mounts.mount(&mapper_device, &mount_point)?;
        let mount_guard = MountGuard::new(&self.mounts, &mount_point);
        apply_ownership(&self.config.owner, &mount_point);
        emit(
            event(
                OperationLevel::Info,
                format!("mounted {mapper_device} at {}", mount_point.display()),
            ),
            observer,
        );

        let registered = Container {
            device_handle: Some(device),
            ..container
        };
        self.store.append(registered)?;

        mount_guard.disarm();
        mapping_guard.disarm();
        loop_guard.disarm();
        file_guard.disarm();

        emit(
            event(
                OperationLevel::Success,
                format!(
                    "container {} created and mounted at {}",
                    backing.display(),
                    mount_point.display()
                ),
            ),
            observer,
        );

        Ok(OperationReport {
            title: format!("Created container {}", backing.display()),
            events,
        })
    }

    /// Create a container without live progress reporting.
    pub fn create(&self, req: CreateRequest) -> CryptainerResult<OperationReport> {
        self.create_observed(req, &mut |_| {})
    }

    /// Mount a registered container. The passphrase is supplied fresh on
    /// every call and never stored. A stale loop-device handle is healed by
    /// re-attaching, and the registry record is refreshed once the mount
    /// has fully succeeded.
    pub fn mount(&self, index: usize, passphrase: &[u8]) -> CryptainerResult<MountOutcome> {
        let registry = self.store.load()?;
        let container = registry.get(index)?.clone();
        let mut events = Vec::new();

        if self.mounts.is_mounted(&container.mount_point)? {
            events.push(event(
                OperationLevel::Info,
                format!(
                    "container {} is already mounted at {}",
                    container.backing_path.display(),
                    container.mount_point.display()
                ),
            ));
            return Ok(MountOutcome {
                report: OperationReport {
                    title: format!("Mounted container {}", container.backing_path.display()),
                    events,
                },
                already_mounted: true,
            });
        }

        if !container.backing_path.exists() {
            return Err(CryptainerError::BackingFileMissing(container.backing_path));
        }

        let (device, newly_attached) = ensure_loop_attached(&self.loops, &container.backing_path)?;
        let loop_guard = if newly_attached {
            LoopGuard::new(&self.loops, device.clone())
        } else {
            LoopGuard::pre_existing(&self.loops, device.clone())
        };
        match &container.device_handle {
            Some(stored) if *stored == device => {}
            Some(stored) => events.push(event(
                OperationLevel::Info,
                format!("loop device changed since last session ({stored} -> {device})"),
            )),
            None => events.push(event(
                OperationLevel::Info,
                format!("attached {} to {device}", container.backing_path.display()),
            )),
        }

        let mapping_guard = match self.crypto.status(&container.mapper_name)? {
            MappingState::Active => {
                events.push(event(
                    OperationLevel::Info,
                    format!(
                        "encrypted mapping {} is already open; reusing it",
                        container.mapper_name
                    ),
                ));
                MappingGuard::pre_existing(&self.crypto, container.mapper_name.clone())
            }
            MappingState::Inactive => {
                // AuthenticationFailed propagates here; the loop guard
                // detaches the device only if this call attached it.
                self.crypto
                    .open(&device, &container.mapper_name, passphrase)?;
                events.push(event(
                    OperationLevel::Info,
                    format!("opened encrypted mapping {}", container.mapper_name),
                ));
                MappingGuard::new(&self.crypto, container.mapper_name.clone())
            }
            MappingState::Unknown(reason) => {
                return Err(CryptainerError::System(format!(
                    "cannot determine state of mapping {}: {reason}",
                    container.mapper_name
                )));
            }
        };

        fs::create_dir_all(&container.mount_point)?;
        let mapper_device = mapper_device_path(&container.mapper_name);
        self.mounts.mount(&mapper_device, &container.mount_point)?;
        let mount_guard = MountGuard::new(&self.mounts, &container.mount_point);
        apply_ownership(&self.config.owner, &container.mount_point);
        events.push(event(
            OperationLevel::Success,
            format!(
                "mounted {mapper_device} at {}",
                container.mount_point.display()
            ),
        ));

        let refreshed = Container {
            device_handle: Some(device),
            ..container.clone()
        };
        self.store.replace(index, refreshed).map_err(|err| {
            CryptainerError::System(format!(
                "registry record for {} could not be refreshed after mounting: {err}; \
                 the mount has been rolled back",
                container.backing_path.display()
            ))
        })?;

        mount_guard.disarm();
        mapping_guard.disarm();
        loop_guard.disarm();

        Ok(MountOutcome {
            report: OperationReport {
                title: format!("Mounted container {}", container.backing_path.display()),
                events,
            },
            already_mounted: false,
        })
    }

    /// Unmount a container and release its kernel resources. Each stage is
    /// gated on the previous one succeeding, and every stage is a no-op
    /// when its resource is already released, so retrying after a
    /// `ResourceBusy` failure (or after a full unmount) is safe.
    pub fn unmount(&self, index: usize) -> CryptainerResult<OperationReport> {
        let registry = self.store.load()?;
        let container = registry.get(index)?.clone();
        let mut events = Vec::new();

        if self.mounts.is_mounted(&container.mount_point)? {
            self.mounts.unmount(&container.mount_point)?;
            events.push(event(
                OperationLevel::Info,
                format!("unmounted {}", container.mount_point.display()),
            ));
        } else {
            events.push(event(
                OperationLevel::Info,
                format!(
                    "{} is not mounted; nothing to unmount",
                    container.mount_point.display()
                ),
            ));
        }

        if matches!(
            self.crypto.status(&container.mapper_name)?,
            MappingState::Active
        ) {
            self.crypto.close(&container.mapper_name)?;
            events.push(event(
                OperationLevel::Info,
                format!("closed encrypted mapping {}", container.mapper_name),
            ));
        }

        if let Some(binding) = self.find_loop_binding(&container.backing_path)? {
            self.loops.detach(&binding)?;
            events.push(event(
                OperationLevel::Info,
                format!("detached loop device {binding}"),
            ));
        }

        events.push(event(
            OperationLevel::Success,
            format!("container {} is closed", container.backing_path.display()),
        ));

        Ok(OperationReport {
            title: format!("Unmounted container {}", container.backing_path.display()),
            events,
        })
    }

    /// Destroy a container: best-effort release of kernel resources, then
    /// deletion of the backing file and the registry record. Cleanup
    /// failures never abort the deletion; they are reported as a
    /// `PartialFailure` after the container is gone.
    pub fn delete(
        &self,
        index: usize,
        confirmation: DeletionConfirmation,
    ) -> CryptainerResult<OperationReport> {
        let registry = self.store.load()?;
        let container = registry.get(index)?.clone();

        if !confirmation.acknowledged_irreversible {
            return Err(CryptainerError::InvalidConfig(
                "deletion requires acknowledging that it is irreversible".to_string(),
            ));
        }
        if confirmation.confirmed_path != container.backing_path {
            return Err(CryptainerError::InvalidConfig(format!(
                "deletion confirmation names {} but the selected container is {}",
                confirmation.confirmed_path.display(),
                container.backing_path.display()
            )));
        }

        let mut events = Vec::new();
        let mut failures: Vec<String> = Vec::new();

        match self.mounts.is_mounted(&container.mount_point) {
            Ok(true) => match self.mounts.unmount(&container.mount_point) {
                Ok(()) => events.push(event(
                    OperationLevel::Info,
                    format!("unmounted {}", container.mount_point.display()),
                )),
                Err(err) => record_cleanup_failure(
                    &mut events,
                    &mut failures,
                    format!(
                        "unmount of {} failed: {err}",
                        container.mount_point.display()
                    ),
                ),
            },
            Ok(false) => {}
            Err(err) => record_cleanup_failure(
                &mut events,
                &mut failures,
                format!(
                    "mount check for {} failed: {err}",
                    container.mount_point.display()
                ),
            ),
        }

        match self.crypto.close(&container.mapper_name) {
            Ok(()) => events.push(event(
                OperationLevel::Info,
                format!("closed encrypted mapping {}", container.mapper_name),
            )),
            Err(err) => record_cleanup_failure(
                &mut events,
                &mut failures,
                format!(
                    "close of mapping {} failed: {err}",
                    container.mapper_name
                ),
            ),
        }

        match self.find_loop_binding(&container.backing_path) {
            Ok(Some(binding)) => match self.loops.detach(&binding) {
                Ok(()) => events.push(event(
                    OperationLevel::Info,
                    format!("detached loop device {binding}"),
                )),
                Err(err) => record_cleanup_failure(
                    &mut events,
                    &mut failures,
                    format!("detach of {binding} failed: {err}"),
                ),
            },
            Ok(None) => {}
            Err(err) => record_cleanup_failure(
                &mut events,
                &mut failures,
                format!("loop device listing failed: {err}"),
            ),
        }

        match fs::remove_file(&container.backing_path) {
            Ok(()) => events.push(event(
                OperationLevel::Info,
                format!("deleted backing file {}", container.backing_path.display()),
            )),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => events.push(event(
                OperationLevel::Warn,
                format!(
                    "backing file {} was already gone",
                    container.backing_path.display()
                ),
            )),
            Err(err) => {
                return Err(CryptainerError::System(format!(
                    "failed to delete backing file {}: {err}",
                    container.backing_path.display()
                )));
            }
        }

        self.store.remove(index)?;
        events.push(event(
            OperationLevel::Success,
            format!(
                "container {} removed from the registry",
                container.backing_path.display()
            ),
        ));

        // The mountpoint directory is only removed when empty; leftovers
        // mean something still lives there and must survive.
        let _ = fs::remove_dir(&container.mount_point);

        if failures.is_empty() {
            Ok(OperationReport {
                title: format!("Deleted container {}", container.backing_path.display()),
                events,
            })
        } else {
            Err(CryptainerError::PartialFailure(failures.join("; ")))
        }
    }

    /// Live status for every registry entry.
    pub fn list(&self) -> CryptainerResult<Vec<ContainerStatus>> {
        let registry = self.store.load()?;
        let bindings = self.loops.list_active()?;

        let mut statuses = Vec::with_capacity(registry.len());
        for (index, container) in registry.entries.iter().enumerate() {
            let canonical = canonicalize_lossy(&container.backing_path);
            let attached = bindings
                .iter()
                .any(|binding| canonicalize_lossy(&binding.backing_file) == canonical);
            let unlocked = matches!(
                self.crypto.status(&container.mapper_name)?,
                MappingState::Active
            );
            let mounted = self.mounts.is_mounted(&container.mount_point)?;
            statuses.push(ContainerStatus {
                index,
                container: container.clone(),
                attached,
                unlocked,
                mounted,
                backing_missing: !container.backing_path.exists(),
            });
        }
        Ok(statuses)
    }

    /// Live status for a single registry entry.
    pub fn status(&self, index: usize) -> CryptainerResult<ContainerStatus> {
        self.list()?
            .into_iter()
            .nth(index)
            .ok_or_else(|| {
                CryptainerError::InvalidConfig(format!("no container at registry index {index}"))
            })
    }

    fn find_loop_binding(&self, backing: &Path) -> CryptainerResult<Option<String>> {
        let canonical = canonicalize_lossy(backing);
        Ok(self
            .loops
            .list_active()?
            .into_iter()
            .find(|binding| canonicalize_lossy(&binding.backing_file) == canonical)
            .map(|binding| binding.device))
    }
}

/// Allocate the backing file sparsely at the requested size.
fn allocate_backing_file(path: &Path, size: u64, overwrite: bool) -> CryptainerResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| CryptainerError::AllocationFailed {
            path: path.to_path_buf(),
            reason: format!("cannot create parent directory: {err}"),
        })?;
    }

    let mut options = OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }

    let file = options
        .open(path)
        .map_err(|err| CryptainerError::AllocationFailed {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    file.set_len(size)
        .map_err(|err| CryptainerError::AllocationFailed {
            path: path.to_path_buf(),
            reason: format!("cannot extend to {size} bytes: {err}"),
        })
}

/// A cleanup step that failed during deletion: surfaced in the report as an
/// error event and collected for the final `PartialFailure`.
fn record_cleanup_failure(
    events: &mut Vec<OperationEvent>,
    failures: &mut Vec<String>,
    message: String,
) {
    warn!("{message}");
    events.push(event(OperationLevel::Error, message.clone()));
    failures.push(message);
}

/// A non-elevated run cannot chown to another user; the failure is logged,
/// not fatal.
fn apply_ownership(owner: &Ownership, path: &Path) {
    if let Err(err) = owner.apply(path) {
        warn!("could not set ownership of {}: {err}", path.display());
    }
}

fn canonicalize_lossy(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
