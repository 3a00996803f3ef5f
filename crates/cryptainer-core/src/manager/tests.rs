use super::*;
use crate::config::{CryptainerConfig, StorageCfg};
use crate::error::CryptainerError;
use crate::resources::{BlockCrypto, FilesystemFormatter, LoopBinding, LoopDevices, MountTable};
use crate::units::parse_size;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailPoint {
    Attach,
    Format,
    Open,
    Mkfs,
    Mount,
}

/// Simulated kernel: loop bindings, encryption headers (keyed by backing
/// file, as on real hardware), open mappings, filesystems, mount table.
#[derive(Default)]
struct KernelState {
    loops: HashMap<String, PathBuf>,
    next_loop: u32,
    loop_capacity: Option<usize>,
    headers: HashMap<PathBuf, Vec<u8>>,
    mappings: HashMap<String, String>,
    filesystems: HashSet<String>,
    mounted: HashMap<PathBuf, String>,
    busy: HashSet<PathBuf>,
    fail_next: Option<FailPoint>,
}

type Kernel = Arc<Mutex<KernelState>>;

fn take_failure(state: &mut KernelState, point: FailPoint) -> bool {
    if state.fail_next == Some(point) {
        state.fail_next = None;
        true
    } else {
        false
    }
}

#[derive(Clone)]
struct FakeLoops(Kernel);

impl LoopDevices for FakeLoops {
    type Error = CryptainerError;

    fn attach(&self, backing: &Path) -> Result<String, Self::Error> {
        let mut state = self.0.lock().unwrap();
        if take_failure(&mut state, FailPoint::Attach) {
            return Err(CryptainerError::System("injected attach failure".into()));
        }
        if let Some(capacity) = state.loop_capacity {
            if state.loops.len() >= capacity {
                return Err(CryptainerError::ResourceExhausted(
                    "all loop devices are in use".into(),
                ));
            }
        }
        let device = format!("/dev/loop{}", state.next_loop);
        state.next_loop += 1;
        state.loops.insert(device.clone(), backing.to_path_buf());
        Ok(device)
    }

    fn detach(&self, device: &str) -> Result<(), Self::Error> {
        let mut state = self.0.lock().unwrap();
        state.loops.remove(device);
        Ok(())
    }

    fn list_active(&self) -> Result<Vec<LoopBinding>, Self::Error> {
        let state = self.0.lock().unwrap();
        Ok(state
            .loops
            .iter()
            .map(|(device, backing)| LoopBinding {
                device: device.clone(),
                backing_file: backing.clone(),
            })
            .collect())
    }
}

#[derive(Clone)]
struct FakeCrypto(Kernel);

impl FakeCrypto {
    fn resolve_backing(state: &KernelState, device: &str) -> Result<PathBuf, CryptainerError> {
        state.loops.get(device).cloned().ok_or_else(|| {
            CryptainerError::System(format!("{device} is not an active loop device"))
        })
    }
}

impl BlockCrypto for FakeCrypto {
    type Error = CryptainerError;

    fn format(&self, device: &str, passphrase: &[u8]) -> Result<(), Self::Error> {
        let mut state = self.0.lock().unwrap();
        if take_failure(&mut state, FailPoint::Format) {
            return Err(CryptainerError::System("injected format failure".into()));
        }
        let backing = Self::resolve_backing(&state, device)?;
        state.headers.insert(backing, passphrase.to_vec());
        Ok(())
    }

    fn open(&self, device: &str, name: &str, passphrase: &[u8]) -> Result<(), Self::Error> {
        let mut state = self.0.lock().unwrap();
        if take_failure(&mut state, FailPoint::Open) {
            return Err(CryptainerError::System("injected open failure".into()));
        }
        let backing = Self::resolve_backing(&state, device)?;
        match state.headers.get(&backing) {
            Some(expected) if expected == passphrase => {
                state.mappings.insert(name.to_string(), device.to_string());
                Ok(())
            }
            Some(_) => Err(CryptainerError::AuthenticationFailed(name.to_string())),
            None => Err(CryptainerError::System(format!(
                "{device} holds no encryption header"
            ))),
        }
    }

    fn close(&self, name: &str) -> Result<(), Self::Error> {
        let mut state = self.0.lock().unwrap();
        state.mappings.remove(name);
        Ok(())
    }

    fn status(&self, name: &str) -> Result<MappingState, Self::Error> {
        let state = self.0.lock().unwrap();
        if state.mappings.contains_key(name) {
            Ok(MappingState::Active)
        } else {
            Ok(MappingState::Inactive)
        }
    }
}

#[derive(Clone)]
struct FakeMkfs(Kernel);

impl FilesystemFormatter for FakeMkfs {
    type Error = CryptainerError;

    fn format(&self, device: &str, _fs_type: &str) -> Result<(), Self::Error> {
        let mut state = self.0.lock().unwrap();
        if take_failure(&mut state, FailPoint::Mkfs) {
            return Err(CryptainerError::System("injected mkfs failure".into()));
        }
        let name = device
            .strip_prefix("/dev/mapper/")
            .unwrap_or_else(|| panic!("mkfs on unexpected device {device}"));
        assert!(
            state.mappings.contains_key(name),
            "mkfs ran before the mapping was opened"
        );
        state.filesystems.insert(device.to_string());
        Ok(())
    }
}

#[derive(Clone)]
struct FakeMounts(Kernel);

impl MountTable for FakeMounts {
    type Error = CryptainerError;

    fn mount(&self, device: &str, target: &Path) -> Result<(), Self::Error> {
        let mut state = self.0.lock().unwrap();
        if take_failure(&mut state, FailPoint::Mount) {
            return Err(CryptainerError::System("injected mount failure".into()));
        }
        assert!(
            state.filesystems.contains(device),
            "mount ran before a filesystem existed on {device}"
        );
        state.mounted.insert(target.to_path_buf(), device.to_string());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), Self::Error> {
        let mut state = self.0.lock().unwrap();
        if state.busy.contains(target) {
            return Err(CryptainerError::ResourceBusy(target.to_path_buf()));
        }
        state.mounted.remove(target);
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> Result<bool, Self::Error> {
        Ok(self.0.lock().unwrap().mounted.contains_key(target))
    }
}

type TestManager = ContainerManager<FakeLoops, FakeCrypto, FakeMkfs, FakeMounts>;

fn test_manager(dir: &Path) -> (TestManager, Kernel) {
    let kernel: Kernel = Arc::default();
    let config = CryptainerConfig {
        storage: StorageCfg {
            mount_root: dir.join("mnt").display().to_string(),
            registry_path: Some(dir.join("registry").display().to_string()),
            fs_type: "ext4".into(),
            mapper_prefix: "luks".into(),
        },
        ..CryptainerConfig::default()
    };
    let manager = ContainerManager::new(
        Arc::new(config),
        FakeLoops(kernel.clone()),
        FakeCrypto(kernel.clone()),
        FakeMkfs(kernel.clone()),
        FakeMounts(kernel.clone()),
    );
    (manager, kernel)
}

fn create_request(backing: &Path, size: &str, passphrase: &str) -> CreateRequest {
    CreateRequest {
        backing_path: backing.to_path_buf(),
        size_bytes: parse_size(size).unwrap(),
        mapper_hint: None,
        passphrase: Zeroizing::new(passphrase.as_bytes().to_vec()),
        passphrase_confirm: Zeroizing::new(passphrase.as_bytes().to_vec()),
        overwrite: false,
    }
}

fn assert_kernel_quiescent(kernel: &Kernel) {
    let state = kernel.lock().unwrap();
    assert!(state.loops.is_empty(), "loop devices leaked: {:?}", state.loops);
    assert!(state.mappings.is_empty(), "mappings leaked: {:?}", state.mappings);
    assert!(state.mounted.is_empty(), "mounts leaked: {:?}", state.mounted);
}

fn confirmation_for(backing: &Path) -> DeletionConfirmation {
    DeletionConfirmation {
        acknowledged_irreversible: true,
        confirmed_path: backing.to_path_buf(),
    }
}

#[test]
fn create_registers_fully_mounted_container() {
    let dir = tempdir().unwrap();
    let (manager, kernel) = test_manager(dir.path());
    let backing = dir.path().join("secure.img");

    let report = manager
        .create(create_request(&backing, "100M", "alpaca123"))
        .unwrap();
    assert!(report.title.contains("secure.img"));

    let registry = manager.registry().unwrap();
    assert_eq!(registry.len(), 1);
    let entry = &registry.entries[0];
    assert_eq!(entry.backing_path, backing);
    assert!(entry.mapper_name.starts_with("luks_secure_"));
    assert_eq!(entry.mount_point, dir.path().join("mnt").join("secure"));
    assert_eq!(entry.device_handle.as_deref(), Some("/dev/loop0"));

    let state = kernel.lock().unwrap();
    assert!(state.mounted.contains_key(&entry.mount_point));
    assert!(state.mappings.contains_key(&entry.mapper_name));
    drop(state);

    assert_eq!(
        std::fs::metadata(&backing).unwrap().len(),
        100 * 1024 * 1024
    );
}

#[test]
fn create_passphrase_mismatch_touches_nothing() {
    let dir = tempdir().unwrap();
    let (manager, kernel) = test_manager(dir.path());
    let backing = dir.path().join("secure.img");

    let mut req = create_request(&backing, "100M", "alpaca123");
    req.passphrase_confirm = Zeroizing::new(b"different".to_vec());

    let err = manager.create(req).unwrap_err();
    assert!(matches!(err, CryptainerError::PassphraseMismatch));
    assert!(!backing.exists());
    assert!(manager.registry().unwrap().is_empty());
    assert_kernel_quiescent(&kernel);
}

#[test]
fn create_failure_at_any_step_leaves_no_partial_state() {
    for point in [
        FailPoint::Attach,
        FailPoint::Format,
        FailPoint::Open,
        FailPoint::Mkfs,
        FailPoint::Mount,
    ] {
        let dir = tempdir().unwrap();
        let (manager, kernel) = test_manager(dir.path());
        let backing = dir.path().join("secure.img");

        kernel.lock().unwrap().fail_next = Some(point);
        let err = manager
            .create(create_request(&backing, "64M", "alpaca123"))
            .unwrap_err();
        assert!(
            matches!(err, CryptainerError::System(_)),
            "unexpected error at {point:?}: {err:?}"
        );

        assert!(
            manager.registry().unwrap().is_empty(),
            "partial registry entry after failure at {point:?}"
        );
        assert!(
            !backing.exists(),
            "backing file survived rollback after failure at {point:?}"
        );
        assert_kernel_quiescent(&kernel);
    }
}

#[test]
fn create_rejects_existing_backing_file_without_overwrite() {
    let dir = tempdir().unwrap();
    let (manager, _kernel) = test_manager(dir.path());
    let backing = dir.path().join("secure.img");
    std::fs::write(&backing, b"precious").unwrap();

    let err = manager
        .create(create_request(&backing, "64M", "alpaca123"))
        .unwrap_err();
    assert!(matches!(err, CryptainerError::InvalidConfig(_)));
    assert_eq!(std::fs::read(&backing).unwrap(), b"precious");

    let mut req = create_request(&backing, "64M", "alpaca123");
    req.overwrite = true;
    manager.create(req).unwrap();
    assert_eq!(manager.registry().unwrap().len(), 1);
}

#[test]
fn create_rejects_registered_backing_path() {
    let dir = tempdir().unwrap();
    let (manager, _kernel) = test_manager(dir.path());
    let backing = dir.path().join("secure.img");

    manager
        .create(create_request(&backing, "64M", "alpaca123"))
        .unwrap();
    let err = manager
        .create(create_request(&backing, "64M", "alpaca123"))
        .unwrap_err();
    assert!(matches!(err, CryptainerError::InvalidConfig(_)));
    assert_eq!(manager.registry().unwrap().len(), 1);
}

#[test]
fn create_rejects_delimiter_in_backing_path() {
    let dir = tempdir().unwrap();
    let (manager, kernel) = test_manager(dir.path());
    let backing = dir.path().join("bad|name.img");

    let err = manager
        .create(create_request(&backing, "64M", "alpaca123"))
        .unwrap_err();
    assert!(matches!(err, CryptainerError::InvalidConfig(_)));
    assert!(!backing.exists());
    assert_kernel_quiescent(&kernel);
}

#[test]
fn mapper_name_skips_active_collisions() {
    let dir = tempdir().unwrap();
    let (manager, kernel) = test_manager(dir.path());

    // A mapping created outside this tool occupies luks_data_1.
    kernel
        .lock()
        .unwrap()
        .mappings
        .insert("luks_data_1".into(), "/dev/external0".into());

    let backing = dir.path().join("data.img");
    manager
        .create(create_request(&backing, "64M", "alpaca123"))
        .unwrap();

    let registry = manager.registry().unwrap();
    assert_eq!(registry.entries[0].mapper_name, "luks_data_2");
}

#[test]
fn create_fails_with_resource_exhausted_when_no_loop_free() {
    let dir = tempdir().unwrap();
    let (manager, kernel) = test_manager(dir.path());
    kernel.lock().unwrap().loop_capacity = Some(0);
    let backing = dir.path().join("secure.img");

    let err = manager
        .create(create_request(&backing, "64M", "alpaca123"))
        .unwrap_err();
    assert!(matches!(err, CryptainerError::ResourceExhausted(_)));
    assert!(!backing.exists());
    assert!(manager.registry().unwrap().is_empty());
}

#[test]
fn mount_is_idempotent_when_already_mounted() {
    let dir = tempdir().unwrap();
    let (manager, kernel) = test_manager(dir.path());
    let backing = dir.path().join("secure.img");
    manager
        .create(create_request(&backing, "64M", "alpaca123"))
        .unwrap();

    let before = kernel.lock().unwrap().mounted.clone();
    let outcome = manager.mount(0, b"alpaca123").unwrap();
    assert!(outcome.already_mounted);
    assert_eq!(kernel.lock().unwrap().mounted, before);
}

#[test]
fn mount_fails_when_backing_file_is_gone() {
    let dir = tempdir().unwrap();
    let (manager, _kernel) = test_manager(dir.path());
    let backing = dir.path().join("secure.img");
    manager
        .create(create_request(&backing, "64M", "alpaca123"))
        .unwrap();
    manager.unmount(0).unwrap();
    std::fs::remove_file(&backing).unwrap();

    let err = manager.mount(0, b"alpaca123").unwrap_err();
    assert!(matches!(err, CryptainerError::BackingFileMissing(path) if path == backing));
}

#[test]
fn stale_loop_handle_is_healed_and_registry_refreshed() {
    let dir = tempdir().unwrap();
    let (manager, kernel) = test_manager(dir.path());
    let backing = dir.path().join("secure.img");
    manager
        .create(create_request(&backing, "64M", "alpaca123"))
        .unwrap();

    let stale = manager.registry().unwrap().entries[0]
        .device_handle
        .clone()
        .unwrap();
    manager.unmount(0).unwrap();
    assert_kernel_quiescent(&kernel);

    let outcome = manager.mount(0, b"alpaca123").unwrap();
    assert!(!outcome.already_mounted);

    let refreshed = manager.registry().unwrap().entries[0]
        .device_handle
        .clone()
        .unwrap();
    assert_ne!(refreshed, stale, "loop device should have been renumbered");
    assert!(kernel.lock().unwrap().loops.contains_key(&refreshed));
    assert!(
        outcome
            .report
            .events
            .iter()
            .any(|ev| ev.message.contains("mounted")),
        "expected a mount event in {:?}",
        outcome.report.events
    );
}

#[test]
fn wrong_passphrase_fails_and_detaches_newly_attached_loop() {
    let dir = tempdir().unwrap();
    let (manager, kernel) = test_manager(dir.path());
    let backing = dir.path().join("secure.img");
    manager
        .create(create_request(&backing, "64M", "alpaca123"))
        .unwrap();
    manager.unmount(0).unwrap();

    let err = manager.mount(0, b"not-the-passphrase").unwrap_err();
    assert!(matches!(err, CryptainerError::AuthenticationFailed(_)));
    assert_kernel_quiescent(&kernel);

    // The right passphrase still works afterwards.
    manager.mount(0, b"alpaca123").unwrap();
}

#[test]
fn wrong_passphrase_keeps_preexisting_loop_attached() {
    let dir = tempdir().unwrap();
    let (manager, kernel) = test_manager(dir.path());
    let backing = dir.path().join("secure.img");
    manager
        .create(create_request(&backing, "64M", "alpaca123"))
        .unwrap();
    manager.unmount(0).unwrap();

    // Someone attached the file out-of-band before our mount attempt.
    let device = FakeLoops(kernel.clone()).attach(&backing).unwrap();

    let err = manager.mount(0, b"not-the-passphrase").unwrap_err();
    assert!(matches!(err, CryptainerError::AuthenticationFailed(_)));
    assert!(
        kernel.lock().unwrap().loops.contains_key(&device),
        "pre-existing loop binding must survive a failed mount"
    );
}

#[test]
fn unmount_twice_is_noop_success() {
    let dir = tempdir().unwrap();
    let (manager, kernel) = test_manager(dir.path());
    let backing = dir.path().join("secure.img");
    manager
        .create(create_request(&backing, "64M", "alpaca123"))
        .unwrap();

    manager.unmount(0).unwrap();
    assert_kernel_quiescent(&kernel);
    let registry_before = std::fs::read_to_string(dir.path().join("registry")).unwrap();

    manager.unmount(0).unwrap();
    assert_kernel_quiescent(&kernel);
    let registry_after = std::fs::read_to_string(dir.path().join("registry")).unwrap();
    assert_eq!(registry_before, registry_after);
}

#[test]
fn unmount_busy_filesystem_preserves_all_resources() {
    let dir = tempdir().unwrap();
    let (manager, kernel) = test_manager(dir.path());
    let backing = dir.path().join("secure.img");
    manager
        .create(create_request(&backing, "64M", "alpaca123"))
        .unwrap();

    let mount_point = manager.registry().unwrap().entries[0].mount_point.clone();
    kernel.lock().unwrap().busy.insert(mount_point.clone());

    let err = manager.unmount(0).unwrap_err();
    assert!(matches!(err, CryptainerError::ResourceBusy(path) if path == mount_point));

    let state = kernel.lock().unwrap();
    assert_eq!(state.mounted.len(), 1);
    assert_eq!(state.mappings.len(), 1);
    assert_eq!(state.loops.len(), 1);
    drop(state);
    assert_eq!(manager.registry().unwrap().len(), 1);
}

#[test]
fn delete_requires_both_confirmations() {
    let dir = tempdir().unwrap();
    let (manager, _kernel) = test_manager(dir.path());
    let backing = dir.path().join("secure.img");
    manager
        .create(create_request(&backing, "64M", "alpaca123"))
        .unwrap();

    let err = manager
        .delete(
            0,
            DeletionConfirmation {
                acknowledged_irreversible: false,
                confirmed_path: backing.clone(),
            },
        )
        .unwrap_err();
    assert!(matches!(err, CryptainerError::InvalidConfig(_)));

    let err = manager
        .delete(
            0,
            DeletionConfirmation {
                acknowledged_irreversible: true,
                confirmed_path: dir.path().join("other.img"),
            },
        )
        .unwrap_err();
    assert!(matches!(err, CryptainerError::InvalidConfig(_)));

    assert_eq!(manager.registry().unwrap().len(), 1);
    assert!(backing.exists());
}

#[test]
fn delete_releases_everything_and_empties_registry() {
    let dir = tempdir().unwrap();
    let (manager, kernel) = test_manager(dir.path());
    let backing = dir.path().join("secure.img");
    manager
        .create(create_request(&backing, "100M", "alpaca123"))
        .unwrap();

    manager.unmount(0).unwrap();
    manager.delete(0, confirmation_for(&backing)).unwrap();

    assert!(manager.registry().unwrap().is_empty());
    assert!(!backing.exists());
    assert_kernel_quiescent(&kernel);
}

#[test]
fn delete_of_mounted_container_cleans_up_kernel_state() {
    let dir = tempdir().unwrap();
    let (manager, kernel) = test_manager(dir.path());
    let backing = dir.path().join("secure.img");
    manager
        .create(create_request(&backing, "64M", "alpaca123"))
        .unwrap();

    manager.delete(0, confirmation_for(&backing)).unwrap();
    assert!(manager.registry().unwrap().is_empty());
    assert!(!backing.exists());
    assert_kernel_quiescent(&kernel);
}

#[test]
fn delete_reports_partial_failure_but_still_deletes() {
    let dir = tempdir().unwrap();
    let (manager, kernel) = test_manager(dir.path());
    let backing = dir.path().join("secure.img");
    manager
        .create(create_request(&backing, "64M", "alpaca123"))
        .unwrap();

    let mount_point = manager.registry().unwrap().entries[0].mount_point.clone();
    kernel.lock().unwrap().busy.insert(mount_point);

    let err = manager.delete(0, confirmation_for(&backing)).unwrap_err();
    assert!(matches!(err, CryptainerError::PartialFailure(_)));

    // Deletion proceeded regardless of the stuck unmount.
    assert!(manager.registry().unwrap().is_empty());
    assert!(!backing.exists());
}

#[test]
fn list_reports_live_state_per_container() {
    let dir = tempdir().unwrap();
    let (manager, _kernel) = test_manager(dir.path());
    let first = dir.path().join("alpha.img");
    let second = dir.path().join("beta.img");
    manager
        .create(create_request(&first, "64M", "alpaca123"))
        .unwrap();
    manager
        .create(create_request(&second, "64M", "alpaca123"))
        .unwrap();
    manager.unmount(1).unwrap();

    let statuses = manager.list().unwrap();
    assert_eq!(statuses.len(), 2);

    assert!(statuses[0].attached && statuses[0].unlocked && statuses[0].mounted);
    assert!(!statuses[1].attached && !statuses[1].unlocked && !statuses[1].mounted);
    assert!(!statuses[0].backing_missing);

    std::fs::remove_file(&second).unwrap();
    let statuses = manager.list().unwrap();
    assert!(statuses[1].backing_missing);
}

#[test]
fn create_reports_progress_through_observer() {
    let dir = tempdir().unwrap();
    let (manager, _kernel) = test_manager(dir.path());
    let backing = dir.path().join("secure.img");

    let mut seen = Vec::new();
    manager
        .create_observed(create_request(&backing, "64M", "alpaca123"), &mut |ev| {
            seen.push(ev.message.clone())
        })
        .unwrap();

    assert!(seen.iter().any(|msg| msg.contains("backing file")));
    assert!(seen.iter().any(|msg| msg.contains("filesystem")));
    assert!(seen.iter().any(|msg| msg.contains("mounted")));
}
