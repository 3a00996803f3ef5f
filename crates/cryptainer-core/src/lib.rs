//! Core building blocks shared by cryptainer binaries.
//!
//! Configuration, the container registry, collaborator contracts, and the
//! lifecycle manager live here so downstream crates can focus on operator
//! surfaces instead of reimplementing orchestration.

pub mod allocator;
pub mod config;
pub mod container;
pub mod error;
pub mod guard;
pub mod logging;
pub mod manager;
pub mod ownership;
pub mod registry;
pub mod report;
pub mod resources;
pub mod units;

pub use config::{ConfigFormat, CryptainerConfig, StorageCfg, SystemCfg};
pub use container::Container;
pub use ownership::Ownership;
pub use error::{CryptainerError, CryptainerResult};
pub use manager::{
    ContainerManager, ContainerStatus, CreateRequest, DeletionConfirmation, MountOutcome,
};
pub use registry::{Registry, RegistryStore};
pub use report::{OperationEvent, OperationLevel, OperationReport};
pub use resources::{BlockCrypto, FilesystemFormatter, LoopBinding, LoopDevices, MappingState, MountTable};
