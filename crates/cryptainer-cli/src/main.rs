//! cryptainer command-line interface for the container lifecycle.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cryptainer_core::{
    config::{CryptainerConfig, DEFAULT_CONFIG_PATH},
    logging,
    manager::{ContainerManager, ContainerStatus, CreateRequest, DeletionConfirmation},
    registry::Registry,
    report::{OperationEvent, OperationLevel, OperationReport},
    units,
};
use cryptainer_system::SystemResources;
use log::warn;
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

type Manager = ContainerManager<
    cryptainer_system::SystemLoopDevices,
    cryptainer_system::SystemBlockCrypto,
    cryptainer_system::SystemFilesystemFormatter,
    cryptainer_system::SystemMountTable,
>;

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "cryptainer",
    version,
    about = "Manage encrypted file-backed storage containers (loop device + dm-crypt + mount)."
)]
struct Cli {
    /// Path to the cryptainer configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands covering the full container lifecycle.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Create, encrypt, format, and mount a new container.
    Create {
        /// Backing file to create (e.g. /data/secure.img).
        path: PathBuf,

        /// Container size with optional suffix (e.g. 500M, 2G).
        size: String,

        /// Mapper name hint; defaults to the backing file's base name.
        #[arg(long)]
        name: Option<String>,

        /// Destroy the content of an existing file at the target path.
        #[arg(long)]
        overwrite: bool,
    },

    /// Unlock and mount a registered container.
    Mount {
        /// Registry index, backing file path, or mapper name.
        target: String,
    },

    /// Unmount a container and release its kernel resources.
    Unmount {
        /// Registry index, backing file path, or mapper name.
        target: String,
    },

    /// Destroy a container, its backing file, and its registry record.
    Delete {
        /// Registry index, backing file path, or mapper name.
        target: String,
    },

    /// List registered containers with their live state.
    List,

    /// Show detailed live state for one container.
    Status {
        /// Registry index, backing file path, or mapper name.
        target: String,
    },

    /// Validate a configuration file or emit the config schema.
    Validate {
        /// Path to the configuration file to validate.
        #[arg(short = 'f', long, default_value = DEFAULT_CONFIG_PATH)]
        file: PathBuf,

        /// Output the JSON schema instead of validating a file.
        #[arg(long)]
        schema: bool,
    },
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    match cli.command {
        Commands::Create {
            path,
            size,
            name,
            overwrite,
        } => {
            let manager = build_manager(&cli.config)?;
            let size_bytes = units::parse_size(&size).map_err(anyhow::Error::new)?;

            let passphrase = Zeroizing::new(
                prompt_password("Passphrase for new container: ")?.into_bytes(),
            );
            let passphrase_confirm =
                Zeroizing::new(prompt_password("Verify passphrase: ")?.into_bytes());

            let request = CreateRequest {
                backing_path: path,
                size_bytes,
                mapper_hint: name,
                passphrase,
                passphrase_confirm,
                overwrite,
            };
            // Progress is streamed as the steps complete; filesystem
            // creation on a large container can take a while.
            let report = manager
                .create_observed(request, &mut print_event)
                .map_err(anyhow::Error::new)?;
            println!("{}", report.title);
        }

        Commands::Mount { target } => {
            let manager = build_manager(&cli.config)?;
            let index = resolve_target(&manager.registry().map_err(anyhow::Error::new)?, &target)?;
            let passphrase = Zeroizing::new(prompt_password("Passphrase: ")?.into_bytes());
            let outcome = manager
                .mount(index, &passphrase)
                .map_err(anyhow::Error::new)?;
            print_report(outcome.report);
        }

        Commands::Unmount { target } => {
            let manager = build_manager(&cli.config)?;
            let index = resolve_target(&manager.registry().map_err(anyhow::Error::new)?, &target)?;
            let report = manager.unmount(index).map_err(anyhow::Error::new)?;
            print_report(report);
        }

        Commands::Delete { target } => {
            let manager = build_manager(&cli.config)?;
            let registry = manager.registry().map_err(anyhow::Error::new)?;
            let index = resolve_target(&registry, &target)?;
            let backing = registry.entries[index].backing_path.clone();

            println!(
                "This will irreversibly destroy all data in {} and cannot be undone.",
                backing.display()
            );
            let acknowledged = prompt_line("Type 'yes' to continue: ")? == "yes";
            if !acknowledged {
                bail!("deletion aborted");
            }
            let confirmed_path =
                PathBuf::from(prompt_line("Retype the full backing file path to confirm: ")?);

            let report = manager
                .delete(
                    index,
                    DeletionConfirmation {
                        acknowledged_irreversible: acknowledged,
                        confirmed_path,
                    },
                )
                .map_err(anyhow::Error::new)?;
            print_report(report);
        }

        Commands::List => {
            let manager = build_manager(&cli.config)?;
            let statuses = manager.list().map_err(anyhow::Error::new)?;
            if statuses.is_empty() {
                println!("No containers registered.");
            }
            for status in statuses {
                println!(
                    "[{}] {}  ({})",
                    status.index,
                    status.container.backing_path.display(),
                    describe_state(&status)
                );
            }
        }

        Commands::Status { target } => {
            let manager = build_manager(&cli.config)?;
            let index = resolve_target(&manager.registry().map_err(anyhow::Error::new)?, &target)?;
            let status = manager.status(index).map_err(anyhow::Error::new)?;
            println!("backing file : {}", status.container.backing_path.display());
            println!(
                "loop device  : {}",
                status.container.device_handle.as_deref().unwrap_or("-")
            );
            println!("mapper name  : {}", status.container.mapper_name);
            println!("mount point  : {}", status.container.mount_point.display());
            println!("state        : {}", describe_state(&status));
        }

        Commands::Validate { file, schema } => {
            if schema {
                let schema = schema_for!(CryptainerConfig);
                println!("{}", to_string_pretty(&schema)?);
                return Ok(());
            }
            let config = CryptainerConfig::load(&file)
                .with_context(|| format!("configuration at {} is invalid", file.display()))?;
            println!("{} is valid.", config.path.display());
            println!("registry: {}", config.registry_path().display());
            println!("mount root: {}", config.mount_root().display());
        }
    }

    Ok(())
}

fn build_manager(config_path: &Path) -> Result<Manager> {
    let config = load_cli_config(config_path)?;
    let resources = SystemResources::from_config(&config).map_err(anyhow::Error::new)?;
    Ok(ContainerManager::new(
        Arc::new(config),
        resources.loops,
        resources.crypto,
        resources.mkfs,
        resources.mounts,
    ))
}

fn load_cli_config(path: &Path) -> Result<CryptainerConfig> {
    let config = CryptainerConfig::load_or_bootstrap(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    if config.path != path {
        println!(
            "Using bootstrap configuration at {}.",
            config.path.display()
        );
    }

    Ok(config)
}

/// Accept a registry index, a backing file path, or a mapper name.
fn resolve_target(registry: &Registry, target: &str) -> Result<usize> {
    if registry.is_empty() {
        bail!("no containers registered");
    }

    if target.chars().all(|ch| ch.is_ascii_digit()) {
        let index: usize = target.parse()?;
        if index >= registry.len() {
            bail!(
                "no container at index {index}; run `cryptainer list` (registry holds {})",
                registry.len()
            );
        }
        return Ok(index);
    }

    if let Some(index) = registry.find_by_backing_path(Path::new(target)) {
        return Ok(index);
    }
    if let Some(index) = registry.find_by_mapper_name(target) {
        return Ok(index);
    }

    bail!("`{target}` does not match any registered container (index, backing path, or mapper name)");
}

fn describe_state(status: &ContainerStatus) -> String {
    if status.backing_missing {
        warn!(
            "backing file {} has disappeared out-of-band",
            status.container.backing_path.display()
        );
        return "backing file missing".to_string();
    }
    if status.mounted {
        "mounted".to_string()
    } else if status.unlocked {
        "unlocked, not mounted".to_string()
    } else if status.attached {
        "attached, locked".to_string()
    } else {
        "closed".to_string()
    }
}

fn print_event(event: &OperationEvent) {
    let prefix = match event.level {
        OperationLevel::Info => "  ..",
        OperationLevel::Success => "  ok",
        OperationLevel::Warn => "  !!",
        OperationLevel::Error => "  xx",
    };
    println!("{prefix} {}", event.message);
}

fn print_report(report: OperationReport) {
    for event in &report.events {
        print_event(event);
    }
    println!("{}", report.title);
}

fn prompt_line(prompt: &str) -> Result<String> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
