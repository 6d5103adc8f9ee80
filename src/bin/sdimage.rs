use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sdimage::config::ProvisionConfig;
use sdimage::firmware::{FirmwareCatalog, FirmwareLayout, KernelVariant};
use sdimage::mount::MountManager;
use sdimage::partition::{FdiskTable, PartitionTableReader, RawImage};
use sdimage::pipeline::{
    HypervisorRequest, ProvisionContext, Provisioner, ProvisioningRequest, RamdiskRequest,
};
use sdimage::preflight::{self, check_tool_sets};
use sdimage::process::HostRunner;

#[derive(Parser, Debug)]
#[command(name = "sdimage", version, about = "Provision raw SD-card images in place")]
struct Cli {
    /// Configuration file (default: ./sdimage.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Firmware directory holding the image and boot artifacts
    #[arg(long, global = true, env = "SDIMAGE_FIRMWARE_DIR")]
    firmware_dir: Option<PathBuf>,

    /// Raw image file name inside the firmware directory
    #[arg(long, global = true)]
    image: Option<String>,

    /// Run privileged commands without sudo
    #[arg(long, global = true)]
    no_sudo: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print unit size, start sectors and byte offsets of the image partitions
    Geometry {
        partition: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    /// Loop mount a partition of the image
    Mount {
        #[arg(default_value_t = 2)]
        partition: u32,
    },
    /// Unmount a partition of the image
    Umount {
        #[arg(default_value_t = 2, conflicts_with = "all")]
        partition: u32,
        /// Unmount every partition listed in `default_unmount_partitions`
        #[arg(long)]
        all: bool,
        /// Tear down stale device-mapper and loop devices instead
        #[arg(long, conflicts_with = "all")]
        fix: bool,
    },
    /// Install a kernel with its boot files, then the workspace overlay
    Linux {
        #[arg(value_enum, default_value_t = KernelVariant::Vanilla)]
        variant: KernelVariant,
        #[arg(long)]
        install_dir: Option<PathBuf>,
        #[arg(long)]
        no_workspace: bool,
    },
    /// Deploy the workspace overlay into the root filesystem
    Workspace {
        #[arg(long)]
        install_dir: Option<PathBuf>,
    },
    /// Archive the root filesystem into a gzip'd cpio ramdisk
    Mkinitramfs {
        /// Output file name, must end in .cpio.gz
        out_file: String,
    },
    /// Generate the Xen boot configuration and install it
    Hypervisor {
        #[arg(long, value_enum)]
        dom0: Option<KernelVariant>,
        #[arg(long, value_enum)]
        domu: Vec<KernelVariant>,
        #[arg(long, value_enum)]
        dom0less: Vec<KernelVariant>,
        /// Guest ramdisk, in guest order
        #[arg(long)]
        ramdisk: Vec<String>,
        /// Print the configuration and keep the staging directory
        #[arg(long)]
        debug: bool,
    },
    /// Copy a firmware file into the boot partition
    AddFile { file: String },
    /// List deployed firmware, marking the selected one
    List,
    /// Point the firmware directory at one of the deployed firmware
    Select { firmware: String },
}

fn init_tracing(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("SDIMAGE_LOG")
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let workspace_root = std::env::current_dir().context("resolving current directory")?;
    let mut config = ProvisionConfig::load(cli.config.as_deref(), &workspace_root)?;
    if let Some(dir) = cli.firmware_dir {
        config.firmware_dir = dir;
    }
    if let Some(image) = cli.image {
        config.image = image;
    }
    config.resolve_paths(&workspace_root);
    config.validate().context("validating command line overrides")?;

    let sudo = !cli.no_sudo && config.use_sudo();
    let runner = HostRunner;
    let table = FdiskTable::new(&runner, config.timeouts.query());
    let context = ProvisionContext::from_config(&config, &workspace_root, sudo);
    let firmware = FirmwareLayout::new(&config.firmware_dir, &config.image);

    match cli.command {
        Command::Geometry { partition, json } => {
            check_tool_sets(&[preflight::GEOMETRY_TOOLS], false)?;
            let image = RawImage::open(config.image_path())?;
            let geometry = table.read_geometry(&image)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&geometry)?);
                return Ok(());
            }
            println!("{} (units of {} bytes)", image.path().display(), geometry.unit_bytes());
            let partitions: Vec<u32> = match partition {
                Some(p) => vec![p],
                None => geometry.partitions().collect(),
            };
            for p in partitions {
                println!(
                    "  partition {}{}: start {} offset {}",
                    p,
                    if geometry.is_bootable(p) { " (boot)" } else { "" },
                    geometry.start_sector(p)?,
                    geometry.offset_bytes(p)?
                );
            }
        }
        Command::Mount { partition } => {
            check_tool_sets(&[preflight::MOUNT_TOOLS], sudo)?;
            let image = RawImage::open(config.image_path())?;
            let mut mounts = MountManager::new(&runner, &table, context.mount_settings());
            mounts
                .mount(&image, partition)
                .with_context(|| format!("mounting partition {}", partition))?;
        }
        Command::Umount {
            partition,
            all,
            fix,
        } => {
            let mounts_sets: &[&[(&str, &str)]] = if fix {
                &[preflight::RECOVERY_TOOLS]
            } else {
                &[preflight::MOUNT_TOOLS]
            };
            check_tool_sets(mounts_sets, sudo)?;
            let mut mounts = MountManager::new(&runner, &table, context.mount_settings());
            if fix {
                mounts.force_cleanup().context("releasing stale loop devices")?;
            } else if all {
                mounts.unmount(None).context("unmounting the default partitions")?;
            } else {
                mounts
                    .unmount(Some(partition))
                    .with_context(|| format!("unmounting partition {}", partition))?;
            }
        }
        Command::Linux {
            variant,
            install_dir,
            no_workspace,
        } => {
            check_tool_sets(&[preflight::MOUNT_TOOLS, preflight::DEPLOY_TOOLS], sudo)?;
            let install_dir = if no_workspace {
                None
            } else {
                install_dir.or_else(|| default_install_dir(&workspace_root, &config))
            };
            let request = ProvisioningRequest {
                kernel: variant,
                skip_workspace: install_dir.is_none(),
                install_dir,
            };
            let mut provisioner = Provisioner::new(&runner, &table, firmware, context);
            provisioner
                .select_kernel(&request)
                .with_context(|| format!("selecting the {} kernel", variant))?;
        }
        Command::Workspace { install_dir } => {
            check_tool_sets(&[preflight::MOUNT_TOOLS, preflight::DEPLOY_TOOLS], sudo)?;
            let mut provisioner = Provisioner::new(&runner, &table, firmware, context);
            provisioner
                .deploy_workspace(install_dir.as_deref())
                .context("deploying the workspace overlay")?;
        }
        Command::Mkinitramfs { out_file } => {
            check_tool_sets(&[preflight::MOUNT_TOOLS, preflight::RAMDISK_TOOLS], sudo)?;
            let request = RamdiskRequest::new(out_file)?;
            let mut provisioner = Provisioner::new(&runner, &table, firmware, context);
            provisioner
                .extract_ramdisk(&request)
                .context("extracting the ramdisk")?;
        }
        Command::Hypervisor {
            dom0,
            domu,
            dom0less,
            ramdisk,
            debug,
        } => {
            check_tool_sets(
                &[
                    preflight::MOUNT_TOOLS,
                    preflight::DEPLOY_TOOLS,
                    preflight::HYPERVISOR_TOOLS,
                ],
                sudo,
            )?;
            let request =
                HypervisorRequest::from_guests(dom0, &domu, &dom0less, ramdisk, debug).or_default();
            let mut provisioner = Provisioner::new(&runner, &table, firmware, context);
            provisioner
                .configure_hypervisor(&request)
                .context("configuring the hypervisor")?;
        }
        Command::AddFile { file } => {
            check_tool_sets(&[preflight::MOUNT_TOOLS, preflight::DEPLOY_TOOLS], sudo)?;
            let mut provisioner = Provisioner::new(&runner, &table, firmware, context);
            provisioner
                .add_boot_file(&file)
                .with_context(|| format!("adding '{}' to the boot partition", file))?;
        }
        Command::List => {
            let catalog = FirmwareCatalog::for_selection(&config.firmware_dir)?;
            let entries = catalog.list()?;
            if entries.is_empty() {
                println!("No firmware deployed under {}", catalog.root().display());
            }
            for entry in &entries {
                println!("{}{}", entry.name, if entry.selected { "*" } else { "" });
            }
            if !entries.is_empty() && catalog.selected().is_none() {
                println!("Select firmware first with `sdimage select <FIRMWARE>`.");
            }
        }
        Command::Select { firmware } => {
            let catalog = FirmwareCatalog::for_selection(&config.firmware_dir)?;
            catalog
                .select(&firmware)
                .with_context(|| format!("selecting firmware '{}'", firmware))?;
        }
    }

    Ok(())
}

/// The configured install tree, when the workspace has been built.
fn default_install_dir(workspace_root: &Path, config: &ProvisionConfig) -> Option<PathBuf> {
    let dir = PathBuf::from(&config.overlay.install_dir);
    let resolved = if dir.is_absolute() {
        dir.clone()
    } else {
        workspace_root.join(&dir)
    };
    resolved.is_dir().then_some(dir)
}
