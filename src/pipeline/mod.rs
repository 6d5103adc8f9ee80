//! Provisioning pipelines.
//!
//! Every pipeline is a sequence of partition runs. A run walks
//!
//! ```text
//! Idle -> GeometryResolved -> Mounted -> Deployed -> Unmounted -> Idle
//! ```
//!
//! with `Failed` absorbing. Once a partition is mounted it is unmounted
//! exactly once, whatever the deployment did. The pipelines themselves live
//! in the submodules:
//!
//! - [`kernel`]: kernel, boot script, device tree and BOOT.BIN into partition 1
//! - [`workspace`]: the workspace overlay into partition 2
//! - [`ramdisk`]: partition 2 archived as a compressed cpio ramdisk
//! - [`hypervisor`]: Xen artifacts and generated boot script into partition 1

pub mod hypervisor;
pub(crate) mod io;
pub mod kernel;
pub mod ramdisk;
pub mod workspace;

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::{HypervisorConfig, OverlayConfig, ProvisionConfig, Timeouts};
use crate::deploy::{ArtifactKind, Deployer};
use crate::error::{ProvisionError, Result};
use crate::firmware::FirmwareLayout;
use crate::mount::{MountHandle, MountManager, MountMode, MountSettings};
use crate::partition::{PartitionTableReader, RawImage, BOOT_PARTITION};
use crate::process::CommandRunner;

pub use hypervisor::HypervisorRequest;
pub use kernel::ProvisioningRequest;
pub use ramdisk::RamdiskRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    GeometryResolved,
    Mounted,
    Deployed,
    Unmounted,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::GeometryResolved => "geometry-resolved",
            Stage::Mounted => "mounted",
            Stage::Deployed => "deployed",
            Stage::Unmounted => "unmounted",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Transition history of one partition run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRun {
    partition: u32,
    transitions: Vec<Stage>,
}

impl PipelineRun {
    pub fn new(partition: u32) -> Self {
        Self {
            partition,
            transitions: vec![Stage::Idle],
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn stage(&self) -> Stage {
        self.transitions.last().copied().unwrap_or(Stage::Idle)
    }

    pub fn transitions(&self) -> &[Stage] {
        &self.transitions
    }

    pub fn failed(&self) -> bool {
        self.stage() == Stage::Failed
    }

    fn advance(&mut self, next: Stage) {
        let current = self.stage();
        if current == Stage::Failed {
            return;
        }
        tracing::info!(partition = self.partition, from = %current, to = %next, "pipeline transition");
        self.transitions.push(next);
    }
}

/// Mount `partition`, hand it to `deploy`, and unmount it again.
///
/// When both the deployment and the unmount fail, the deployment error is
/// returned and the unmount error is logged.
pub fn provision_partition<T>(
    mounts: &mut MountManager<'_>,
    run: &mut PipelineRun,
    image: &RawImage,
    mode: MountMode,
    deploy: impl FnOnce(&MountHandle) -> Result<T>,
) -> Result<T> {
    let partition = run.partition();

    let geometry = mounts
        .ensure_not_mounted(partition)
        .and_then(|_| mounts.read_geometry(image));
    let geometry = match geometry {
        Ok(geometry) => geometry,
        Err(e) => {
            run.advance(Stage::Failed);
            return Err(e);
        }
    };
    run.advance(Stage::GeometryResolved);

    let handle = match mounts.mount_with_geometry(image, partition, &geometry, mode) {
        Ok(handle) => handle,
        Err(e) => {
            run.advance(Stage::Failed);
            return Err(e);
        }
    };
    run.advance(Stage::Mounted);

    let deployed = deploy(&handle);
    match &deployed {
        Ok(_) => run.advance(Stage::Deployed),
        Err(_) => run.advance(Stage::Failed),
    }

    let unmounted = mounts.unmount(Some(partition));

    match (deployed, unmounted) {
        (Ok(value), Ok(())) => {
            run.advance(Stage::Unmounted);
            run.advance(Stage::Idle);
            Ok(value)
        }
        (Ok(_), Err(e)) => {
            run.advance(Stage::Failed);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(unmount)) => {
            tracing::error!(
                partition,
                error = %unmount,
                "unmount after failed deployment also failed; release it with `sdimage umount --fix`"
            );
            Err(e)
        }
    }
}

/// Everything a [`Provisioner`] needs besides the command runner.
#[derive(Debug, Clone)]
pub struct ProvisionContext {
    pub workspace_root: PathBuf,
    /// Overlay directory name inside the rootfs.
    pub workspace_name: String,
    pub scratch_dir: PathBuf,
    pub sudo: bool,
    pub mount_prefix: String,
    pub default_unmount: Vec<u32>,
    pub timeouts: Timeouts,
    pub overlay: OverlayConfig,
    pub hypervisor: HypervisorConfig,
}

impl ProvisionContext {
    pub fn from_config(config: &ProvisionConfig, workspace_root: &Path, sudo: bool) -> Self {
        Self {
            workspace_root: workspace_root.to_path_buf(),
            workspace_name: config
                .workspace_name(workspace_root)
                .unwrap_or_else(|| "ros2_ws".to_string()),
            scratch_dir: config.scratch_dir.clone(),
            sudo,
            mount_prefix: config.mount_prefix.clone(),
            default_unmount: config.default_unmount_partitions.clone(),
            timeouts: config.timeouts.clone(),
            overlay: config.overlay.clone(),
            hypervisor: config.hypervisor.clone(),
        }
    }

    pub fn mount_settings(&self) -> MountSettings {
        MountSettings {
            mount_prefix: self.mount_prefix.clone(),
            sudo: self.sudo,
            mount_timeout: self.timeouts.mount(),
            unmount_timeout: self.timeouts.unmount(),
            default_unmount: self.default_unmount.clone(),
        }
    }
}

/// Drives the provisioning pipelines against one firmware directory.
pub struct Provisioner<'a> {
    runner: &'a dyn CommandRunner,
    mounts: MountManager<'a>,
    deployer: Deployer<'a>,
    firmware: FirmwareLayout,
    context: ProvisionContext,
    runs: Vec<PipelineRun>,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        table: &'a dyn PartitionTableReader,
        firmware: FirmwareLayout,
        context: ProvisionContext,
    ) -> Self {
        Self {
            runner,
            mounts: MountManager::new(runner, table, context.mount_settings()),
            deployer: Deployer::new(runner, context.sudo, context.timeouts.copy()),
            firmware,
            context,
            runs: Vec::new(),
        }
    }

    pub fn firmware(&self) -> &FirmwareLayout {
        &self.firmware
    }

    pub fn context(&self) -> &ProvisionContext {
        &self.context
    }

    pub fn mounts(&self) -> &MountManager<'a> {
        &self.mounts
    }

    /// Partition runs performed so far, oldest first.
    pub fn runs(&self) -> &[PipelineRun] {
        &self.runs
    }

    pub(crate) fn image(&self) -> Result<RawImage> {
        RawImage::open(self.firmware.raw_image())
    }

    /// Run one partition through [`provision_partition`] and keep its history.
    pub(crate) fn run_partition<T>(
        &mut self,
        partition: u32,
        mode: MountMode,
        deploy: impl FnOnce(&Deployer<'a>, &MountHandle) -> Result<T>,
    ) -> Result<T> {
        let image = self.image()?;
        let mut run = PipelineRun::new(partition);
        let deployer = &self.deployer;
        let result = provision_partition(&mut self.mounts, &mut run, &image, mode, |handle| {
            deploy(deployer, handle)
        });
        self.runs.push(run);
        result
    }

    /// Copy a file from the firmware directory into partition 1's root.
    pub fn add_boot_file(&mut self, relative: &str) -> Result<PathBuf> {
        let source = self.firmware.file(relative.trim_start_matches('/'));
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                ProvisionError::InvalidRequest(format!("'{}' does not name a file", relative))
            })?;
        require_artifact(ArtifactKind::File, &source)?;

        self.run_partition(BOOT_PARTITION, MountMode::ReadWrite, |deployer, handle| {
            deployer.deploy(handle, ArtifactKind::File, &source, &name)
        })
    }
}

/// Fail with [`ProvisionError::ArtifactNotFound`] unless `path` exists.
pub(crate) fn require_artifact(kind: ArtifactKind, path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(ProvisionError::ArtifactNotFound {
            kind: kind.to_string(),
            path: path.to_path_buf(),
        })
    }
}
