//! Kernel selection: boot artifacts into the boot partition.

use std::path::PathBuf;

use crate::deploy::ArtifactKind;
use crate::error::Result;
use crate::firmware::{FirmwareLayout, KernelVariant};
use crate::mount::MountMode;
use crate::partition::BOOT_PARTITION;

use super::{require_artifact, Provisioner};

/// In-image name of the u-boot wrapped ramdisk some boards load from partition 1.
const U_BOOT_RAMDISK: &str = "ramdisk.cpio.gz.u-boot";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningRequest {
    pub kernel: KernelVariant,
    /// Workspace install tree to deploy afterwards, relative to the workspace root.
    pub install_dir: Option<PathBuf>,
    pub skip_workspace: bool,
}

/// A boot-partition artifact: kind, firmware source and in-image name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootFile {
    pub kind: ArtifactKind,
    pub source: PathBuf,
    pub destination: &'static str,
}

impl BootFile {
    fn new(kind: ArtifactKind, source: PathBuf) -> Self {
        Self {
            kind,
            source,
            destination: kind.default_name().unwrap_or_default(),
        }
    }
}

/// Boot-partition contents for `variant`, in deployment order.
pub fn boot_files(firmware: &FirmwareLayout, variant: KernelVariant) -> Result<Vec<BootFile>> {
    let mut files = vec![
        BootFile::new(ArtifactKind::Kernel, firmware.kernel(variant)),
        BootFile::new(ArtifactKind::BootScript, firmware.boot_script()),
        BootFile::new(ArtifactKind::DeviceTree, firmware.device_tree()),
        BootFile::new(ArtifactKind::BootBinary, firmware.boot_binary()?),
    ];
    if firmware.needs_u_boot_ramdisk()? {
        files.push(BootFile {
            kind: ArtifactKind::Ramdisk,
            source: firmware.u_boot_ramdisk(),
            destination: U_BOOT_RAMDISK,
        });
    }
    Ok(files)
}

impl Provisioner<'_> {
    /// Install the requested kernel with its boot script, device tree and
    /// BOOT.BIN, then deploy the workspace overlay if one was requested.
    ///
    /// Every source, the workspace overlay's included, is checked before
    /// partition 1 is mounted.
    pub fn select_kernel(&mut self, request: &ProvisioningRequest) -> Result<Vec<PathBuf>> {
        let files = boot_files(&self.firmware, request.kernel)?;
        for file in &files {
            require_artifact(file.kind, &file.source)?;
        }
        let workspace = match (&request.install_dir, request.skip_workspace) {
            (Some(dir), false) => Some(self.prepare_workspace(dir)?),
            _ => None,
        };

        println!("  Selecting {} kernel", request.kernel);
        let deployed = self.run_partition(BOOT_PARTITION, MountMode::ReadWrite, |deployer, handle| {
            files
                .iter()
                .map(|file| deployer.deploy(handle, file.kind, &file.source, file.destination))
                .collect::<Result<Vec<_>>>()
        })?;

        if let Some(plan) = workspace {
            self.deploy_prepared_workspace(plan)?;
        }
        Ok(deployed)
    }
}
