//! Xen hypervisor configuration.
//!
//! Xen artifacts, the guest kernels and ramdisks are assembled in a staging
//! directory together with a rendered imagebuilder `xen.cfg`. The
//! imagebuilder `uboot-script-gen` turns that into `boot.scr`, and the whole
//! directory is copied into the boot partition.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::deploy::ArtifactKind;
use crate::error::{ProvisionError, Result};
use crate::firmware::KernelVariant;
use crate::mount::MountMode;
use crate::partition::BOOT_PARTITION;
use crate::process::Cmd;

use super::io::{recreate_dir, stage_file, staged_files};
use super::{require_artifact, Provisioner};

/// Name of the staging directory under the scratch directory.
pub const STAGING_DIR: &str = "hypervisor";

pub const CONFIG_FILE: &str = "xen.cfg";

const CONFIG_HEADER: &str = "\
MEMORY_START=0x0
MEMORY_END=0x80000000
DEVICE_TREE=system.dtb
XEN=xen
UBOOT_SOURCE=boot.source
UBOOT_SCRIPT=boot.scr
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestKind {
    /// Started by dom0 after boot.
    DomU,
    /// Started by Xen directly at boot.
    Dom0less,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guest {
    pub kind: GuestKind,
    pub kernel: KernelVariant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HypervisorRequest {
    pub dom0: Option<KernelVariant>,
    pub guests: Vec<Guest>,
    /// Ramdisks of the guests, in guest order. Dom0 is not included.
    pub ramdisks: Vec<String>,
    /// Print the rendered configuration and keep the staging directory.
    pub debug: bool,
}

impl HypervisorRequest {
    /// Build a request from separate domU and dom0less guest lists.
    pub fn from_guests(
        dom0: Option<KernelVariant>,
        domu: &[KernelVariant],
        dom0less: &[KernelVariant],
        ramdisks: Vec<String>,
        debug: bool,
    ) -> Self {
        let guests = domu
            .iter()
            .map(|&kernel| Guest {
                kind: GuestKind::DomU,
                kernel,
            })
            .chain(dom0less.iter().map(|&kernel| Guest {
                kind: GuestKind::Dom0less,
                kernel,
            }))
            .collect();
        Self {
            dom0,
            guests,
            ramdisks,
            debug,
        }
    }

    /// An empty request means dom0 plus one dom0less guest, both vanilla.
    pub fn or_default(mut self) -> Self {
        if self.dom0.is_none() && self.guests.is_empty() {
            self.dom0 = Some(KernelVariant::Vanilla);
            self.guests.push(Guest {
                kind: GuestKind::Dom0less,
                kernel: KernelVariant::Vanilla,
            });
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let has = |kind: GuestKind| self.guests.iter().any(|g| g.kind == kind);
        if has(GuestKind::DomU) && has(GuestKind::Dom0less) {
            return Err(ProvisionError::InvalidRequest(
                "domU and dom0less guests cannot be combined".to_string(),
            ));
        }
        if self.dom0.is_none() {
            return Err(ProvisionError::InvalidRequest(
                "no dom0 kernel given; guests need a dom0".to_string(),
            ));
        }
        if self.ramdisks.len() > self.guests.len() {
            return Err(ProvisionError::InvalidRequest(format!(
                "{} ramdisks given for {} guests (dom0 takes none)",
                self.ramdisks.len(),
                self.guests.len()
            )));
        }
        for ramdisk in &self.ramdisks {
            if ramdisk.is_empty() || ramdisk.contains('/') {
                return Err(ProvisionError::InvalidRequest(format!(
                    "ramdisk '{}' must be a file name inside the firmware directory",
                    ramdisk
                )));
            }
        }
        Ok(())
    }

    /// Ramdisk of guest `index`: its own, else `default`.
    pub fn guest_ramdisk<'a>(&'a self, index: usize, default: &'a str) -> &'a str {
        self.ramdisks.get(index).map(String::as_str).unwrap_or(default)
    }

    /// Distinct kernels used by dom0 and the guests.
    pub fn kernels(&self) -> BTreeSet<&'static str> {
        self.dom0
            .iter()
            .chain(self.guests.iter().map(|g| &g.kernel))
            .map(|k| k.image_name())
            .collect()
    }
}

/// Render the imagebuilder configuration for a validated request.
pub fn render_config(request: &HypervisorRequest, default_ramdisk: &str) -> String {
    let mut config = String::from(CONFIG_HEADER);
    if let Some(dom0) = request.dom0 {
        let _ = writeln!(config, "DOM0_KERNEL={}", dom0.image_name());
        let _ = writeln!(config, "DOM0_RAMDISK={}", default_ramdisk);
    }
    for (i, guest) in request.guests.iter().enumerate() {
        let _ = writeln!(config, "DOMU_KERNEL[{}]=\"{}\"", i, guest.kernel.image_name());
        let _ = writeln!(
            config,
            "DOMU_RAMDISK[{}]=\"{}\"",
            i,
            request.guest_ramdisk(i, default_ramdisk)
        );
    }
    let _ = writeln!(config, "NUM_DOMUS={}", request.guests.len());
    config
}

fn kind_of(name: &str) -> ArtifactKind {
    match name {
        "BOOT.BIN" => ArtifactKind::BootBinary,
        "system.dtb" => ArtifactKind::DeviceTree,
        "boot.scr" => ArtifactKind::BootScript,
        "Image" | "Image_PREEMPT_RT" => ArtifactKind::Kernel,
        n if n.contains("cpio") => ArtifactKind::Ramdisk,
        _ => ArtifactKind::File,
    }
}

impl Provisioner<'_> {
    /// Stage the Xen boot set, generate its boot script and install it into
    /// the boot partition.
    pub fn configure_hypervisor(&mut self, request: &HypervisorRequest) -> Result<Vec<PathBuf>> {
        let request = request.clone().or_default();
        request.validate()?;

        let default_ramdisk = self.context.hypervisor.default_ramdisk.clone();
        let mut sources: Vec<(PathBuf, String)> = vec![
            (self.firmware.xen_boot_binary(), "BOOT.BIN".to_string()),
            (self.firmware.xen(), "xen".to_string()),
            (self.firmware.xen_device_tree(), "system.dtb".to_string()),
            (self.firmware.file(&default_ramdisk), default_ramdisk.clone()),
        ];
        for kernel in request.kernels() {
            sources.push((self.firmware.file("kernel").join(kernel), kernel.to_string()));
        }
        for ramdisk in &request.ramdisks {
            if *ramdisk != default_ramdisk {
                sources.push((self.firmware.file(ramdisk), ramdisk.clone()));
            }
        }
        for (source, name) in &sources {
            require_artifact(kind_of(name), source)?;
        }
        let generator = self.firmware.boot_script_generator();
        require_artifact(ArtifactKind::File, &generator)?;

        let config = render_config(&request, &default_ramdisk);
        if request.debug {
            println!("  Rendered {}:\n{}", CONFIG_FILE, config);
        }

        let staging = recreate_dir(&self.context.scratch_dir.join(STAGING_DIR))?;
        let result = self.install_staged(&staging, &sources, &config, &generator);

        if request.debug {
            println!("  Keeping staging directory {}", staging.display());
        } else if let Err(e) = fs::remove_dir_all(&staging) {
            tracing::warn!(staging = %staging.display(), error = %e, "could not remove staging directory");
        }
        result
    }

    fn install_staged(
        &mut self,
        staging: &Path,
        sources: &[(PathBuf, String)],
        config: &str,
        generator: &Path,
    ) -> Result<Vec<PathBuf>> {
        for (source, name) in sources {
            stage_file(source, staging, name)?;
        }
        let config_path = staging.join(CONFIG_FILE);
        fs::write(&config_path, config).map_err(|e| {
            ProvisionError::io(format!("writing '{}'", config_path.display()), e)
        })?;

        Cmd::new("bash")
            .arg_path(generator)
            .args(["-c", CONFIG_FILE, "-d", ".", "-t"])
            .arg(self.context.hypervisor.boot_target.as_str())
            .current_dir(staging)
            .timeout(self.context.timeouts.generator())
            .error_msg("generating the Xen boot script failed")
            .run(self.runner)?;

        let staged = staged_files(staging)?;
        println!("  Installing {} Xen artifacts", staged.len());
        self.run_partition(BOOT_PARTITION, MountMode::ReadWrite, |deployer, handle| {
            staged
                .iter()
                .map(|path| {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    deployer.deploy(handle, kind_of(&name), path, &name)
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::*;

    fn seed_xen(ws: &Workspace) {
        ws.touch("bootbin/BOOT.BIN.xen");
        ws.touch("xen");
        ws.touch("device_tree/system.dtb.xen");
        ws.touch("initrd.cpio");
        ws.touch("kernel/Image");
        ws.touch("kernel/Image_PREEMPT_RT");
        ws.touch("imagebuilder/scripts/uboot-script-gen");
    }

    fn names(paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_default_request() {
        let request = HypervisorRequest::default().or_default();
        assert_eq!(request.dom0, Some(KernelVariant::Vanilla));
        assert_eq!(
            request.guests,
            vec![Guest {
                kind: GuestKind::Dom0less,
                kernel: KernelVariant::Vanilla
            }]
        );
        request.validate().unwrap();
    }

    #[test]
    fn test_render_default_config() {
        let request = HypervisorRequest::default().or_default();
        assert_eq!(
            render_config(&request, "initrd.cpio"),
            "MEMORY_START=0x0\n\
             MEMORY_END=0x80000000\n\
             DEVICE_TREE=system.dtb\n\
             XEN=xen\n\
             UBOOT_SOURCE=boot.source\n\
             UBOOT_SCRIPT=boot.scr\n\
             DOM0_KERNEL=Image\n\
             DOM0_RAMDISK=initrd.cpio\n\
             DOMU_KERNEL[0]=\"Image\"\n\
             DOMU_RAMDISK[0]=\"initrd.cpio\"\n\
             NUM_DOMUS=1\n"
        );
    }

    #[test]
    fn test_render_guest_ramdisks_fall_back_to_default() {
        let request = HypervisorRequest::from_guests(
            Some(KernelVariant::PreemptRt),
            &[KernelVariant::Vanilla, KernelVariant::PreemptRt],
            &[],
            vec!["busybox.cpio".into()],
            false,
        );
        request.validate().unwrap();
        let config = render_config(&request, "initrd.cpio");

        assert!(config.contains("DOM0_KERNEL=Image_PREEMPT_RT\n"));
        assert!(config.contains("DOMU_KERNEL[0]=\"Image\"\nDOMU_RAMDISK[0]=\"busybox.cpio\"\n"));
        assert!(config.contains(
            "DOMU_KERNEL[1]=\"Image_PREEMPT_RT\"\nDOMU_RAMDISK[1]=\"initrd.cpio\"\n"
        ));
        assert!(config.ends_with("NUM_DOMUS=2\n"));
    }

    #[test]
    fn test_dom0_only_renders_zero_guests() {
        let request = HypervisorRequest {
            dom0: Some(KernelVariant::Vanilla),
            ..HypervisorRequest::default()
        };
        let config = render_config(&request.clone().or_default(), "initrd.cpio");
        assert!(!config.contains("DOMU_KERNEL"));
        assert!(config.ends_with("NUM_DOMUS=0\n"));
    }

    #[test]
    fn test_validation_rules() {
        let mixed = HypervisorRequest::from_guests(
            Some(KernelVariant::Vanilla),
            &[KernelVariant::Vanilla],
            &[KernelVariant::Vanilla],
            vec![],
            false,
        );
        assert!(matches!(mixed.validate(), Err(ProvisionError::InvalidRequest(_))));

        let too_many_ramdisks = HypervisorRequest::from_guests(
            Some(KernelVariant::Vanilla),
            &[KernelVariant::Vanilla],
            &[],
            vec!["a.cpio".into(), "b.cpio".into()],
            false,
        );
        assert!(too_many_ramdisks.validate().is_err());

        let no_dom0 = HypervisorRequest::from_guests(None, &[KernelVariant::Vanilla], &[], vec![], false)
            .or_default();
        assert!(no_dom0.validate().is_err());

        let escaping = HypervisorRequest::from_guests(
            Some(KernelVariant::Vanilla),
            &[KernelVariant::Vanilla],
            &[],
            vec!["../secret.cpio".into()],
            false,
        );
        assert!(escaping.validate().is_err());
    }

    #[test]
    fn test_kernels_are_deduplicated() {
        let request = HypervisorRequest::from_guests(
            Some(KernelVariant::Vanilla),
            &[],
            &[KernelVariant::Vanilla, KernelVariant::PreemptRt],
            vec![],
            false,
        );
        assert_eq!(
            request.kernels().into_iter().collect::<Vec<_>>(),
            vec!["Image", "Image_PREEMPT_RT"]
        );
    }

    #[test]
    fn test_configure_hypervisor_stages_generates_and_installs() {
        let ws = Workspace::new();
        seed_xen(&ws);
        let runner = ws.runner();
        let table = table(&runner);
        let mut provisioner = provisioner(&ws, &runner, &table);

        let installed = provisioner
            .configure_hypervisor(&HypervisorRequest::default())
            .unwrap();

        assert_eq!(
            names(&installed),
            vec!["BOOT.BIN", "Image", "initrd.cpio", "system.dtb", "xen", "xen.cfg"]
        );
        let bash = &runner.calls_to("bash")[0];
        assert!(bash[1].ends_with("imagebuilder/scripts/uboot-script-gen"));
        assert_eq!(&bash[2..], &["-c", "xen.cfg", "-d", ".", "-t", "load mmc 0:1"]);
        assert_eq!(runner.count("cp"), 6);
        assert_eq!(runner.count("umount"), 1);
        assert!(!ws.temp.path().join("scratch/hypervisor").exists());
    }

    #[test]
    fn test_debug_keeps_staging() {
        let ws = Workspace::new();
        seed_xen(&ws);
        let runner = ws.runner();
        let table = table(&runner);
        let mut provisioner = provisioner(&ws, &runner, &table);

        provisioner
            .configure_hypervisor(&HypervisorRequest {
                debug: true,
                ..HypervisorRequest::default()
            })
            .unwrap();

        let staging = ws.temp.path().join("scratch/hypervisor");
        let config = fs::read_to_string(staging.join("xen.cfg")).unwrap();
        assert!(config.contains("NUM_DOMUS=1"));
    }

    #[test]
    fn test_missing_xen_runs_nothing() {
        let ws = Workspace::new();
        seed_xen(&ws);
        fs::remove_file(ws.firmware.join("xen")).unwrap();
        let runner = ws.runner();
        let table = table(&runner);
        let mut provisioner = provisioner(&ws, &runner, &table);

        let err = provisioner
            .configure_hypervisor(&HypervisorRequest::default())
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ArtifactNotFound { .. }));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_generator_failure_skips_mount_and_cleans_up() {
        let ws = Workspace::new();
        seed_xen(&ws);
        let runner = ws.runner();
        runner.fail("bash", "uboot-script-gen: mkimage not found");
        let table = table(&runner);
        let mut provisioner = provisioner(&ws, &runner, &table);

        let err = provisioner
            .configure_hypervisor(&HypervisorRequest::default())
            .unwrap_err();
        assert!(err.to_string().contains("mkimage not found"));
        assert_eq!(runner.count("mount"), 0);
        assert!(!ws.temp.path().join("scratch/hypervisor").exists());
    }

    #[test]
    fn test_extra_ramdisk_is_staged() {
        let ws = Workspace::new();
        seed_xen(&ws);
        ws.touch("busybox.cpio");
        let runner = ws.runner();
        let table = table(&runner);
        let mut provisioner = provisioner(&ws, &runner, &table);

        let installed = provisioner
            .configure_hypervisor(&HypervisorRequest::from_guests(
                Some(KernelVariant::Vanilla),
                &[KernelVariant::PreemptRt],
                &[],
                vec!["busybox.cpio".into()],
                false,
            ))
            .unwrap();
        let names = names(&installed);
        assert!(names.contains(&"busybox.cpio".to_string()));
        assert!(names.contains(&"Image_PREEMPT_RT".to_string()));
    }
}
