//! Layout of a deployed board firmware directory.
//!
//! ```text
//! acceleration/firmware/select/
//!   BOARD                      board name on the first line (e.g. kv260)
//!   BOOT.BIN                   optional symlink overriding bootbin/
//!   sd_card.img                the raw image being provisioned
//!   kernel/Image               vanilla kernel
//!   kernel/Image_PREEMPT_RT    fully preemptible kernel
//!   boot_scripts/boot.scr.default
//!   device_tree/system.dtb.default, system.dtb.xen
//!   bootbin/BOOT.BIN.default, BOOT.BIN.xen
//!   xen, initrd.cpio, ramdisk.cpio.gz.u-boot
//!   imagebuilder/scripts/uboot-script-gen
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;

use crate::error::{ProvisionError, Result};

/// Board whose boot flow also loads a u-boot wrapped ramdisk from partition 1.
pub const RAMDISK_BOARD: &str = "kv260";

/// Which kernel build goes into the image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum KernelVariant {
    #[default]
    Vanilla,
    #[value(name = "preempt_rt")]
    PreemptRt,
}

impl KernelVariant {
    /// File name under `kernel/` in the firmware directory.
    pub fn image_name(self) -> &'static str {
        match self {
            KernelVariant::Vanilla => "Image",
            KernelVariant::PreemptRt => "Image_PREEMPT_RT",
        }
    }
}

impl fmt::Display for KernelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelVariant::Vanilla => f.write_str("vanilla"),
            KernelVariant::PreemptRt => f.write_str("preempt_rt"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareLayout {
    root: PathBuf,
    image_name: String,
}

impl FirmwareLayout {
    pub fn new(root: impl Into<PathBuf>, image_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            image_name: image_name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A file relative to the firmware root.
    pub fn file(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    pub fn raw_image(&self) -> PathBuf {
        self.root.join(&self.image_name)
    }

    pub fn kernel(&self, variant: KernelVariant) -> PathBuf {
        self.root.join("kernel").join(variant.image_name())
    }

    pub fn boot_script(&self) -> PathBuf {
        self.root.join("boot_scripts/boot.scr.default")
    }

    pub fn device_tree(&self) -> PathBuf {
        self.root.join("device_tree/system.dtb.default")
    }

    pub fn xen_device_tree(&self) -> PathBuf {
        self.root.join("device_tree/system.dtb.xen")
    }

    pub fn xen_boot_binary(&self) -> PathBuf {
        self.root.join("bootbin/BOOT.BIN.xen")
    }

    pub fn xen(&self) -> PathBuf {
        self.root.join("xen")
    }

    pub fn u_boot_ramdisk(&self) -> PathBuf {
        self.root.join("ramdisk.cpio.gz.u-boot")
    }

    pub fn boot_script_generator(&self) -> PathBuf {
        self.root.join("imagebuilder/scripts/uboot-script-gen")
    }

    /// BOOT.BIN to deploy: the root `BOOT.BIN` symlink when there is one,
    /// else `bootbin/BOOT.BIN.default`. A dangling symlink is an error rather
    /// than a silent fallback.
    pub fn boot_binary(&self) -> Result<PathBuf> {
        let link = self.root.join("BOOT.BIN");
        if link.is_symlink() {
            if !link.exists() {
                return Err(ProvisionError::ArtifactNotFound {
                    kind: "BOOT.BIN symlink target".to_string(),
                    path: link,
                });
            }
            return Ok(link);
        }
        Ok(self.root.join("bootbin/BOOT.BIN.default"))
    }

    /// Board name from the `BOARD` file, `None` when the file is absent.
    pub fn board(&self) -> Result<Option<String>> {
        let path = self.root.join("BOARD");
        if !path.is_file() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .map_err(|e| ProvisionError::io(format!("reading '{}'", path.display()), e))?;
        Ok(text
            .lines()
            .next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string))
    }

    pub fn needs_u_boot_ramdisk(&self) -> Result<bool> {
        Ok(self.board()?.as_deref() == Some(RAMDISK_BOARD))
    }
}

/// One deployed firmware under the firmware catalog directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareEntry {
    pub name: String,
    /// The selection symlink currently points here.
    pub selected: bool,
}

/// Deployed firmware directories next to the selection symlink.
///
/// ```text
/// acceleration/firmware/
///   kv260/
///   zcu102/
///   select -> kv260
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareCatalog {
    root: PathBuf,
    link: PathBuf,
}

impl FirmwareCatalog {
    /// Catalog whose selection symlink is `link` (the configured firmware
    /// directory); the candidates are its siblings.
    pub fn for_selection(link: impl Into<PathBuf>) -> Result<Self> {
        let link = link.into();
        let root = link
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .ok_or_else(|| {
                ProvisionError::InvalidRequest(format!(
                    "firmware directory '{}' has no parent to select from",
                    link.display()
                ))
            })?
            .to_path_buf();
        Ok(Self { root, link })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Name of the selected firmware, `None` when nothing is selected.
    pub fn selected(&self) -> Option<String> {
        let target = fs::read_link(&self.link).ok()?;
        target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    /// Every deployed firmware, sorted by name. The selection symlink itself
    /// is not a candidate.
    pub fn list(&self) -> Result<Vec<FirmwareEntry>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ProvisionError::io(
                    format!("listing '{}'", self.root.display()),
                    e,
                ))
            }
        };

        let link_name = self.link.file_name();
        let selected = self.selected();
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                ProvisionError::io(format!("listing '{}'", self.root.display()), e)
            })?;
            if Some(entry.file_name().as_os_str()) == link_name || !entry.path().is_dir() {
                continue;
            }
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        Ok(names
            .into_iter()
            .map(|name| FirmwareEntry {
                selected: selected.as_deref() == Some(name.as_str()),
                name,
            })
            .collect())
    }

    /// Point the selection symlink at firmware `name`.
    ///
    /// The candidate is checked before the previous selection is removed,
    /// and a real directory in place of the symlink is never deleted.
    pub fn select(&self, name: &str) -> Result<PathBuf> {
        let available = self.list()?;
        if !available.iter().any(|entry| entry.name == name) {
            let names: Vec<_> = available.iter().map(|entry| entry.name.as_str()).collect();
            return Err(ProvisionError::InvalidRequest(format!(
                "'{}' not found among deployed firmware [{}]",
                name,
                names.join(", ")
            )));
        }

        if self.link.is_symlink() {
            fs::remove_file(&self.link).map_err(|e| {
                ProvisionError::io(format!("unlinking '{}'", self.link.display()), e)
            })?;
        } else if self.link.exists() {
            return Err(ProvisionError::InvalidRequest(format!(
                "'{}' is not a symlink, refusing to replace it",
                self.link.display()
            )));
        }

        let target = self.root.join(name);
        std::os::unix::fs::symlink(&target, &self.link).map_err(|e| {
            ProvisionError::io(
                format!("linking '{}' to '{}'", self.link.display(), target.display()),
                e,
            )
        })?;
        tracing::info!(firmware = name, link = %self.link.display(), "firmware selected");
        println!("  Selected firmware {}", name);
        Ok(target)
    }
}
