//! Provisioning configuration.
//!
//! Looked up in this order, first hit wins:
//! 1. an explicit `--config <file>` (must exist)
//! 2. `<workspace>/sdimage.toml`
//! 3. `$XDG_CONFIG_HOME/sdimage/config.toml`
//! 4. built-in defaults
//!
//! `SDIMAGE_FIRMWARE_DIR` and `ROS_DISTRO` override the file afterwards.
//!
//! ```toml
//! firmware_dir = "acceleration/firmware/select"
//! image = "sd_card.img"
//! default_unmount_partitions = [1, 2]
//!
//! [timeouts]
//! archive_secs = 600
//!
//! [overlay]
//! distro = "humble"
//! extra_rootfs_files = [
//!     { source = "lib/libstdc++fs.a", destination = "usr/lib/libstdc++fs.a" },
//! ]
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILENAME: &str = "sdimage.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProvisionConfig {
    /// Deployed firmware directory. Relative paths resolve against the workspace.
    pub firmware_dir: PathBuf,
    /// Raw image file name inside the firmware directory.
    pub image: String,
    /// Mountpoints are this prefix followed by the partition number.
    pub mount_prefix: String,
    /// Where staging directories for generated artifacts are created.
    pub scratch_dir: PathBuf,
    pub sudo: bool,
    /// Partitions released by an unmount that names no partition.
    pub default_unmount_partitions: Vec<u32>,
    pub timeouts: Timeouts,
    pub overlay: OverlayConfig,
    pub hypervisor: HypervisorConfig,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            firmware_dir: PathBuf::from("acceleration/firmware/select"),
            image: "sd_card.img".to_string(),
            mount_prefix: "/tmp/sdcard_img_p".to_string(),
            scratch_dir: std::env::temp_dir(),
            sudo: true,
            default_unmount_partitions: vec![1, 2],
            timeouts: Timeouts::default(),
            overlay: OverlayConfig::default(),
            hypervisor: HypervisorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Timeouts {
    pub query_secs: u64,
    pub mount_secs: u64,
    pub unmount_secs: u64,
    pub copy_secs: u64,
    pub generator_secs: u64,
    pub archive_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            query_secs: 5,
            mount_secs: 15,
            unmount_secs: 15,
            copy_secs: 60,
            generator_secs: 30,
            archive_secs: 300,
        }
    }
}

impl Timeouts {
    pub fn query(&self) -> Duration {
        Duration::from_secs(self.query_secs)
    }

    pub fn mount(&self) -> Duration {
        Duration::from_secs(self.mount_secs)
    }

    pub fn unmount(&self) -> Duration {
        Duration::from_secs(self.unmount_secs)
    }

    pub fn copy(&self) -> Duration {
        Duration::from_secs(self.copy_secs)
    }

    pub fn generator(&self) -> Duration {
        Duration::from_secs(self.generator_secs)
    }

    pub fn archive(&self) -> Duration {
        Duration::from_secs(self.archive_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OverlayConfig {
    /// Distribution prefix, e.g. `ros` for `/opt/ros/<distro>/setup.bash`.
    pub prefix: String,
    /// Distribution release. Falls back to `ROS_DISTRO`.
    pub distro: Option<String>,
    /// Workspace install tree deployed when none is given on the command line.
    pub install_dir: String,
    /// Directory name of the overlay inside the rootfs. Defaults to the
    /// workspace directory name.
    pub workspace_name: Option<String>,
    /// Also install `/etc/profile.d/<prefix>/setup.sh`.
    pub profile_hook: bool,
    /// Firmware files copied into the rootfs with every overlay deployment.
    pub extra_rootfs_files: Vec<ExtraFile>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            prefix: "ros".to_string(),
            distro: None,
            install_dir: "install".to_string(),
            workspace_name: None,
            profile_hook: false,
            extra_rootfs_files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtraFile {
    /// Relative to the firmware directory.
    pub source: String,
    /// Relative to the rootfs partition root.
    pub destination: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HypervisorConfig {
    /// U-Boot load command passed to the boot-script generator.
    pub boot_target: String,
    /// Ramdisk given to guests that were not assigned one.
    pub default_ramdisk: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            boot_target: "load mmc 0:1".to_string(),
            default_ramdisk: "initrd.cpio".to_string(),
        }
    }
}

impl ProvisionConfig {
    /// Load configuration for the workspace at `workspace_root`.
    pub fn load(explicit: Option<&Path>, workspace_root: &Path) -> Result<Self> {
        let path = match explicit {
            Some(path) => {
                if !path.is_file() {
                    bail!("config file '{}' does not exist", path.display());
                }
                Some(path.to_path_buf())
            }
            None => default_config_path(workspace_root),
        };

        let mut config = match &path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.resolve_paths(workspace_root);
        config.validate().with_context(|| match &path {
            Some(path) => format!("validating config '{}'", path.display()),
            None => "validating default config".to_string(),
        })?;

        tracing::debug!(
            source = %path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "defaults".into()),
            firmware_dir = %config.firmware_dir.display(),
            "loaded configuration"
        );
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config '{}'", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("SDIMAGE_FIRMWARE_DIR").filter(|v| !v.trim().is_empty()) {
            self.firmware_dir = PathBuf::from(dir);
        }
        if self.overlay.distro.is_none() {
            self.overlay.distro = lookup("ROS_DISTRO").filter(|v| !v.trim().is_empty());
        }
    }

    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        self.firmware_dir = resolve_workspace_path(workspace_root, &self.firmware_dir);
        self.scratch_dir = resolve_workspace_path(workspace_root, &self.scratch_dir);
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            bail!("'image' must name the raw image file");
        }
        if !Path::new(&self.mount_prefix).is_absolute() {
            bail!(
                "'mount_prefix' must be an absolute path, got '{}'",
                self.mount_prefix
            );
        }
        if self.default_unmount_partitions.is_empty() {
            bail!("'default_unmount_partitions' must list at least one partition");
        }
        if self.default_unmount_partitions.contains(&0) {
            bail!("partition numbers start at 1");
        }
        if self.overlay.prefix.trim().is_empty() || self.overlay.prefix.contains('/') {
            bail!("'overlay.prefix' must be a single path component");
        }
        Ok(())
    }

    /// Whether privileged commands should go through `sudo`.
    pub fn use_sudo(&self) -> bool {
        self.sudo && !running_as_root()
    }

    pub fn image_path(&self) -> PathBuf {
        self.firmware_dir.join(&self.image)
    }

    /// Overlay directory name inside the rootfs.
    pub fn workspace_name(&self, workspace_root: &Path) -> Option<String> {
        self.overlay.workspace_name.clone().or_else(|| {
            workspace_root
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
    }
}

fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

fn default_config_path(workspace_root: &Path) -> Option<PathBuf> {
    let local = workspace_root.join(CONFIG_FILENAME);
    if local.is_file() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("sdimage").join("config.toml"))
        .filter(|path| path.is_file())
}

pub(crate) fn resolve_workspace_path(workspace_root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_root.join(path)
    }
}
