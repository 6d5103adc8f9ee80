//! Loop mounts of raw image partitions.
//!
//! Partition `n` is always mounted at `<mount_prefix><n>`
//! (`/tmp/sdcard_img_p2` by default). The [`MountManager`] keeps a registry of
//! the mounts it made in this process, which is what guards against mounting
//! the same partition twice.

pub mod recovery;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ProvisionError, Result};
use crate::partition::{PartitionGeometry, PartitionTableReader, RawImage};
use crate::process::{Cmd, CommandRunner};

pub use recovery::force_cleanup;

/// Access mode of a loop mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MountMode {
    #[default]
    ReadWrite,
    ReadOnly,
}

impl MountMode {
    fn options(self, offset_bytes: u64) -> String {
        match self {
            MountMode::ReadWrite => format!("loop,offset={}", offset_bytes),
            MountMode::ReadOnly => format!("loop,ro,offset={}", offset_bytes),
        }
    }
}

/// A live loop mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHandle {
    pub partition: u32,
    pub mountpoint: PathBuf,
    pub image: RawImage,
    pub offset_bytes: u64,
    pub mode: MountMode,
}

/// Knobs of the mount manager, normally taken from the configuration file.
#[derive(Debug, Clone)]
pub struct MountSettings {
    pub mount_prefix: String,
    pub sudo: bool,
    pub mount_timeout: Duration,
    pub unmount_timeout: Duration,
    /// Partitions released by `unmount(None)`, in order.
    pub default_unmount: Vec<u32>,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            mount_prefix: "/tmp/sdcard_img_p".to_string(),
            sudo: true,
            mount_timeout: Duration::from_secs(15),
            unmount_timeout: Duration::from_secs(15),
            default_unmount: vec![1, 2],
        }
    }
}

pub struct MountManager<'a> {
    runner: &'a dyn CommandRunner,
    table: &'a dyn PartitionTableReader,
    settings: MountSettings,
    open: BTreeMap<u32, MountHandle>,
}

impl<'a> MountManager<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        table: &'a dyn PartitionTableReader,
        settings: MountSettings,
    ) -> Self {
        Self {
            runner,
            table,
            settings,
            open: BTreeMap::new(),
        }
    }

    pub fn settings(&self) -> &MountSettings {
        &self.settings
    }

    pub fn mountpoint(&self, partition: u32) -> PathBuf {
        PathBuf::from(format!("{}{}", self.settings.mount_prefix, partition))
    }

    pub fn is_mounted(&self, partition: u32) -> bool {
        self.open.contains_key(&partition)
    }

    pub fn handle(&self, partition: u32) -> Option<&MountHandle> {
        self.open.get(&partition)
    }

    pub fn mounted_partitions(&self) -> Vec<u32> {
        self.open.keys().copied().collect()
    }

    /// Fails with [`ProvisionError::AlreadyMounted`] if this manager holds a
    /// mount of `partition`.
    pub fn ensure_not_mounted(&self, partition: u32) -> Result<()> {
        match self.open.get(&partition) {
            Some(handle) => Err(ProvisionError::AlreadyMounted {
                partition,
                mountpoint: handle.mountpoint.clone(),
            }),
            None => Ok(()),
        }
    }

    pub fn read_geometry(&self, image: &RawImage) -> Result<PartitionGeometry> {
        self.table.read_geometry(image)
    }

    /// Read the partition table and mount `partition` read-write.
    pub fn mount(&mut self, image: &RawImage, partition: u32) -> Result<MountHandle> {
        self.ensure_not_mounted(partition)?;
        let geometry = self.table.read_geometry(image)?;
        self.mount_with_geometry(image, partition, &geometry, MountMode::ReadWrite)
    }

    /// Mount `partition` using geometry the caller already resolved.
    pub fn mount_with_geometry(
        &mut self,
        image: &RawImage,
        partition: u32,
        geometry: &PartitionGeometry,
        mode: MountMode,
    ) -> Result<MountHandle> {
        self.ensure_not_mounted(partition)?;
        let offset_bytes = geometry.offset_bytes(partition)?;
        let mountpoint = self.mountpoint(partition);

        fs::create_dir_all(&mountpoint).map_err(|e| {
            ProvisionError::io(
                format!("creating mountpoint '{}'", mountpoint.display()),
                e,
            )
        })?;

        Cmd::privileged("mount", self.settings.sudo)
            .arg("-o")
            .arg(mode.options(offset_bytes))
            .arg_path(image.path())
            .arg_path(&mountpoint)
            .timeout(self.settings.mount_timeout)
            .run(self.runner)
            .map_err(|e| ProvisionError::MountFailed {
                partition,
                mountpoint: mountpoint.clone(),
                detail: e.tool_detail(),
            })?;

        let handle = MountHandle {
            partition,
            mountpoint,
            image: image.clone(),
            offset_bytes,
            mode,
        };
        tracing::info!(
            partition,
            offset_bytes,
            mountpoint = %handle.mountpoint.display(),
            "mounted"
        );
        println!(
            "  Mounted partition {} at {}",
            partition,
            handle.mountpoint.display()
        );
        self.open.insert(partition, handle.clone());
        Ok(handle)
    }

    /// Flush and unmount `partition`, or every default partition when `None`.
    ///
    /// Works without a registry entry, so mounts left behind by an earlier
    /// run can be released too. The bulk form attempts every default
    /// partition, counts one that is not mounted as released, and reports
    /// all remaining failures together.
    pub fn unmount(&mut self, partition: Option<u32>) -> Result<()> {
        match partition {
            Some(p) => {
                self.sync(&[p])?;
                self.umount_one(p)
            }
            None => self.unmount_defaults(),
        }
    }

    fn unmount_defaults(&mut self) -> Result<()> {
        let partitions = self.settings.default_unmount.clone();
        self.sync(&partitions)?;

        let mut failures: Vec<(PathBuf, String)> = Vec::new();
        for p in partitions {
            match self.umount_one(p) {
                Ok(()) => {}
                Err(ProvisionError::UnmountFailed { mountpoint, detail })
                    if is_not_mounted(&detail) =>
                {
                    self.open.remove(&p);
                    tracing::debug!(partition = p, mountpoint = %mountpoint.display(), "not mounted");
                }
                Err(ProvisionError::UnmountFailed { mountpoint, detail }) => {
                    failures.push((mountpoint, detail));
                }
                Err(e) => failures.push((self.mountpoint(p), e.to_string())),
            }
        }

        let mut failures = failures.into_iter();
        match failures.next() {
            None => Ok(()),
            Some((mountpoint, first)) => {
                let detail = std::iter::once(first)
                    .chain(failures.map(|(mp, detail)| format!("{}: {}", mp.display(), detail)))
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(ProvisionError::UnmountFailed { mountpoint, detail })
            }
        }
    }

    fn sync(&self, partitions: &[u32]) -> Result<()> {
        Cmd::new("sync")
            .timeout(self.settings.unmount_timeout)
            .run(self.runner)
            .map(|_| ())
            .map_err(|e| ProvisionError::UnmountFailed {
                mountpoint: partitions
                    .first()
                    .map(|p| self.mountpoint(*p))
                    .unwrap_or_default(),
                detail: format!("sync failed: {}", e.tool_detail()),
            })
    }

    fn umount_one(&mut self, partition: u32) -> Result<()> {
        let mountpoint = self.mountpoint(partition);
        Cmd::privileged("umount", self.settings.sudo)
            .arg_path(&mountpoint)
            .timeout(self.settings.unmount_timeout)
            .run(self.runner)
            .map_err(|e| ProvisionError::UnmountFailed {
                mountpoint: mountpoint.clone(),
                detail: e.tool_detail(),
            })?;

        self.open.remove(&partition);
        tracing::info!(partition, mountpoint = %mountpoint.display(), "unmounted");
        println!("  Unmounted {}", mountpoint.display());
        Ok(())
    }

    /// Release stale device-mapper and loop devices. See [`force_cleanup`].
    pub fn force_cleanup(&self) -> Result<PathBuf> {
        recovery::force_cleanup(self.runner, self.settings.sudo, self.settings.unmount_timeout)
    }
}

/// `umount` refusing because nothing is mounted at the target.
fn is_not_mounted(detail: &str) -> bool {
    detail.contains("not mounted")
}
