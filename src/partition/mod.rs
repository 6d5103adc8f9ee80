//! Partition geometry of raw disk images.
//!
//! Geometry is derived from the image on every invocation and never cached:
//! a stale offset would mount the wrong bytes. The text scraping lives in
//! [`fdisk`] behind the [`PartitionTableReader`] trait so callers never see
//! how the table was read.

pub mod fdisk;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::error::{ProvisionError, Result};
use crate::process::{Cmd, CommandRunner};

/// Partition holding kernel, device tree, BOOT.BIN and boot script.
pub const BOOT_PARTITION: u32 = 1;

/// Partition holding the root filesystem.
pub const ROOTFS_PARTITION: u32 = 2;

/// A raw disk image known to exist on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    path: PathBuf,
}

impl RawImage {
    /// Fails with [`ProvisionError::ImageNotFound`] unless `path` names an
    /// existing file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() || !path.is_file() {
            return Err(ProvisionError::ImageNotFound(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name as fdisk prints it in device names.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Sector unit size and per-partition start sectors of one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionGeometry {
    image: PathBuf,
    unit_bytes: u64,
    start_sectors: BTreeMap<u32, u64>,
    bootable: BTreeSet<u32>,
}

impl PartitionGeometry {
    pub fn new(
        image: &Path,
        unit_bytes: u64,
        start_sectors: BTreeMap<u32, u64>,
        bootable: BTreeSet<u32>,
    ) -> Result<Self> {
        if unit_bytes == 0 {
            return Err(ProvisionError::GeometryUnavailable {
                image: image.to_path_buf(),
                reason: "unit size is zero".to_string(),
            });
        }
        Ok(Self {
            image: image.to_path_buf(),
            unit_bytes,
            start_sectors,
            bootable,
        })
    }

    pub fn unit_bytes(&self) -> u64 {
        self.unit_bytes
    }

    pub fn partitions(&self) -> impl Iterator<Item = u32> + '_ {
        self.start_sectors.keys().copied()
    }

    pub fn is_bootable(&self, partition: u32) -> bool {
        self.bootable.contains(&partition)
    }

    pub fn start_sector(&self, partition: u32) -> Result<u64> {
        self.start_sectors
            .get(&partition)
            .copied()
            .ok_or_else(|| ProvisionError::GeometryUnavailable {
                image: self.image.clone(),
                reason: format!("partition {} not present in partition table", partition),
            })
    }

    /// Byte offset of `partition` inside the image: `unit_bytes * start_sector`.
    pub fn offset_bytes(&self, partition: u32) -> Result<u64> {
        let start = self.start_sector(partition)?;
        self.unit_bytes
            .checked_mul(start)
            .ok_or_else(|| ProvisionError::GeometryUnavailable {
                image: self.image.clone(),
                reason: format!(
                    "offset of partition {} overflows ({} * {})",
                    partition, self.unit_bytes, start
                ),
            })
    }
}

/// Source of partition geometry for a raw image.
pub trait PartitionTableReader {
    fn read_geometry(&self, image: &RawImage) -> Result<PartitionGeometry>;
}

/// Reads geometry by running `fdisk -l` against the image. Needs no root.
pub struct FdiskTable<'a> {
    runner: &'a dyn CommandRunner,
    timeout: Duration,
}

impl<'a> FdiskTable<'a> {
    pub fn new(runner: &'a dyn CommandRunner, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

impl PartitionTableReader for FdiskTable<'_> {
    fn read_geometry(&self, image: &RawImage) -> Result<PartitionGeometry> {
        let output = Cmd::new("fdisk")
            .arg("-l")
            .arg_path(image.path())
            .timeout(self.timeout)
            .error_msg("fdisk could not read the partition table")
            .run(self.runner)?;

        let (units, start_sectors, bootable) = fdisk::parse_listing(&output.stdout, &image.file_name())
            .map_err(|reason| ProvisionError::GeometryUnavailable {
                image: image.path().to_path_buf(),
                reason,
            })?;

        tracing::debug!(
            image = %image.path().display(),
            unit_bytes = units,
            partitions = start_sectors.len(),
            "read partition geometry"
        );
        PartitionGeometry::new(image.path(), units, start_sectors, bootable)
    }
}

#[cfg(test)]
mod tests {
    use super::fdisk::fixtures;
    use super::*;
    use crate::process::testing::RecordingRunner;
    use std::fs;
    use tempfile::TempDir;

    fn image_in(temp: &TempDir) -> RawImage {
        let path = temp.path().join("sd_card.img");
        fs::write(&path, b"").unwrap();
        RawImage::open(&path).unwrap()
    }

    fn geometry(unit_bytes: u64, starts: &[(u32, u64)]) -> PartitionGeometry {
        PartitionGeometry::new(
            Path::new("sd_card.img"),
            unit_bytes,
            starts.iter().copied().collect(),
            BTreeSet::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_offset_bytes_table() {
        let cases: &[(u64, u64, u64)] = &[
            (512, 2048, 1_048_576),
            (512, 1_148_928, 588_251_136),
            (4096, 256, 1_048_576),
            (4096, 143_616, 588_251_136),
            (1, 0, 0),
            (512, 8_589_934_592, 4_398_046_511_104),
        ];
        for &(unit, start, expected) in cases {
            let geo = geometry(unit, &[(1, start)]);
            assert_eq!(
                geo.offset_bytes(1).unwrap(),
                expected,
                "{} * {}",
                unit,
                start
            );
        }
    }

    #[test]
    fn test_offset_overflow_is_unavailable() {
        let geo = geometry(u64::MAX, &[(1, 2)]);
        assert!(matches!(
            geo.offset_bytes(1),
            Err(ProvisionError::GeometryUnavailable { .. })
        ));
    }

    #[test]
    fn test_missing_partition_is_unavailable() {
        let geo = geometry(512, &[(1, 2048)]);
        let err = geo.offset_bytes(3).unwrap_err();
        assert!(err.to_string().contains("partition 3"));
    }

    #[test]
    fn test_zero_units_rejected() {
        let result = PartitionGeometry::new(
            Path::new("x.img"),
            0,
            BTreeMap::new(),
            BTreeSet::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_raw_image_must_exist() {
        assert!(matches!(
            RawImage::open(""),
            Err(ProvisionError::ImageNotFound(_))
        ));
        assert!(matches!(
            RawImage::open("/nonexistent/sd_card.img"),
            Err(ProvisionError::ImageNotFound(_))
        ));
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            RawImage::open(temp.path()),
            Err(ProvisionError::ImageNotFound(_))
        ));
    }

    #[test]
    fn test_fdisk_table_reads_english_listing() {
        let temp = TempDir::new().unwrap();
        let image = image_in(&temp);
        let runner = RecordingRunner::new();
        runner.respond("fdisk", fixtures::ENGLISH);

        let table = FdiskTable::new(&runner, Duration::from_secs(1));
        let geo = table.read_geometry(&image).unwrap();

        assert_eq!(geo.unit_bytes(), 512);
        assert_eq!(geo.start_sector(1).unwrap(), 2048);
        assert_eq!(geo.start_sector(2).unwrap(), 1_148_928);
        assert!(geo.is_bootable(1));
        assert!(!geo.is_bootable(2));
        assert_eq!(geo.partitions().collect::<Vec<_>>(), vec![1, 2]);

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], "fdisk");
        assert_eq!(calls[0][1], "-l");
    }

    #[test]
    fn test_fdisk_table_locales_agree() {
        let temp = TempDir::new().unwrap();
        let image = image_in(&temp);

        let english = RecordingRunner::new();
        english.respond("fdisk", fixtures::ENGLISH);
        let spanish = RecordingRunner::new();
        spanish.respond("fdisk", fixtures::SPANISH);

        let a = FdiskTable::new(&english, Duration::from_secs(1))
            .read_geometry(&image)
            .unwrap();
        let b = FdiskTable::new(&spanish, Duration::from_secs(1))
            .read_geometry(&image)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_fdisk_garbage_is_geometry_unavailable() {
        let temp = TempDir::new().unwrap();
        let image = image_in(&temp);
        let runner = RecordingRunner::new();
        runner.respond("fdisk", "fdisk: cannot open sd_card.img\n");

        let err = FdiskTable::new(&runner, Duration::from_secs(1))
            .read_geometry(&image)
            .unwrap_err();
        assert!(matches!(err, ProvisionError::GeometryUnavailable { .. }));
    }

    #[test]
    fn test_fdisk_failure_is_tool_failure() {
        let temp = TempDir::new().unwrap();
        let image = image_in(&temp);
        let runner = RecordingRunner::new();
        runner.fail("fdisk", "fdisk: cannot open sd_card.img: Permission denied");

        let err = FdiskTable::new(&runner, Duration::from_secs(1))
            .read_geometry(&image)
            .unwrap_err();
        match err {
            ProvisionError::ExternalToolFailed { stderr, .. } => {
                assert!(stderr.contains("Permission denied"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
