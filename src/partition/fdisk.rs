//! Parser for `fdisk -l` table output.
//!
//! fdisk output is localized and meant for humans, so parsing is anchored on
//! as little as possible:
//!
//! ```text
//! Units: sectors of 1 * 512 = 512 bytes
//! ...
//! Device       Boot   Start     End Sectors  Size Id Type
//! sd_card.img1 *       2048 1148927 1146880  560M  c W95 FAT32 (LBA)
//! sd_card.img2      1148928 6703103 5554176  2.7G 83 Linux
//! ```
//!
//! The unit size is read after the last `=` of the units line, whatever the
//! language. Partition rows are recognised by a device name ending in the
//! image file name plus the partition index. The `Boot` column is only
//! populated for bootable partitions, so the start sector shifts one column
//! to the right when the `*` marker is present.

use std::collections::{BTreeMap, BTreeSet};

/// Leading tokens of the units line across the locales fdisk ships with.
pub const UNITS_TOKENS: &[&str] = &["Units", "Unidades", "Unités", "Einheiten", "Unità"];

/// Boot flag as printed in the `Boot` column.
const BOOT_MARKER: &str = "*";

/// A parsed partition-table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRow {
    pub number: u32,
    pub bootable: bool,
    pub start_sector: u64,
}

/// Extract the sector unit size in bytes.
pub fn parse_units(output: &str) -> Result<u64, String> {
    let line = output
        .lines()
        .map(str::trim_start)
        .find(|line| UNITS_TOKENS.iter().any(|token| line.starts_with(token)))
        .ok_or_else(|| "no units line in fdisk output".to_string())?;

    let value = line
        .rsplit_once('=')
        .and_then(|(_, rhs)| rhs.split_whitespace().next())
        .ok_or_else(|| format!("units line has no '= <bytes>' value: '{}'", line.trim()))?;

    let units: u64 = value
        .parse()
        .map_err(|_| format!("unit size '{}' is not an integer", value))?;
    if units == 0 {
        return Err("unit size is zero".to_string());
    }
    Ok(units)
}

/// Partition number of a device name such as `sd_card.img2`, if the device
/// belongs to `image_name`.
fn device_partition(device: &str, image_name: &str) -> Option<u32> {
    let pos = device.rfind(image_name)?;
    let head = &device[..pos];
    if !(head.is_empty() || head.ends_with('/')) {
        return None;
    }
    let index = &device[pos + image_name.len()..];
    if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    index.parse().ok()
}

/// Extract every partition row belonging to `image_name`.
pub fn parse_rows(output: &str, image_name: &str) -> Result<Vec<PartitionRow>, String> {
    let mut rows = Vec::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(number) = fields
            .first()
            .and_then(|device| device_partition(device, image_name))
        else {
            continue;
        };

        let bootable = fields.get(1) == Some(&BOOT_MARKER);
        let column = if bootable { 2 } else { 1 };
        let raw = fields.get(column).copied().unwrap_or("");
        let start_sector = raw.parse().map_err(|_| {
            format!(
                "start sector '{}' of partition {} is not an integer",
                raw, number
            )
        })?;

        rows.push(PartitionRow {
            number,
            bootable,
            start_sector,
        });
    }

    Ok(rows)
}

/// Parse a full fdisk listing into unit size, start sectors and boot flags.
pub fn parse_listing(
    output: &str,
    image_name: &str,
) -> Result<(u64, BTreeMap<u32, u64>, BTreeSet<u32>), String> {
    let units = parse_units(output)?;
    let rows = parse_rows(output, image_name)?;
    if rows.is_empty() {
        return Err(format!("no partition rows for '{}' in fdisk output", image_name));
    }

    let start_sectors = rows.iter().map(|r| (r.number, r.start_sector)).collect();
    let bootable = rows.iter().filter(|r| r.bootable).map(|r| r.number).collect();
    Ok((units, start_sectors, bootable))
}
