//! Preflight checks for image provisioning.
//!
//! Each command validates that the host tools it drives are installed before
//! touching the image.
//!
//! # Example
//!
//! ```rust
//! use sdimage::preflight::{check_required_tools, command_exists, MOUNT_TOOLS};
//!
//! if !command_exists("fdisk") {
//!     println!("util-linux not installed");
//! }
//!
//! if let Err(e) = check_required_tools(MOUNT_TOOLS) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools for reading partition tables. Each tuple is (command, package).
pub const GEOMETRY_TOOLS: &[(&str, &str)] = &[("fdisk", "fdisk")];

/// Tools for loop mounting and releasing partitions.
pub const MOUNT_TOOLS: &[(&str, &str)] = &[
    ("fdisk", "fdisk"),
    ("mount", "mount"),
    ("umount", "mount"),
    ("sync", "coreutils"),
];

/// Tools for tearing down stale device-mapper and loop devices.
pub const RECOVERY_TOOLS: &[(&str, &str)] = &[
    ("kpartx", "kpartx"),
    ("dmsetup", "dmsetup"),
    ("losetup", "mount"),
];

/// Tools for copying artifacts into a mounted partition.
pub const DEPLOY_TOOLS: &[(&str, &str)] = &[
    ("cp", "coreutils"),
    ("rm", "coreutils"),
    ("mkdir", "coreutils"),
    ("chmod", "coreutils"),
];

/// Tools for packing a partition into a compressed cpio ramdisk.
pub const RAMDISK_TOOLS: &[(&str, &str)] = &[
    ("bash", "bash"),
    ("find", "findutils"),
    ("cpio", "cpio"),
    ("gzip", "gzip"),
];

/// Tools the imagebuilder boot-script generator depends on.
pub const HYPERVISOR_TOOLS: &[(&str, &str)] = &[
    ("bash", "bash"),
    ("mkimage", "u-boot-tools"),
];

/// Check that specific tools are available.
///
/// Fails with the list of missing tools and the packages providing them.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check several tool sets at once, reporting every missing tool together.
pub fn check_tool_sets(sets: &[&[(&str, &str)]], sudo: bool) -> Result<()> {
    let mut tools: Vec<(&str, &str)> = Vec::new();
    if sudo {
        tools.push(("sudo", "sudo"));
    }
    for set in sets {
        for tool in set.iter() {
            if !tools.iter().any(|(name, _)| *name == tool.0) {
                tools.push(*tool);
            }
        }
    }
    check_required_tools(&tools)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_success() {
        let tools = &[("sh", "dash"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_lists_every_missing_tool() {
        let tools = &[
            ("nonexistent_command_xyz", "fake-package"),
            ("cat", "coreutils"),
            ("nonexistent_command_abc", "other-package"),
        ];
        let err = check_required_tools(tools).unwrap_err().to_string();
        assert!(err.contains("nonexistent_command_xyz (install: fake-package)"));
        assert!(err.contains("nonexistent_command_abc (install: other-package)"));
        assert!(!err.contains("cat"));
    }

    #[test]
    fn test_check_tool_sets_deduplicates() {
        let a: &[(&str, &str)] = &[("missing_tool_one", "pkg-a")];
        let b: &[(&str, &str)] = &[("missing_tool_one", "pkg-a"), ("cat", "coreutils")];
        let err = check_tool_sets(&[a, b], false).unwrap_err().to_string();
        assert_eq!(err.matches("missing_tool_one").count(), 1);
    }
}
