//! Recovery from loop devices and device-mapper entries left behind by an
//! interrupted mount.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ProvisionError, Result};
use crate::process::{Cmd, CommandRunner};

/// Device-mapper name used by kpartx-based image tooling.
pub const MAPPER_NAME: &str = "diskimage";

/// Parse `/dev/loopN` as printed by `losetup -f`.
fn loop_index(output: &str) -> Option<u32> {
    output.trim().strip_prefix("/dev/loop")?.parse().ok()
}

/// Tear down the `diskimage` mapping and release the most recently attached
/// loop device, i.e. the one just below the first free device.
///
/// Returns the path of the released device.
pub fn force_cleanup(
    runner: &dyn CommandRunner,
    sudo: bool,
    timeout: Duration,
) -> Result<PathBuf> {
    let mapper = format!("/dev/mapper/{}", MAPPER_NAME);
    let teardown = [
        Cmd::privileged("kpartx", sudo).args(["-d", mapper.as_str()]),
        Cmd::privileged("dmsetup", sudo).args(["remove", MAPPER_NAME]),
    ];
    for cmd in teardown {
        let cmd = cmd.timeout(timeout).allow_fail();
        match cmd.run(runner) {
            Ok(out) if out.success() => {}
            Ok(out) => tracing::warn!(
                command = %cmd.command_line(),
                status = %out.status_text(),
                stderr = %out.stderr.trim(),
                "ignoring failed teardown step"
            ),
            Err(e) => tracing::warn!(command = %cmd.command_line(), error = %e, "ignoring failed teardown step"),
        }
    }

    let probe = Cmd::privileged("losetup", sudo).arg("-f").timeout(timeout);
    let output = probe.run(runner)?;
    let free = loop_index(&output.stdout).ok_or_else(|| ProvisionError::ExternalToolFailed {
        command: probe.command_line(),
        status: output.status_text(),
        stderr: format!("unexpected losetup output '{}'", output.stdout.trim()),
    })?;
    if free == 0 {
        return Err(ProvisionError::ExternalToolFailed {
            command: probe.command_line(),
            status: output.status_text(),
            stderr: "first free device is /dev/loop0, no loop device to release".to_string(),
        });
    }

    let device = PathBuf::from(format!("/dev/loop{}", free - 1));
    Cmd::privileged("losetup", sudo)
        .arg("-d")
        .arg_path(&device)
        .timeout(timeout)
        .run(runner)?;

    tracing::info!(device = %device.display(), "released loop device");
    println!("  Released {}", device.display());
    Ok(device)
}
