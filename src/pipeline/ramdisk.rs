//! Ramdisk extraction: the rootfs partition archived as a gzip'd newc cpio.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{ProvisionError, Result};
use crate::mount::MountMode;
use crate::partition::ROOTFS_PARTITION;
use crate::process::{shell, shell_quote};

use super::Provisioner;

pub const RAMDISK_SUFFIX: &str = ".cpio.gz";

const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RamdiskRequest {
    /// File name of the archive, created in the firmware directory.
    pub out_file: String,
}

impl RamdiskRequest {
    pub fn new(out_file: impl Into<String>) -> Result<Self> {
        let out_file = out_file.into();
        if !out_file.ends_with(RAMDISK_SUFFIX) || out_file.len() == RAMDISK_SUFFIX.len() {
            return Err(ProvisionError::InvalidRequest(format!(
                "ramdisk name '{}' must end in {}",
                out_file, RAMDISK_SUFFIX
            )));
        }
        if out_file.contains('/') {
            return Err(ProvisionError::InvalidRequest(format!(
                "ramdisk name '{}' must be a file name, it is written to the firmware directory",
                out_file
            )));
        }
        Ok(Self { out_file })
    }
}

/// `find | cpio | gzip` pipeline archiving everything under `root` into `out`.
pub(crate) fn archive_script(root: &str, out: &str, sudo: bool) -> String {
    let sudo = if sudo { "sudo " } else { "" };
    format!(
        "cd {root} && {sudo}find . -print0 | {sudo}cpio --null -o -H newc --quiet | gzip -9 > {out}",
        root = shell_quote(root),
        out = shell_quote(out),
    )
}

/// Archive path while the pipeline is still writing.
pub(crate) fn partial_path(out: &Path) -> PathBuf {
    let mut name = out.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

impl Provisioner<'_> {
    /// Mount the rootfs read-only and pack it into `<firmware>/<out_file>`.
    ///
    /// The archive only appears under its final name once the whole pipeline
    /// succeeded; an existing archive of the same name survives a failure.
    pub fn extract_ramdisk(&mut self, request: &RamdiskRequest) -> Result<PathBuf> {
        let request = RamdiskRequest::new(request.out_file.clone())?;
        let out = self.firmware.file(&request.out_file);
        let partial = partial_path(&out);
        let runner = self.runner;
        let sudo = self.context.sudo;
        let timeout = self.context.timeouts.archive();

        println!("  Archiving rootfs into {}", out.display());
        let archived = self.run_partition(ROOTFS_PARTITION, MountMode::ReadOnly, |_, handle| {
            let script = archive_script(
                &handle.mountpoint.to_string_lossy(),
                &partial.to_string_lossy(),
                sudo,
            );
            shell(&script)
                .timeout(timeout)
                .error_msg("creating the ramdisk archive failed")
                .run(runner)?;
            Ok(())
        });

        if let Err(e) = archived {
            discard_partial(&partial);
            return Err(e);
        }
        fs::rename(&partial, &out).map_err(|e| {
            discard_partial(&partial);
            ProvisionError::io(
                format!("moving '{}' into place", partial.display()),
                e,
            )
        })?;

        tracing::info!(out = %out.display(), "ramdisk created");
        Ok(out)
    }
}

fn discard_partial(partial: &Path) {
    match fs::remove_file(partial) {
        Ok(()) => tracing::debug!(path = %partial.display(), "removed incomplete ramdisk"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %partial.display(), error = %e, "could not remove incomplete ramdisk"),
    }
}
