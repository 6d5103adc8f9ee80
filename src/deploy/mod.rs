//! Copying build artifacts into mounted image partitions.
//!
//! Mountpoints are owned by root, so every write goes through privileged
//! `cp`/`rm`/`mkdir` commands. Existing artifacts are overwritten without a
//! backup. Workspace overlays are replaced wholesale, never merged.

use std::fmt;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::{ProvisionError, Result};
use crate::mount::MountHandle;
use crate::process::{Cmd, CommandRunner};

/// What is being placed into the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Kernel,
    BootScript,
    DeviceTree,
    BootBinary,
    Workspace,
    Ramdisk,
    File,
}

impl ArtifactKind {
    /// In-image file name the boot flow expects, for kinds that have one.
    pub fn default_name(self) -> Option<&'static str> {
        match self {
            ArtifactKind::Kernel => Some("Image"),
            ArtifactKind::BootScript => Some("boot.scr"),
            ArtifactKind::DeviceTree => Some("system.dtb"),
            ArtifactKind::BootBinary => Some("BOOT.BIN"),
            ArtifactKind::Workspace | ArtifactKind::Ramdisk | ArtifactKind::File => None,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArtifactKind::Kernel => "kernel image",
            ArtifactKind::BootScript => "boot script",
            ArtifactKind::DeviceTree => "device tree",
            ArtifactKind::BootBinary => "boot binary",
            ArtifactKind::Workspace => "workspace",
            ArtifactKind::Ramdisk => "ramdisk",
            ArtifactKind::File => "file",
        };
        f.write_str(name)
    }
}

/// Normalize an in-image destination to a path relative to the partition root.
///
/// A leading `/` is dropped; `..` is refused so nothing escapes the mountpoint.
pub fn relative_destination(destination: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(destination).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(ProvisionError::InvalidRequest(format!(
                    "destination '{}' leaves the partition root",
                    destination
                )));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(ProvisionError::InvalidRequest(format!(
            "destination '{}' names the partition root",
            destination
        )));
    }
    Ok(out)
}

pub struct Deployer<'a> {
    runner: &'a dyn CommandRunner,
    sudo: bool,
    copy_timeout: Duration,
}

impl<'a> Deployer<'a> {
    pub fn new(runner: &'a dyn CommandRunner, sudo: bool, copy_timeout: Duration) -> Self {
        Self {
            runner,
            sudo,
            copy_timeout,
        }
    }

    fn privileged(&self, program: &str) -> Cmd {
        Cmd::privileged(program, self.sudo).timeout(self.copy_timeout)
    }

    /// Copy `source` to `destination` inside the mounted partition.
    ///
    /// Returns the absolute destination path under the mountpoint.
    pub fn deploy(
        &self,
        handle: &MountHandle,
        kind: ArtifactKind,
        source: &Path,
        destination: &str,
    ) -> Result<PathBuf> {
        if !source.exists() {
            return Err(ProvisionError::ArtifactNotFound {
                kind: kind.to_string(),
                path: source.to_path_buf(),
            });
        }
        let target = handle.mountpoint.join(relative_destination(destination)?);

        if kind == ArtifactKind::Workspace {
            if !source.is_dir() {
                return Err(ProvisionError::InvalidRequest(format!(
                    "workspace '{}' is not a directory",
                    source.display()
                )));
            }
            self.privileged("rm")
                .arg("-rf")
                .arg_path(&target)
                .error_msg("could not clear previous workspace overlay")
                .run(self.runner)?;
            self.ensure_parent(handle, &target)?;
            self.privileged("cp")
                .arg("-r")
                .arg_path(source)
                .arg_path(&target)
                .run(self.runner)?;
        } else {
            if source.is_dir() {
                return Err(ProvisionError::InvalidRequest(format!(
                    "{} '{}' is a directory",
                    kind,
                    source.display()
                )));
            }
            self.ensure_parent(handle, &target)?;
            self.privileged("cp")
                .arg_path(source)
                .arg_path(&target)
                .run(self.runner)?;
        }

        tracing::info!(
            %kind,
            source = %source.display(),
            target = %target.display(),
            "deployed"
        );
        println!("  Copied {} -> {}", source.display(), target.display());
        Ok(target)
    }

    /// Deploy under the kind's conventional name at the partition root.
    pub fn deploy_default(
        &self,
        handle: &MountHandle,
        kind: ArtifactKind,
        source: &Path,
    ) -> Result<PathBuf> {
        let name = kind.default_name().ok_or_else(|| {
            ProvisionError::InvalidRequest(format!("{} has no default destination", kind))
        })?;
        self.deploy(handle, kind, source, name)
    }

    /// Write generated `contents` to `destination` inside the partition,
    /// world-readable.
    pub fn write_file(
        &self,
        handle: &MountHandle,
        destination: &str,
        contents: &str,
    ) -> Result<PathBuf> {
        let target = handle.mountpoint.join(relative_destination(destination)?);

        let mut staged = tempfile::NamedTempFile::new()
            .map_err(|e| ProvisionError::io("creating temporary file", e))?;
        staged
            .write_all(contents.as_bytes())
            .and_then(|_| staged.flush())
            .map_err(|e| ProvisionError::io("writing temporary file", e))?;

        self.ensure_parent(handle, &target)?;
        self.privileged("cp")
            .arg_path(staged.path())
            .arg_path(&target)
            .run(self.runner)?;
        self.privileged("chmod")
            .arg("0644")
            .arg_path(&target)
            .run(self.runner)?;

        tracing::info!(target = %target.display(), bytes = contents.len(), "wrote file");
        println!("  Wrote {}", target.display());
        Ok(target)
    }

    fn ensure_parent(&self, handle: &MountHandle, target: &Path) -> Result<()> {
        match target.parent() {
            Some(parent) if parent != handle.mountpoint => {
                self.privileged("mkdir")
                    .arg("-p")
                    .arg_path(parent)
                    .run(self.runner)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountMode;
    use crate::partition::RawImage;
    use crate::process::testing::RecordingRunner;
    use std::fs;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn handle_in(temp: &TempDir, partition: u32) -> MountHandle {
        let image = temp.path().join("sd_card.img");
        fs::write(&image, b"").unwrap();
        MountHandle {
            partition,
            mountpoint: temp.path().join(format!("sdcard_img_p{}", partition)),
            image: RawImage::open(&image).unwrap(),
            offset_bytes: 1_048_576,
            mode: MountMode::ReadWrite,
        }
    }

    #[test]
    fn test_relative_destination() {
        assert_eq!(relative_destination("/Image").unwrap(), PathBuf::from("Image"));
        assert_eq!(
            relative_destination("opt/ros/humble/setup.bash").unwrap(),
            PathBuf::from("opt/ros/humble/setup.bash")
        );
        assert_eq!(
            relative_destination("./usr/lib/libstdc++fs.a").unwrap(),
            PathBuf::from("usr/lib/libstdc++fs.a")
        );
        assert!(matches!(
            relative_destination("../etc/passwd"),
            Err(ProvisionError::InvalidRequest(_))
        ));
        assert!(relative_destination("usr/../../etc").is_err());
        assert!(relative_destination("/").is_err());
        assert!(relative_destination("").is_err());
    }

    #[test]
    fn test_default_names() {
        assert_eq!(ArtifactKind::Kernel.default_name(), Some("Image"));
        assert_eq!(ArtifactKind::BootScript.default_name(), Some("boot.scr"));
        assert_eq!(ArtifactKind::DeviceTree.default_name(), Some("system.dtb"));
        assert_eq!(ArtifactKind::BootBinary.default_name(), Some("BOOT.BIN"));
        assert_eq!(ArtifactKind::Workspace.default_name(), None);
    }

    #[test]
    fn test_missing_source_runs_no_commands() {
        let temp = TempDir::new().unwrap();
        let handle = handle_in(&temp, 1);
        let runner = RecordingRunner::new();
        let deployer = Deployer::new(&runner, true, TIMEOUT);

        let err = deployer
            .deploy_default(&handle, ArtifactKind::Kernel, &temp.path().join("Image_PREEMPT_RT"))
            .unwrap_err();

        match err {
            ProvisionError::ArtifactNotFound { kind, path } => {
                assert_eq!(kind, "kernel image");
                assert!(path.ends_with("Image_PREEMPT_RT"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_deploy_default_copies_to_root() {
        let temp = TempDir::new().unwrap();
        let handle = handle_in(&temp, 1);
        let source = temp.path().join("boot.scr.default");
        fs::write(&source, b"script").unwrap();
        let runner = RecordingRunner::new();
        let deployer = Deployer::new(&runner, true, TIMEOUT);

        let target = deployer
            .deploy_default(&handle, ArtifactKind::BootScript, &source)
            .unwrap();

        assert_eq!(target, handle.mountpoint.join("boot.scr"));
        assert_eq!(
            runner.calls(),
            vec![vec![
                "sudo".to_string(),
                "cp".to_string(),
                source.to_string_lossy().into_owned(),
                target.to_string_lossy().into_owned(),
            ]]
        );
    }

    #[test]
    fn test_nested_destination_creates_parent() {
        let temp = TempDir::new().unwrap();
        let handle = handle_in(&temp, 2);
        let source = temp.path().join("libstdc++fs.a");
        fs::write(&source, b"!<arch>").unwrap();
        let runner = RecordingRunner::new();
        let deployer = Deployer::new(&runner, false, TIMEOUT);

        deployer
            .deploy(&handle, ArtifactKind::File, &source, "usr/lib/libstdc++fs.a")
            .unwrap();

        assert_eq!(runner.tools(), vec!["mkdir", "cp"]);
        let mkdir = &runner.calls_to("mkdir")[0];
        assert_eq!(mkdir[1], "-p");
        assert!(mkdir[2].ends_with("sdcard_img_p2/usr/lib"));
    }

    #[test]
    fn test_workspace_is_replaced_not_merged() {
        let temp = TempDir::new().unwrap();
        let handle = handle_in(&temp, 2);
        let install = temp.path().join("install");
        fs::create_dir_all(install.join("lib")).unwrap();
        let runner = RecordingRunner::new();
        let deployer = Deployer::new(&runner, true, TIMEOUT);

        deployer
            .deploy(&handle, ArtifactKind::Workspace, &install, "/krs_ws")
            .unwrap();

        assert_eq!(runner.tools(), vec!["rm", "cp"]);
        let rm = &runner.calls_to("rm")[0];
        assert_eq!(rm[2], "-rf");
        assert!(rm[3].ends_with("sdcard_img_p2/krs_ws"));
        let cp = &runner.calls_to("cp")[0];
        assert_eq!(cp[2], "-r");
    }

    #[test]
    fn test_workspace_must_be_directory() {
        let temp = TempDir::new().unwrap();
        let handle = handle_in(&temp, 2);
        let file = temp.path().join("install");
        fs::write(&file, b"").unwrap();
        let runner = RecordingRunner::new();
        let deployer = Deployer::new(&runner, true, TIMEOUT);

        let err = deployer
            .deploy(&handle, ArtifactKind::Workspace, &file, "krs_ws")
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidRequest(_)));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_copy_failure_surfaces_stderr() {
        let temp = TempDir::new().unwrap();
        let handle = handle_in(&temp, 1);
        let source = temp.path().join("Image");
        fs::write(&source, b"kernel").unwrap();
        let runner = RecordingRunner::new();
        runner.fail("cp", "cp: error writing 'Image': No space left on device");
        let deployer = Deployer::new(&runner, true, TIMEOUT);

        let err = deployer
            .deploy_default(&handle, ArtifactKind::Kernel, &source)
            .unwrap_err();
        assert!(err.to_string().contains("No space left on device"));
    }

    #[test]
    fn test_write_file_stages_then_copies() {
        let temp = TempDir::new().unwrap();
        let handle = handle_in(&temp, 2);
        let runner = RecordingRunner::new();
        let deployer = Deployer::new(&runner, true, TIMEOUT);

        let target = deployer
            .write_file(&handle, "/opt/ros/humble/setup.bash", "AMENT_SHELL=bash\n")
            .unwrap();

        assert!(target.ends_with("opt/ros/humble/setup.bash"));
        assert_eq!(runner.tools(), vec!["mkdir", "cp", "chmod"]);
        let chmod = &runner.calls_to("chmod")[0];
        assert_eq!(chmod[2], "0644");
    }

    #[test]
    fn test_write_file_rejects_escape() {
        let temp = TempDir::new().unwrap();
        let handle = handle_in(&temp, 2);
        let runner = RecordingRunner::new();
        let deployer = Deployer::new(&runner, true, TIMEOUT);

        assert!(deployer.write_file(&handle, "../../etc/shadow", "x").is_err());
        assert!(runner.calls().is_empty());
    }
}
