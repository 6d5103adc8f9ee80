//! Workspace overlay deployment into the root filesystem partition.
//!
//! The install tree lands at `/<workspace-name>` and is replaced on every
//! deployment. A generated `/opt/<prefix>/<distro>/setup.bash` chains the
//! distribution environment with the overlay so that one `source` on the
//! target is enough.

use std::path::{Path, PathBuf};

use crate::config::OverlayConfig;
use crate::deploy::ArtifactKind;
use crate::error::{ProvisionError, Result};
use crate::mount::MountMode;
use crate::partition::ROOTFS_PARTITION;

use super::{require_artifact, Provisioner};

/// Environment script sourcing the distribution and then the overlay.
pub fn render_setup_script(prefix: &str, workspace_name: &str) -> String {
    format!(
        "AMENT_SHELL=bash\n\
         \n\
         # source the {prefix} installation in the rootfs\n\
         source /usr/bin/{prefix}_setup.bash\n\
         \n\
         # source the overlay workspace\n\
         source /{workspace_name}/local_setup.bash\n"
    )
}

/// Login hook sourcing the generated environment for bash shells.
pub fn render_profile_hook(setup_path: &str) -> String {
    format!("if [ -n \"$BASH_VERSION\" ] && [ -f {setup_path} ]; then\n    . {setup_path}\nfi\n")
}

/// A checked overlay deployment, ready to run against partition 2.
#[derive(Debug, Clone)]
pub(crate) struct WorkspacePlan {
    source: PathBuf,
    workspace_name: String,
    setup_path: String,
    setup_script: String,
    /// Profile hook destination and contents.
    hook: Option<(String, String)>,
    extras: Vec<(PathBuf, String)>,
    label: String,
}

/// In-image locations written for `overlay`.
fn setup_destinations(overlay: &OverlayConfig, distro: &str) -> (String, String) {
    (
        format!("/opt/{}/{}/setup.bash", overlay.prefix, distro),
        format!("/etc/profile.d/{}/setup.sh", overlay.prefix),
    )
}

impl Provisioner<'_> {
    /// Resolve an install directory against the workspace root. It must exist.
    fn install_source(&self, install_dir: &Path) -> Result<PathBuf> {
        let source = if install_dir.is_absolute() {
            install_dir.to_path_buf()
        } else {
            self.context.workspace_root.join(install_dir)
        };
        if !source.is_dir() {
            return Err(ProvisionError::ArtifactNotFound {
                kind: "workspace install directory".to_string(),
                path: source,
            });
        }
        Ok(source)
    }

    /// Deploy `install_dir` (or the configured default) as the overlay.
    pub fn deploy_workspace(&mut self, install_dir: Option<&Path>) -> Result<Vec<PathBuf>> {
        let install_dir = install_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(&self.context.overlay.install_dir));
        let plan = self.prepare_workspace(&install_dir)?;
        self.deploy_prepared_workspace(plan)
    }

    /// Resolve everything an overlay deployment needs without touching the
    /// image: the install tree, the distribution and every extra file.
    pub(crate) fn prepare_workspace(&self, install_dir: &Path) -> Result<WorkspacePlan> {
        let source = self.install_source(install_dir)?;
        let overlay = &self.context.overlay;
        let distro = overlay.distro.clone().ok_or_else(|| {
            ProvisionError::InvalidRequest(
                "no distribution configured: set ROS_DISTRO or overlay.distro".to_string(),
            )
        })?;
        let extras = overlay
            .extra_rootfs_files
            .iter()
            .map(|extra| -> Result<(PathBuf, String)> {
                let path = self.firmware.file(extra.source.trim_start_matches('/'));
                require_artifact(ArtifactKind::File, &path)?;
                Ok((path, extra.destination.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        let (setup_path, hook_path) = setup_destinations(overlay, &distro);
        Ok(WorkspacePlan {
            source,
            workspace_name: self.context.workspace_name.clone(),
            setup_script: render_setup_script(&overlay.prefix, &self.context.workspace_name),
            hook: overlay
                .profile_hook
                .then(|| (hook_path, render_profile_hook(&setup_path))),
            setup_path,
            extras,
            label: format!("{} {}", overlay.prefix, distro),
        })
    }

    pub(crate) fn deploy_prepared_workspace(&mut self, plan: WorkspacePlan) -> Result<Vec<PathBuf>> {
        println!(
            "  Deploying {} as /{} ({})",
            plan.source.display(),
            plan.workspace_name,
            plan.label
        );
        self.run_partition(ROOTFS_PARTITION, MountMode::ReadWrite, |deployer, handle| {
            let mut written = vec![deployer.deploy(
                handle,
                ArtifactKind::Workspace,
                &plan.source,
                &plan.workspace_name,
            )?];
            written.push(deployer.write_file(handle, &plan.setup_path, &plan.setup_script)?);
            if let Some((hook_path, hook)) = &plan.hook {
                written.push(deployer.write_file(handle, hook_path, hook)?);
            }
            for (path, destination) in &plan.extras {
                written.push(deployer.deploy(handle, ArtifactKind::File, path, destination)?);
            }
            Ok(written)
        })
    }
}
