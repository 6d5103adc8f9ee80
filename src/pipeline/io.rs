use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ProvisionError, Result};

/// Remove `dir` if present and create it empty.
pub(crate) fn recreate_dir(dir: &Path) -> Result<PathBuf> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|e| {
            ProvisionError::io(
                format!("removing existing staging directory '{}'", dir.display()),
                e,
            )
        })?;
    }
    fs::create_dir_all(dir).map_err(|e| {
        ProvisionError::io(format!("creating staging directory '{}'", dir.display()), e)
    })?;
    Ok(dir.to_path_buf())
}

/// Copy `source` into `staging` under `name`.
pub(crate) fn stage_file(source: &Path, staging: &Path, name: &str) -> Result<PathBuf> {
    let target = staging.join(name);
    fs::copy(source, &target).map_err(|e| {
        ProvisionError::io(
            format!("staging '{}' -> '{}'", source.display(), target.display()),
            e,
        )
    })?;
    Ok(target)
}

/// Files directly inside `dir`, sorted by name.
pub(crate) fn staged_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        ProvisionError::io(format!("listing staging directory '{}'", dir.display()), e)
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            ProvisionError::io(format!("listing staging directory '{}'", dir.display()), e)
        })?;
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
