//! Error taxonomy for image provisioning.
//!
//! Every failure is surfaced to the operator as-is. Nothing here is retried:
//! mounting and unmounting loop devices is not safe to repeat blindly.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while inspecting, mounting or provisioning a raw image.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("raw image not found: '{}' (deploy the firmware first so the image exists)", .0.display())]
    ImageNotFound(PathBuf),

    #[error("partition geometry unavailable for '{}': {reason}", image.display())]
    GeometryUnavailable { image: PathBuf, reason: String },

    #[error("partition {partition} is already mounted at '{}'", mountpoint.display())]
    AlreadyMounted { partition: u32, mountpoint: PathBuf },

    #[error("failed to mount partition {partition} at '{}': {detail}", mountpoint.display())]
    MountFailed {
        partition: u32,
        mountpoint: PathBuf,
        detail: String,
    },

    #[error("failed to unmount '{}': {detail}", mountpoint.display())]
    UnmountFailed { mountpoint: PathBuf, detail: String },

    #[error("{kind} not found: '{}'", path.display())]
    ArtifactNotFound { kind: String, path: PathBuf },

    #[error("`{command}` failed ({status}): {stderr}")]
    ExternalToolFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("`{command}` timed out after {}s; partial output: {partial}", timeout.as_secs())]
    ToolTimedOut {
        command: String,
        timeout: Duration,
        partial: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Short description of what went wrong inside an external command,
    /// used when a mount or unmount failure wraps a tool error.
    pub(crate) fn tool_detail(&self) -> String {
        match self {
            Self::ExternalToolFailed { stderr, status, .. } if stderr.is_empty() => status.clone(),
            Self::ExternalToolFailed { stderr, .. } => stderr.clone(),
            Self::ToolTimedOut { timeout, .. } => {
                format!("timed out after {}s", timeout.as_secs())
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_detail_prefers_stderr() {
        let err = ProvisionError::ExternalToolFailed {
            command: "mount".into(),
            status: "exit status: 32".into(),
            stderr: "wrong fs type".into(),
        };
        assert_eq!(err.tool_detail(), "wrong fs type");
    }

    #[test]
    fn test_tool_detail_falls_back_to_status() {
        let err = ProvisionError::ExternalToolFailed {
            command: "umount".into(),
            status: "exit status: 1".into(),
            stderr: String::new(),
        };
        assert_eq!(err.tool_detail(), "exit status: 1");
    }

    #[test]
    fn test_timeout_message_mentions_seconds() {
        let err = ProvisionError::ToolTimedOut {
            command: "sudo mount".into(),
            timeout: Duration::from_secs(15),
            partial: String::new(),
        };
        assert!(err.to_string().contains("15s"));
        assert_eq!(err.tool_detail(), "timed out after 15s");
    }
}
