//! External command execution.
//!
//! Every OS tool this crate drives (fdisk, mount, umount, cp, cpio, the
//! imagebuilder scripts) goes through a [`CommandRunner`]. Commands are
//! described with the [`Cmd`] builder and always carry a timeout; a command
//! that outlives it is killed and reported as [`ProvisionError::ToolTimedOut`]
//! together with whatever output it produced.
//!
//! ```rust,ignore
//! use sdimage::process::{Cmd, HostRunner};
//!
//! let out = Cmd::new("fdisk")
//!     .arg("-l")
//!     .arg_path(image)
//!     .error_msg("fdisk could not read the partition table")
//!     .run(&HostRunner)?;
//! ```

#[cfg(test)]
pub(crate) mod testing;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::error::{ProvisionError, Result};

/// Timeout for commands that don't set one explicitly.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Description of one external command invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    timeout: Duration,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            timeout: DEFAULT_TIMEOUT,
            error_msg: None,
            allow_fail: false,
        }
    }

    /// A command that needs root. Prefixed with `sudo` when `sudo` is set.
    pub fn privileged(program: impl Into<String>, sudo: bool) -> Self {
        if sudo {
            Self::new("sudo").arg(program)
        } else {
            Self::new(program)
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Message prefixed to the captured stderr when the command fails.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Return the output even when the exit status is non-zero.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    pub fn get_timeout(&self) -> Duration {
        self.timeout
    }

    /// The tool actually being run, looking through a `sudo` prefix.
    pub fn tool(&self) -> &str {
        match (self.program.as_str(), self.args.first()) {
            ("sudo", Some(tool)) => tool,
            (program, _) => program,
        }
    }

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Human-readable command line, for logs and error messages.
    pub fn command_line(&self) -> String {
        self.argv()
            .iter()
            .map(|part| {
                if part.is_empty() || part.contains(char::is_whitespace) {
                    shell_quote(part)
                } else {
                    part.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Execute through `runner`, turning a non-zero exit into
    /// [`ProvisionError::ExternalToolFailed`] unless [`Cmd::allow_fail`] was set.
    pub fn run(&self, runner: &dyn CommandRunner) -> Result<CmdOutput> {
        tracing::debug!(command = %self.command_line(), timeout_secs = self.timeout.as_secs(), "running");
        let output = runner.execute(self)?;

        if output.success() || self.allow_fail {
            return Ok(output);
        }

        let stderr = output.stderr.trim();
        let stderr = match &self.error_msg {
            Some(msg) if stderr.is_empty() => msg.clone(),
            Some(msg) => format!("{}: {}", msg, stderr),
            None => stderr.to_string(),
        };
        Err(ProvisionError::ExternalToolFailed {
            command: self.command_line(),
            status: output.status_text(),
            stderr,
        })
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    /// Exit code, `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn status_text(&self) -> String {
        match self.status {
            Some(code) => format!("exit status: {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Executes [`Cmd`]s. The seam between provisioning logic and the host OS.
pub trait CommandRunner {
    /// Run the command to completion or until its timeout expires.
    ///
    /// A non-zero exit is not an error at this level; [`Cmd::run`] decides.
    fn execute(&self, cmd: &Cmd) -> Result<CmdOutput>;
}

/// Runs commands on the host with `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

enum Chunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Closed,
}

fn pump<R: Read + Send + 'static>(
    mut reader: R,
    tx: mpsc::Sender<Chunk>,
    wrap: fn(Vec<u8>) -> Chunk,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(wrap(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
            }
        }
        let _ = tx.send(Chunk::Closed);
    });
}

impl CommandRunner for HostRunner {
    fn execute(&self, cmd: &Cmd) -> Result<CmdOutput> {
        let mut command = Command::new(cmd.program());
        command
            .args(cmd.get_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cmd.get_current_dir() {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ProvisionError::ExternalToolFailed {
                command: cmd.command_line(),
                status: "not started".to_string(),
                stderr: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            pump(stdout, tx.clone(), Chunk::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            pump(stderr, tx.clone(), Chunk::Stderr);
        }
        drop(tx);

        let deadline = Instant::now() + cmd.get_timeout();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut open_streams = 2;
        let mut status = None;

        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(Chunk::Stdout(bytes)) => stdout.extend_from_slice(&bytes),
                Ok(Chunk::Stderr(bytes)) => stderr.extend_from_slice(&bytes),
                Ok(Chunk::Closed) => open_streams -= 1,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => open_streams = 0,
            }

            if status.is_none() {
                status = child.try_wait().map_err(|e| {
                    ProvisionError::io(format!("waiting for `{}`", cmd.command_line()), e)
                })?;
            }

            if status.is_some() && open_streams == 0 {
                break;
            }

            if Instant::now() >= deadline {
                if status.is_none() {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                while let Ok(chunk) = rx.try_recv() {
                    match chunk {
                        Chunk::Stdout(bytes) => stdout.extend_from_slice(&bytes),
                        Chunk::Stderr(bytes) => stderr.extend_from_slice(&bytes),
                        Chunk::Closed => {}
                    }
                }
                let partial = partial_output(
                    &String::from_utf8_lossy(&stdout),
                    &String::from_utf8_lossy(&stderr),
                );
                tracing::warn!(command = %cmd.command_line(), "command timed out, killed");
                return Err(ProvisionError::ToolTimedOut {
                    command: cmd.command_line(),
                    timeout: cmd.get_timeout(),
                    partial,
                });
            }
        }

        Ok(CmdOutput {
            status: status.and_then(|s| s.code()),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

/// Output collected from a killed command, stderr labelled on its own line.
fn partial_output(stdout: &str, stderr: &str) -> String {
    let (stdout, stderr) = (stdout.trim(), stderr.trim());
    match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => format!("stderr: {}", stderr),
        (false, false) => format!("{}\nstderr: {}", stdout, stderr),
    }
}

/// Build a `bash` pipeline. `pipefail` is on, so a failure anywhere in the
/// pipe fails the command.
pub fn shell(script: &str) -> Cmd {
    Cmd::new("bash").args(["-o", "pipefail", "-c"]).arg(script)
}

/// Quote a string for safe interpolation into a shell script.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
