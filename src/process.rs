//! Thin wrapper over [`std::process::Command`] for host tools.
//!
//! ```rust,ignore
//! use flatpak_oci_fixtures::process::Cmd;
//!
//! let out = Cmd::new("flatpak")
//!     .args(["remotes", "--user"])
//!     .error_msg("flatpak remotes failed. Is flatpak installed?")
//!     .run()?;
//! println!("{}", out.stdout_trimmed());
//! ```

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use tracing::debug;

/// Check whether `cmd` can be found in PATH.
pub fn exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Result of a finished command.
#[derive(Debug)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Builder for a host command.
#[derive(Debug)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
    inherit_output: bool,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            error_msg: None,
            allow_fail: false,
            inherit_output: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Message prefixed to the error when the command fails.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Return the result instead of an error on non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Let the command write straight to our stdout/stderr.
    pub fn inherit_output(mut self) -> Self {
        self.inherit_output = true;
        self
    }

    fn display(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            s.push_str(&a.to_string_lossy());
        }
        s
    }

    pub fn run(self) -> Result<CommandResult> {
        let shown = self.display();
        debug!(command = %shown, "running");

        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null());

        let result = if self.inherit_output {
            let status = command
                .status()
                .with_context(|| format!("failed to spawn `{shown}`"))?;
            CommandResult {
                status,
                stdout: String::new(),
                stderr: String::new(),
            }
        } else {
            let output = command
                .output()
                .with_context(|| format!("failed to spawn `{shown}`"))?;
            CommandResult {
                status: output.status,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
        };

        if !result.success() && !self.allow_fail {
            let prefix = self
                .error_msg
                .unwrap_or_else(|| format!("{} failed", self.program));
            bail!(
                "{}\n  command: {}\n  status: {}\n{}",
                prefix,
                shown,
                result.status,
                result.stderr.trim()
            );
        }
        Ok(result)
    }
}
