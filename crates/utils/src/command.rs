//! Helpers intended for [`std::process::Command`].

use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Maximum number of bytes of stderr we include in an error.
const STDERR_TAIL: usize = 1024;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, capturing stderr so it can be
    /// included in the error on failure.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process and return its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, parsing its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;
}

/// Render the trailing part of a process' stderr for use in an error message.
pub fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

/// Convert a finished child [`Output`] into an error if it did not exit successfully.
pub fn check_output(program: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = stderr_tail(&output.stderr);
    if stderr.is_empty() {
        anyhow::bail!("Subprocess {program} failed: {}", output.status)
    } else {
        anyhow::bail!("Subprocess {program} failed: {}: {stderr}", output.status)
    }
}

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {self:?}");
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let program = program_name(self);
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {program}"))?;
        check_output(&program, &output)
    }

    fn run_get_string(&mut self) -> Result<String> {
        let program = program_name(self);
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {program}"))?;
        check_output(&program, &output)?;
        String::from_utf8(output.stdout).with_context(|| format!("Parsing {program} output"))
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let program = program_name(self);
        let buf = self.run_get_string()?;
        serde_json::from_str(&buf).with_context(|| format!("Parsing {program} JSON output"))
    }
}
