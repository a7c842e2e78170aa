//! Extensions for [`std::process::Command`] used by everything that shells
//! out to the disk and filesystem tooling.

use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Render a command as a single shell-quoted string for diagnostics.
fn command_display(cmd: &Command) -> String {
    let mut words = vec![cmd.get_program().to_string_lossy().into_owned()];
    words.extend(
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned()),
    );
    shlex::try_join(words.iter().map(|s| s.as_str())).unwrap_or_else(|_| words.join(" "))
}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full command we will run.
    fn log_debug(&mut self) -> &mut Self;

    /// Synchronously execute the child, discarding stdout, and return an
    /// error if the child exited unsuccessfully. The last captured stderr
    /// lines are folded into the error.
    fn run(&mut self) -> Result<()>;

    /// Like [`Self::run`], but stderr is suppressed entirely on success.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child, capturing stdout as a UTF-8 string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child, parsing its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;
}

/// Turn a completed process into a result, folding in captured stderr.
fn map_status(cmd: &Command, status: std::process::ExitStatus, stderr: &[u8]) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        anyhow::bail!("Command {} failed: {status}", command_display(cmd));
    }
    anyhow::bail!(
        "Command {} failed: {status}: {stderr}",
        command_display(cmd)
    )
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", command_display(self));
        self
    }

    fn run(&mut self) -> Result<()> {
        let rendered = command_display(self);
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Executing {rendered}"))?;
        map_status(self, output.status, &output.stderr)
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        self.run()
    }

    fn run_get_string(&mut self) -> Result<String> {
        let rendered = command_display(self);
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Executing {rendered}"))?;
        map_status(self, output.status, &output.stderr)?;
        String::from_utf8(output.stdout).with_context(|| format!("Output of {rendered}"))
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let rendered = command_display(self);
        let stdout = self.run_get_string()?;
        serde_json::from_str(&stdout).with_context(|| format!("Parsing output of {rendered}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_display_quoting() {
        let mut c = Command::new("sgdisk");
        c.args(["-c", "1:with space", "/dev/sda"]);
        assert_eq!(command_display(&c), "sgdisk -c '1:with space' /dev/sda");
    }

    #[test]
    fn test_run_success_and_failure() {
        assert!(Command::new("true").run().is_ok());
        let e = Command::new("false").run().unwrap_err();
        assert!(e.to_string().contains("false"), "{e}");
    }

    #[test]
    fn test_run_get_string() {
        let s = Command::new("echo").arg("hello").run_get_string().unwrap();
        assert_eq!(s.trim(), "hello");
    }

    #[test]
    fn test_run_and_parse_json() {
        #[derive(serde::Deserialize)]
        struct V {
            a: u32,
        }
        let v: V = Command::new("echo")
            .arg(r#"{"a": 5}"#)
            .run_and_parse_json()
            .unwrap();
        assert_eq!(v.a, 5);
    }

    #[test]
    fn test_failure_includes_stderr() {
        let e = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .run()
            .unwrap_err();
        let msg = e.to_string();
        assert!(msg.contains("oops"), "{msg}");
    }
}
