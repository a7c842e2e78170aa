//! An external command paired with a human-readable description of what
//! it is doing, so pipeline progress is legible in the logs.

use std::ffi::OsStr;
use std::process::Command;

use anyhow::{Context, Result};

use liveforge_utils::CommandRunExt;

pub(crate) struct Task {
    description: String,
    cmd: Command,
}

impl Task {
    pub(crate) fn new(description: impl Into<String>, exe: impl AsRef<OsStr>) -> Self {
        Self {
            description: description.into(),
            cmd: Command::new(exe),
        }
    }

    pub(crate) fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.cmd.arg(arg);
        self
    }

    pub(crate) fn args(mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> Self {
        self.cmd.args(args);
        self
    }

    /// Log the description, then run to completion.
    pub(crate) fn run(mut self) -> Result<()> {
        tracing::info!("{}", self.description);
        self.cmd
            .log_debug()
            .run()
            .with_context(|| self.description.clone())
    }
}
