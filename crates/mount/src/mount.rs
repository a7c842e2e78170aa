//! Scoped mounts over ephemeral mount points.
//!
//! Every stage of the provisioning pipeline that needs a filesystem view
//! takes one of these; the mount and its directory are released on every
//! exit path, including errors, via `Drop`.

use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use liveforge_utils::CommandRunExt;

/// A mounted filesystem bound to a temporary mount point directory.
///
/// The mount is released either explicitly via [`Self::unmount`] (which
/// reports errors) or on drop (best effort).
#[derive(Debug)]
pub struct ScopedMount {
    source: Utf8PathBuf,
    path: Utf8PathBuf,
    // Some until unmounted; holding the TempDir keeps the directory alive
    mountpoint: Option<tempfile::TempDir>,
}

impl ScopedMount {
    /// Mount `source` on a fresh temporary directory, passing `options`
    /// through to `mount -o`.
    #[context("Mounting {source}")]
    pub fn new(source: &Utf8Path, options: Option<&str>) -> Result<Self> {
        let mountpoint = tempfile::Builder::new()
            .prefix("liveforge-mnt.")
            .tempdir()
            .context("Allocating mount point")?;
        let path = Utf8Path::from_path(mountpoint.path())
            .ok_or_else(|| anyhow!("Non-UTF8 mount point {:?}", mountpoint.path()))?
            .to_owned();
        let mut cmd = Command::new("mount");
        if let Some(options) = options {
            cmd.args(["-o", options]);
        }
        cmd.arg(source.as_str()).arg(path.as_str());
        cmd.log_debug().run()?;
        tracing::debug!("Mounted {source} on {path}");
        Ok(Self {
            source: source.to_owned(),
            path,
            mountpoint: Some(mountpoint),
        })
    }

    /// Mount a partition read-write.
    pub fn new_rw(source: &Utf8Path) -> Result<Self> {
        Self::new(source, None)
    }

    /// Loop-mount an image file read-only.
    pub fn new_ro_loop(image: &Utf8Path) -> Result<Self> {
        Self::new(image, Some("loop,ro"))
    }

    /// The mount point path.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    // Shared backend for our `unmount` and `drop` implementations.
    fn impl_unmount(&mut self) -> Result<()> {
        // SAFETY: This is the only place we take the option
        let Some(mountpoint) = self.mountpoint.take() else {
            tracing::trace!("{} already unmounted", self.path);
            return Ok(());
        };
        Command::new("umount")
            .arg(self.path.as_str())
            .run()
            .with_context(|| format!("Unmounting {}", self.source))?;
        mountpoint
            .close()
            .context("Removing mount point directory")?;
        tracing::debug!("Unmounted {}", self.source);
        Ok(())
    }

    /// Consume this mount, releasing it and its mount point.
    pub fn unmount(mut self) -> Result<()> {
        self.impl_unmount()
    }
}

impl Drop for ScopedMount {
    fn drop(&mut self) {
        // Best effort if we're dropped without invoking `unmount`
        let _ = self.impl_unmount();
    }
}

/// Flush all outstanding writes on the filesystem containing `path`.
#[context("Flushing writes under {path}")]
pub fn syncfs(path: &Utf8Path) -> Result<()> {
    let f = std::fs::File::open(path).with_context(|| format!("Opening {path}"))?;
    rustix::fs::syncfs(&f).map_err(Into::into)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_syncfs_on_plain_dir() {
        // syncfs targets whatever filesystem backs the fd, so any
        // directory works for exercising the call.
        let td = tempfile::tempdir().unwrap();
        let p = Utf8Path::from_path(td.path()).unwrap();
        syncfs(p).unwrap();
    }
}
