//! The error taxonomy surfaced to callers, and its mapping to process
//! exit codes.
//!
//! Everything that can go wrong before the first device mutation is a
//! distinct, recoverable category (plan syntax, plan semantics, device
//! state). Mid-pipeline failures are fatal: no rollback of partitions or
//! filesystems already created is attempted, and the documented recovery is
//! to re-run the full pipeline, which starts by wiping the table.

use camino::Utf8PathBuf;

/// Exit status for a device that still has mounted partitions.
pub const EXIT_DEVICE_BUSY: i32 = 2;
/// Exit status for a malformed invocation or plan (sysexits EX_USAGE).
pub const EXIT_USAGE: i32 = 64;
/// Exit status for semantically invalid input data (sysexits EX_DATAERR).
pub const EXIT_DATAERR: i32 = 65;

/// The result type used at component boundaries.
pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

/// All the ways a provisioning run can fail.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// A malformed command-line invocation.
    #[error("{0}")]
    Usage(String),

    /// A syntax-level defect in the partition plan text; reported before
    /// any device mutation.
    #[error("malformed plan: line {line}: {reason}")]
    MalformedPlan {
        /// 1-based line in the plan text
        line: usize,
        reason: String,
    },

    /// A whole-plan semantic violation (slot indices, remaining-space
    /// entries, capacity); reported before any device mutation.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// The target device has mounted partitions and a forced unmount was
    /// not requested. Recoverable by the caller.
    #[error("device {device} has mounted partitions ({mounted}); unmount them or pass --force-unmount")]
    DeviceBusy {
        device: Utf8PathBuf,
        /// Human-readable rendering of the mounted partitions
        mounted: String,
    },

    /// A filesystem outside the supported set.
    #[error("unsupported filesystem {0:?}")]
    UnsupportedFilesystem(String),

    /// Mounting or copying OS content failed, mid-pipeline.
    #[error("content staging failed")]
    Staging(#[source] anyhow::Error),

    /// Bootloader configuration or installation failed, mid-pipeline.
    #[error("bootloader installation failed")]
    BootloaderInstall(#[source] anyhow::Error),

    /// Anything else, notably external tool failures during table and
    /// filesystem creation.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProvisionError {
    pub(crate) fn malformed(line: usize, reason: impl Into<String>) -> Self {
        Self::MalformedPlan {
            line,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidPlan(reason.into())
    }

    /// The process exit status this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) | Self::MalformedPlan { .. } => EXIT_USAGE,
            Self::InvalidPlan(_) | Self::UnsupportedFilesystem(_) => EXIT_DATAERR,
            Self::DeviceBusy { .. } => EXIT_DEVICE_BUSY,
            Self::Staging(_) | Self::BootloaderInstall(_) | Self::Other(_) => 1,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ProvisionError::malformed(3, "x").exit_code(), 64);
        assert_eq!(ProvisionError::invalid("x").exit_code(), 65);
        assert_eq!(
            ProvisionError::UnsupportedFilesystem("zfs".into()).exit_code(),
            65
        );
        let busy = ProvisionError::DeviceBusy {
            device: "/dev/sdb".into(),
            mounted: "/dev/sdb1 on /mnt".into(),
        };
        assert_eq!(busy.exit_code(), 2);
        assert_eq!(
            ProvisionError::Other(anyhow::anyhow!("boom")).exit_code(),
            1
        );
    }

    #[test]
    fn test_display_carries_context() {
        let e = ProvisionError::malformed(7, "field SIZE: missing unit");
        assert_eq!(e.to_string(), "malformed plan: line 7: field SIZE: missing unit");
    }
}
