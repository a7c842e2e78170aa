//! Copying the OS payload onto the freshly created filesystems.

use anyhow::Context;
use camino::Utf8Path;
use fn_error_context::context;

use liveforge_mount::ScopedMount;

use crate::error::ProvisionError;
use crate::task::Task;

/// Subtrees of the image that also land on the boot partition.
const BOOT_SUBTREES: &[&str] = &["boot", "EFI"];

/// Mount the image and the resolved root and boot partitions, copy the OS
/// payload into place, flush, and release everything. Mount release is
/// guaranteed on every exit path; a partial copy is not recovered from —
/// the documented retry is a fresh run from table creation.
pub(crate) fn stage_content(
    image: &Utf8Path,
    root_partition: &Utf8Path,
    boot_partition: &Utf8Path,
) -> Result<(), ProvisionError> {
    stage_inner(image, root_partition, boot_partition).map_err(ProvisionError::Staging)
}

#[context("Staging OS content")]
fn stage_inner(
    image: &Utf8Path,
    root_partition: &Utf8Path,
    boot_partition: &Utf8Path,
) -> anyhow::Result<()> {
    let image_mnt = ScopedMount::new_ro_loop(image)?;
    let root_mnt = ScopedMount::new_rw(root_partition)?;
    let boot_mnt = ScopedMount::new_rw(boot_partition)?;

    // The trailing /. copies the image's contents, not the mount directory
    let payload = format!("{}/.", image_mnt.path());
    Task::new(format!("Copying system image to {root_partition}"), "cp")
        .args(["-a", payload.as_str(), root_mnt.path().as_str()])
        .run()?;

    for subtree in BOOT_SUBTREES {
        let src = image_mnt.path().join(subtree);
        if !src.exists() {
            anyhow::bail!("image has no {subtree} directory");
        }
        // The boot partition is FAT; no POSIX attributes to preserve
        Task::new(format!("Copying {subtree} to {boot_partition}"), "cp")
            .args(["-r", src.as_str(), boot_mnt.path().as_str()])
            .run()?;
    }

    liveforge_mount::syncfs(root_mnt.path()).context("Flushing root partition")?;
    liveforge_mount::syncfs(boot_mnt.path()).context("Flushing boot partition")?;
    root_mnt.unmount()?;
    boot_mnt.unmount()?;
    image_mnt.unmount()?;
    Ok(())
}
