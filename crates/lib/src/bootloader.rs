//! Rewriting the bootloader configuration shipped in the OS image and
//! installing the bootloader onto the device.

use anyhow::Context;
use camino::Utf8Path;
use fn_error_context::context;

use liveforge_mount::ScopedMount;

use crate::error::ProvisionError;
use crate::parsers::grub_cfg;
use crate::task::Task;

/// Kernel argument that makes the live system pick up the persistence
/// partition.
pub(crate) const PERSISTENCE_KARG: &str = "persistence";

/// Location of the bootloader configuration on the boot partition, below
/// the `boot` subtree staged from the image.
const GRUB_CFG_PATH: &str = "boot/grub/grub.cfg";

/// One bootloader installation. Fails fatally on any sub-step; no retry.
#[derive(Debug)]
pub(crate) struct BootloaderInstall<'a> {
    /// The BIOS boot partition the bootloader binary is installed to.
    pub bios_partition: &'a Utf8Path,
    /// The partition holding `boot/` and `EFI/`.
    pub boot_partition: &'a Utf8Path,
    /// Root partition position in the physical boot order; grub addresses
    /// it as `(hd0,N)`.
    pub root_position: u32,
    /// Console resolution for the `gfxpayload` directive.
    pub gfxmode: &'a str,
    /// Whether to add the persistence kernel argument.
    pub persistence: bool,
    /// Whether to pass the secure-boot-aware flag to the installer.
    pub secure_boot: bool,
}

impl BootloaderInstall<'_> {
    pub(crate) fn run(&self) -> Result<(), ProvisionError> {
        self.run_inner().map_err(ProvisionError::BootloaderInstall)
    }

    #[context("Installing bootloader from {}", self.boot_partition)]
    fn run_inner(&self) -> anyhow::Result<()> {
        let boot_mnt = ScopedMount::new_rw(self.boot_partition)?;

        let cfg_path = boot_mnt.path().join(GRUB_CFG_PATH);
        let contents = std::fs::read_to_string(&cfg_path)
            .with_context(|| format!("Reading {cfg_path}"))?;
        let karg = self.persistence.then_some(PERSISTENCE_KARG);
        let rewritten =
            grub_cfg::rewrite_config(&contents, self.root_position, self.gfxmode, karg);
        std::fs::write(&cfg_path, rewritten).with_context(|| format!("Writing {cfg_path}"))?;
        tracing::debug!("Rewrote {cfg_path} (root at hd0,{})", self.root_position);

        Task::new(
            format!("Installing bootloader to {}", self.bios_partition),
            "grub-install",
        )
        .args(grub_install_args(
            boot_mnt.path(),
            self.bios_partition,
            self.secure_boot,
        ))
        .run()?;

        liveforge_mount::syncfs(boot_mnt.path()).context("Flushing boot partition")?;
        boot_mnt.unmount()?;
        Ok(())
    }
}

/// Arguments for the bootloader installer: removable-media layout, the
/// staged boot and EFI directories, and the target partition.
fn grub_install_args(
    boot_mnt: &Utf8Path,
    bios_partition: &Utf8Path,
    secure_boot: bool,
) -> Vec<String> {
    let mut args = vec!["--removable".to_string()];
    if secure_boot {
        args.push("--uefi-secure-boot".into());
    }
    args.push(format!("--boot-directory={boot_mnt}/boot"));
    args.push(format!("--efi-directory={boot_mnt}/EFI"));
    args.push(bios_partition.to_string());
    args
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_grub_install_args() {
        let args = grub_install_args(
            Utf8Path::new("/tmp/liveforge-mnt.x"),
            Utf8Path::new("/dev/sdb2"),
            true,
        );
        assert_eq!(
            args,
            vec![
                "--removable",
                "--uefi-secure-boot",
                "--boot-directory=/tmp/liveforge-mnt.x/boot",
                "--efi-directory=/tmp/liveforge-mnt.x/EFI",
                "/dev/sdb2",
            ]
        );
    }

    #[test]
    fn test_grub_install_args_without_secure_boot() {
        let args = grub_install_args(
            Utf8Path::new("/mnt"),
            Utf8Path::new("/dev/nvme0n1p2"),
            false,
        );
        assert!(!args.contains(&"--uefi-secure-boot".to_string()));
        assert_eq!(args.last().unwrap(), "/dev/nvme0n1p2");
    }
}
