//! The device-provisioning pipeline: preflight, partition table,
//! filesystems, then handing over to content staging and the bootloader
//! installer.
//!
//! Stage order is load-bearing. The table must exist before filesystems
//! are created, filesystems before content is staged, content before the
//! bootloader is installed. The table wipe is irreversible; every check
//! that can fail does so before it.

use camino::Utf8Path;

use crate::blockdev;
use crate::bootloader::BootloaderInstall;
use crate::config::ProvisionConfig;
use crate::error::{ProvisionError, Result};
use crate::layout::{ResolvedLayout, ResolvedPartition};
use crate::plan::{Filesystem, PartitionPlan, PartitionSpec};
use crate::stage;
use crate::task::Task;

/// Run the full pipeline: resolve the plan against the device, then
/// partition, format, stage and install in that order.
pub fn run(config: &ProvisionConfig, plan: &PartitionPlan) -> Result<()> {
    let device = blockdev::list_dev(&config.device)?;
    let layout = ResolvedLayout::resolve(plan, device.size)?;

    // Resolve every role before the first mutation so a defective plan
    // cannot leave the device half-provisioned.
    let root = layout.root_partition()?;
    let boot = layout.boot_partition()?;
    let bios = layout.bios_partition()?;
    let root_path = blockdev::partition_path(&config.device, root.spec.slot);
    let boot_path = blockdev::partition_path(&config.device, boot.spec.slot);
    let bios_path = blockdev::partition_path(&config.device, bios.spec.slot);
    let persistence = config.persistence && layout.persistence_partition().is_some();

    preflight(config, &device)?;
    // sgdisk counts in logical sectors; mkfs wants the physical block size
    create_table(&layout, &config.device, device.logical_sector_size())?;
    create_filesystems(&layout, &config.device, device.sector_size())?;
    stage::stage_content(&config.image, &root_path, &boot_path)?;
    BootloaderInstall {
        bios_partition: &bios_path,
        boot_partition: &boot_path,
        root_position: root.physical_position,
        gfxmode: &config.gfxmode,
        persistence,
        secure_boot: config.secure_boot,
    }
    .run()?;
    tracing::info!("Provisioned {}", config.device);
    Ok(())
}

/// Refuse to touch a device with mounted partitions unless the caller
/// asked us to unmount them.
fn preflight(config: &ProvisionConfig, device: &blockdev::Device) -> Result<()> {
    let mounted = device.mounted_partitions();
    if mounted.is_empty() {
        return Ok(());
    }
    if !config.force_unmount {
        let mounted = mounted
            .iter()
            .map(|(part, mountpoint)| format!("{part} on {mountpoint}"))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(ProvisionError::DeviceBusy {
            device: config.device.clone(),
            mounted,
        });
    }
    for (part, mountpoint) in &mounted {
        Task::new(format!("Unmounting {part} ({mountpoint})"), "umount")
            .arg(part.as_str())
            .run()?;
    }
    Ok(())
}

fn sectors_for(bytes: u64, sector_size: u64) -> u64 {
    bytes.div_ceil(sector_size)
}

/// The sgdisk arguments creating one table entry: slot, start at the next
/// available offset, size, name, type, and attribute flags. A
/// remaining-space entry that is physically last gets the literal
/// consume-remainder end; anywhere else its resolved size is written, as
/// "next available" placement would otherwise swallow the space the later
/// entries need.
fn sgdisk_partition_args(
    part: &ResolvedPartition,
    physically_last: bool,
    sector_size: u64,
) -> Vec<String> {
    let slot = part.spec.slot;
    let end = if part.is_remaining() && physically_last {
        "0".to_string()
    } else {
        format!("+{}", sectors_for(part.size, sector_size))
    };
    let mut args = vec![
        "-n".into(),
        format!("{slot}:0:{end}"),
        "-c".into(),
        format!("{slot}:{}", part.spec.name),
        "-t".into(),
        format!("{slot}:{}", part.spec.type_guid),
    ];
    for bit in part.spec.flags.iter() {
        args.push("-A".into());
        args.push(format!("{slot}:set:{bit}"));
    }
    args
}

/// Wipe the existing table and write one entry per plan line, in physical
/// creation order, then have the kernel re-read the result.
fn create_table(layout: &ResolvedLayout, device: &Utf8Path, sector_size: u64) -> Result<()> {
    Task::new(format!("Wiping partition table on {device}"), "sgdisk")
        .args(["--zap-all", device.as_str()])
        .run()?;
    let count = layout.partitions().len();
    for part in layout.partitions() {
        let physically_last = part.physical_position as usize == count;
        Task::new(
            format!("Creating partition {} ({})", part.spec.slot, part.spec.name),
            "sgdisk",
        )
        .args(sgdisk_partition_args(part, physically_last, sector_size))
        .arg(device.as_str())
        .run()?;
    }
    Task::new(format!("Re-reading partition table on {device}"), "partprobe")
        .arg(device.as_str())
        .run()?;
    Ok(())
}

/// FAT volume labels cap at 11 characters.
fn fat_label(name: &str) -> String {
    name.chars().take(11).collect()
}

/// The mkfs program and arguments for a plan entry, or `None` when no
/// filesystem is wanted. The partition device path is appended by the
/// caller.
fn mkfs_invocation(spec: &PartitionSpec, sector_size: u64) -> Option<(&'static str, Vec<String>)> {
    let r = match spec.filesystem {
        Filesystem::None => return None,
        Filesystem::Fat12 | Filesystem::Fat16 | Filesystem::Fat32 => {
            let width = spec.filesystem.fat_width().unwrap_or(32);
            (
                "mkfs.fat",
                vec![
                    "-F".into(),
                    width.to_string(),
                    "-S".into(),
                    sector_size.to_string(),
                    "-n".into(),
                    fat_label(&spec.name),
                ],
            )
        }
        // Geometry zeroed so the driver defers to the kernel
        Filesystem::Ntfs => (
            "mkfs.ntfs",
            vec![
                "-Q".into(),
                "-L".into(),
                spec.name.clone(),
                "-H".into(),
                "0".into(),
                "-S".into(),
                "0".into(),
                "-p".into(),
                "0".into(),
            ],
        ),
        Filesystem::Ext2 => ("mkfs.ext2", ext_args(spec)),
        Filesystem::Ext3 => ("mkfs.ext3", ext_args(spec)),
        Filesystem::Ext4 => ("mkfs.ext4", ext_args(spec)),
    };
    Some(r)
}

fn ext_args(spec: &PartitionSpec) -> Vec<String> {
    vec!["-q".into(), "-L".into(), spec.name.clone()]
}

/// Create the requested filesystem in every slot, iterating in slot-index
/// order; per-partition addressing goes through the device naming
/// convention.
fn create_filesystems(layout: &ResolvedLayout, device: &Utf8Path, sector_size: u64) -> Result<()> {
    for part in layout.in_slot_order() {
        let Some((program, args)) = mkfs_invocation(&part.spec, sector_size) else {
            continue;
        };
        let path = blockdev::partition_path(device, part.spec.slot);
        Task::new(
            format!("Creating {} filesystem on {path}", part.spec.filesystem),
            program,
        )
        .args(args)
        .arg(path.as_str())
        .run()?;
    }
    Ok(())
}
