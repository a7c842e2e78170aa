//! Resolving a partition plan against a concrete device: whole-plan
//! validation, size resolution, and the builtin layout policies.
//!
//! A plan carries two independent orderings. The sequence order of its
//! entries is the physical creation order (first entry = first extent on
//! the device); each entry's slot index is its position in the partition
//! table. The default layout uses this to put the Windows-compatible
//! storage partition physically first, where firmware and other operating
//! systems expect to find a data partition.

use uuid::Uuid;

use crate::error::{ProvisionError, Result};
use crate::plan::{Filesystem, GptFlags, PartSize, PartitionPlan, PartitionSpec};

pub const MIB: u64 = 1 << 20;
pub const GIB: u64 = 1 << 30;

/// Well-known GPT partition type identifiers.
pub mod partition_types {
    use uuid::{uuid, Uuid};

    pub const BIOS_BOOT: Uuid = uuid!("21686148-6449-6e6f-744e-656564454649");
    pub const EFI_SYSTEM: Uuid = uuid!("c12a7328-f81f-11d2-ba4b-00a0c93ec93b");
    pub const LINUX_FILESYSTEM: Uuid = uuid!("0fc63daf-8483-4772-8e79-3d69d8477de4");
    pub const MICROSOFT_BASIC_DATA: Uuid = uuid!("ebd0a0a2-b9e5-4433-87c0-68b6b72699c7");
}

/// GPT attribute bit 2: legacy BIOS bootable.
const LEGACY_BIOS_BOOTABLE: u8 = 2;

/// Partition name of the writable state partition; the live system finds
/// it by this label.
pub const PERSISTENCE_NAME: &str = "persistence";
const STORAGE_NAME: &str = "storage";
const BIOS_NAME: &str = "bios";
const EFI_NAME: &str = "EFI";
const ROOT_NAME: &str = "root";

const BIOS_BOOT_SIZE: u64 = MIB;
const EFI_SIZE: u64 = 300 * MIB;
/// Default size of the persistence partition when not overridden.
pub const DEFAULT_PERSISTENCE_SIZE: u64 = 4 * GIB;

/// Capacity reserved for the partition table itself: leading alignment
/// plus the backup table at the end of the device.
const TABLE_OVERHEAD: u64 = 2 * MIB;
/// Alignment slack reserved per partition.
const ALIGN_SLACK: u64 = MIB;

/// Bytes withheld from allocation for the table and alignment padding.
pub fn reserved_overhead(partitions: usize) -> u64 {
    TABLE_OVERHEAD + partitions as u64 * ALIGN_SLACK
}

/// How the root partition size is determined.
#[derive(Debug, Clone, Copy)]
pub enum RootSize {
    /// An explicit override, in bytes.
    Explicit(u64),
    /// Derived from the OS image size: 105% of it (headroom for filesystem
    /// metadata), floored to whole mebibytes.
    FromImage(u64),
}

impl RootSize {
    pub fn bytes(&self) -> u64 {
        match self {
            Self::Explicit(n) => *n,
            Self::FromImage(image) => image * 21 / 20 / MIB * MIB,
        }
    }
}

/// Inputs to the builtin layout policies.
#[derive(Debug, Clone, Copy)]
pub struct LayoutOptions {
    pub root_size: RootSize,
    /// Size of the persistence partition where the policy gives it a fixed
    /// size (the default layout).
    pub persistence_size: u64,
    /// Filesystem for the Windows-compatible storage partition.
    pub storage_filesystem: Filesystem,
}

/// The builtin layouts. These are fixed permutations; anything else goes
/// through an explicit plan file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutPolicy {
    /// storage (physically first, consuming leftover space), bios, EFI,
    /// root, persistence.
    Default,
    /// No Windows-compatible partition; persistence absorbs the leftover
    /// space.
    NoStorage,
    /// No persistence partition; storage absorbs the leftover space.
    NoPersistence,
}

impl LayoutPolicy {
    /// Select a policy from the two independent user choices. Requesting
    /// neither a storage partition nor any persistence would leave the
    /// remaining capacity unassigned, which is rejected as a usage error
    /// rather than silently ignored.
    pub fn select(storage_requested: bool, persistence_size_is_zero: bool) -> Result<Self> {
        match (storage_requested, persistence_size_is_zero) {
            (true, false) => Ok(Self::Default),
            (false, false) => Ok(Self::NoStorage),
            (true, true) => Ok(Self::NoPersistence),
            (false, true) => Err(ProvisionError::invalid(
                "disabling the storage partition and setting persistence size to zero \
                 would leave the remaining device capacity unassigned",
            )),
        }
    }

    /// Build the plan for this policy. Entry order is physical creation
    /// order; slot indices are the table positions.
    pub fn plan(&self, opts: &LayoutOptions) -> PartitionPlan {
        let root = opts.root_size.bytes();
        let entries = match self {
            Self::Default => vec![
                storage_entry(1, opts.storage_filesystem, PartSize::Remaining),
                bios_entry(2),
                efi_entry(3),
                root_entry(4, PartSize::Bytes(root)),
                persistence_entry(5, PartSize::Bytes(opts.persistence_size)),
            ],
            Self::NoStorage => vec![
                bios_entry(1),
                efi_entry(2),
                root_entry(3, PartSize::Bytes(root)),
                persistence_entry(4, PartSize::Remaining),
            ],
            Self::NoPersistence => vec![
                storage_entry(1, opts.storage_filesystem, PartSize::Remaining),
                bios_entry(2),
                efi_entry(3),
                root_entry(4, PartSize::Bytes(root)),
            ],
        };
        PartitionPlan::new(entries)
    }
}

fn storage_entry(slot: u32, filesystem: Filesystem, size: PartSize) -> PartitionSpec {
    PartitionSpec {
        slot,
        name: STORAGE_NAME.into(),
        type_guid: partition_types::MICROSOFT_BASIC_DATA,
        filesystem,
        size,
        flags: GptFlags::empty(),
    }
}

fn bios_entry(slot: u32) -> PartitionSpec {
    PartitionSpec {
        slot,
        name: BIOS_NAME.into(),
        type_guid: partition_types::BIOS_BOOT,
        filesystem: Filesystem::None,
        size: PartSize::Bytes(BIOS_BOOT_SIZE),
        flags: GptFlags::from_mask(1 << LEGACY_BIOS_BOOTABLE),
    }
}

fn efi_entry(slot: u32) -> PartitionSpec {
    PartitionSpec {
        slot,
        name: EFI_NAME.into(),
        type_guid: partition_types::EFI_SYSTEM,
        filesystem: Filesystem::Fat32,
        size: PartSize::Bytes(EFI_SIZE),
        flags: GptFlags::empty(),
    }
}

fn root_entry(slot: u32, size: PartSize) -> PartitionSpec {
    PartitionSpec {
        slot,
        name: ROOT_NAME.into(),
        type_guid: partition_types::LINUX_FILESYSTEM,
        filesystem: Filesystem::Ext4,
        size,
        flags: GptFlags::empty(),
    }
}

fn persistence_entry(slot: u32, size: PartSize) -> PartitionSpec {
    PartitionSpec {
        slot,
        name: PERSISTENCE_NAME.into(),
        type_guid: partition_types::LINUX_FILESYSTEM,
        filesystem: Filesystem::Ext4,
        size,
        flags: GptFlags::empty(),
    }
}

/// A plan entry bound to a concrete byte size and its physical creation
/// position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPartition {
    pub spec: PartitionSpec,
    /// Concrete size in bytes; for a remaining-space entry this is the
    /// leftover capacity.
    pub size: u64,
    /// 1-based position in the physical creation order.
    pub physical_position: u32,
}

impl ResolvedPartition {
    pub fn is_remaining(&self) -> bool {
        self.spec.size.is_remaining()
    }
}

/// A fully resolved layout. Created once per run and never mutated; any
/// resize starts a fresh resolution.
#[derive(Debug, Clone)]
pub struct ResolvedLayout {
    // Physical creation order
    parts: Vec<ResolvedPartition>,
    device_capacity: u64,
    reserved_overhead: u64,
}

impl ResolvedLayout {
    /// Validate the whole plan and fix every size against the device
    /// capacity. This performs the checks that need plan-wide context:
    /// slot indices must be a permutation of `1..=N`, at most one entry
    /// may consume the remaining space, and the fixed demand must fit.
    pub fn resolve(plan: &PartitionPlan, device_capacity: u64) -> Result<Self> {
        let n = plan.len();
        if n == 0 {
            return Err(ProvisionError::invalid("plan has no entries"));
        }
        let mut seen = vec![false; n];
        for entry in plan.entries() {
            let slot = entry.slot as usize;
            if slot < 1 || slot > n {
                return Err(ProvisionError::invalid(format!(
                    "slot index {slot} outside 1..={n}; slots must be a contiguous range"
                )));
            }
            if seen[slot - 1] {
                return Err(ProvisionError::invalid(format!(
                    "duplicate slot index {slot}"
                )));
            }
            seen[slot - 1] = true;
        }

        let remaining_count = plan
            .entries()
            .iter()
            .filter(|e| e.size.is_remaining())
            .count();
        if remaining_count > 1 {
            return Err(ProvisionError::invalid(
                "more than one entry requests the remaining space",
            ));
        }

        let reserved = reserved_overhead(n);
        let mut fixed: u64 = 0;
        for entry in plan.entries() {
            if let PartSize::Bytes(b) = entry.size {
                fixed = fixed
                    .checked_add(b)
                    .ok_or_else(|| ProvisionError::invalid("plan sizes overflow"))?;
            }
        }
        let claimed = fixed
            .checked_add(reserved)
            .ok_or_else(|| ProvisionError::invalid("plan sizes overflow"))?;
        if claimed > device_capacity {
            return Err(ProvisionError::invalid(format!(
                "plan requires {claimed} bytes ({fixed} fixed + {reserved} reserved) \
                 but the device only has {device_capacity}"
            )));
        }
        let leftover = device_capacity - claimed;
        if remaining_count == 1 && leftover == 0 {
            return Err(ProvisionError::invalid(
                "no capacity left for the remaining-space entry",
            ));
        }

        let parts = plan
            .entries()
            .iter()
            .enumerate()
            .map(|(i, spec)| ResolvedPartition {
                size: match spec.size {
                    PartSize::Bytes(b) => b,
                    PartSize::Remaining => leftover,
                },
                physical_position: (i + 1) as u32,
                spec: spec.clone(),
            })
            .collect();
        Ok(Self {
            parts,
            device_capacity,
            reserved_overhead: reserved,
        })
    }

    /// Partitions in physical creation order.
    pub fn partitions(&self) -> &[ResolvedPartition] {
        &self.parts
    }

    /// Partitions in slot-index order.
    pub fn in_slot_order(&self) -> Vec<&ResolvedPartition> {
        let mut r: Vec<_> = self.parts.iter().collect();
        r.sort_by_key(|p| p.spec.slot);
        r
    }

    pub fn device_capacity(&self) -> u64 {
        self.device_capacity
    }

    pub fn reserved_overhead(&self) -> u64 {
        self.reserved_overhead
    }

    fn find_by_type(&self, type_guid: Uuid) -> Option<&ResolvedPartition> {
        self.parts.iter().find(|p| p.spec.type_guid == type_guid)
    }

    /// The partition holding boot files and the bootloader configuration
    /// (the EFI system partition).
    pub fn boot_partition(&self) -> Result<&ResolvedPartition> {
        self.find_by_type(partition_types::EFI_SYSTEM)
            .ok_or_else(|| ProvisionError::invalid("plan has no EFI system partition"))
    }

    /// The BIOS boot partition targeted by the bootloader installer.
    pub fn bios_partition(&self) -> Result<&ResolvedPartition> {
        self.find_by_type(partition_types::BIOS_BOOT)
            .ok_or_else(|| ProvisionError::invalid("plan has no BIOS boot partition"))
    }

    /// The partition receiving the OS payload: the entry named `root`, or
    /// failing that the first ext-family partition that is not the
    /// persistence partition.
    pub fn root_partition(&self) -> Result<&ResolvedPartition> {
        self.parts
            .iter()
            .find(|p| p.spec.name == ROOT_NAME)
            .or_else(|| {
                self.parts.iter().find(|p| {
                    p.spec.filesystem.is_ext() && p.spec.name != PERSISTENCE_NAME
                })
            })
            .ok_or_else(|| ProvisionError::invalid("plan has no root partition"))
    }

    pub fn persistence_partition(&self) -> Option<&ResolvedPartition> {
        self.parts.iter().find(|p| p.spec.name == PERSISTENCE_NAME)
    }

    /// Convert back to a plan whose sizes are all concrete.
    pub fn to_plan(&self) -> PartitionPlan {
        let entries = self
            .parts
            .iter()
            .map(|p| PartitionSpec {
                size: PartSize::Bytes(p.size),
                ..p.spec.clone()
            })
            .collect();
        PartitionPlan::new(entries)
    }
}
