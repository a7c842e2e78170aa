//! The declarative partition plan: one entry per partition, carrying both
//! the partition table slot and (by position in the plan) the physical
//! creation order. These two orderings are deliberately independent; see
//! [`crate::layout`] for how they are resolved against a concrete device.

use std::fmt::Display;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use uuid::Uuid;

use crate::error::ProvisionError;
use crate::parsers::plan_line;

/// The closed set of filesystems a plan entry may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filesystem {
    /// No filesystem is created (e.g. the BIOS boot partition).
    None,
    Fat12,
    Fat16,
    Fat32,
    Ntfs,
    Ext2,
    Ext3,
    Ext4,
}

impl Filesystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Fat12 => "fat12",
            Self::Fat16 => "fat16",
            Self::Fat32 => "fat32",
            Self::Ntfs => "ntfs",
            Self::Ext2 => "ext2",
            Self::Ext3 => "ext3",
            Self::Ext4 => "ext4",
        }
    }

    /// The FAT bit width for the `fat*` family.
    pub fn fat_width(&self) -> Option<u32> {
        match self {
            Self::Fat12 => Some(12),
            Self::Fat16 => Some(16),
            Self::Fat32 => Some(32),
            _ => None,
        }
    }

    pub fn is_ext(&self) -> bool {
        matches!(self, Self::Ext2 | Self::Ext3 | Self::Ext4)
    }
}

impl FromStr for Filesystem {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let r = match s {
            "none" => Self::None,
            "fat12" => Self::Fat12,
            "fat16" => Self::Fat16,
            "fat32" => Self::Fat32,
            "ntfs" => Self::Ntfs,
            "ext2" => Self::Ext2,
            "ext3" => Self::Ext3,
            "ext4" => Self::Ext4,
            o => return Err(ProvisionError::UnsupportedFilesystem(o.to_owned())),
        };
        Ok(r)
    }
}

impl Display for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A partition size as written in the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartSize {
    /// A concrete, positive byte count.
    Bytes(u64),
    /// The plan-text literal `0`: consume all capacity not claimed by
    /// other entries.
    Remaining,
}

impl PartSize {
    /// Parse the plan-text size syntax: `0`, or a positive integer with an
    /// IEC unit.
    pub fn parse(s: &str) -> Result<Self> {
        if s == "0" {
            return Ok(Self::Remaining);
        }
        let bytes = liveforge_blockdev::parse_iec_size(s)?;
        if bytes == 0 {
            return Err(anyhow!("partition size must be positive (use 0 for remaining space)"));
        }
        Ok(Self::Bytes(bytes))
    }

    pub fn is_remaining(&self) -> bool {
        matches!(self, Self::Remaining)
    }
}

impl Display for PartSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remaining => f.write_str("0"),
            Self::Bytes(n) => f.write_str(&liveforge_blockdev::format_iec_size(*n)),
        }
    }
}

/// A set of GPT attribute bits, each in `0..=63`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GptFlags(u64);

impl GptFlags {
    /// Highest valid attribute bit.
    pub const MAX: u8 = 63;

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Construct from a raw bitmask; bit `n` of the mask is attribute `n`.
    pub const fn from_mask(mask: u64) -> Self {
        Self(mask)
    }

    /// Set an attribute bit, rejecting values outside `0..=63`.
    pub fn insert(&mut self, bit: u8) -> Result<()> {
        if bit > Self::MAX {
            return Err(anyhow!("attribute bit {bit} out of range 0..=63"));
        }
        self.0 |= 1 << bit;
        Ok(())
    }

    pub fn contains(&self, bit: u8) -> bool {
        bit <= Self::MAX && self.0 & (1 << bit) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate the set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=Self::MAX).filter(|bit| self.contains(*bit))
    }
}

/// One partition plan entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    /// 1-based position in the on-disk partition table. Independent of
    /// this entry's position in the plan.
    pub slot: u32,
    /// Human-readable GPT partition name, also used as the filesystem
    /// volume label for NTFS and the ext family.
    pub name: String,
    /// GPT partition type identifier.
    pub type_guid: Uuid,
    pub filesystem: Filesystem,
    pub size: PartSize,
    pub flags: GptFlags,
}

impl PartitionSpec {
    /// Parse a single plan line (already stripped of comments/blank lines).
    /// Errors are field-scoped reasons without line context; the caller
    /// attaches the line number.
    fn parse_entry(line: &str) -> Result<Self, String> {
        let fields = plan_line::split_fields(line)?;
        if fields.len() < 5 {
            return Err(format!(
                "expected at least 5 fields (SLOT_INDEX NAME TYPE_ID FILESYSTEM SIZE), found {}",
                fields.len()
            ));
        }
        let slot: u32 = fields[0]
            .parse()
            .map_err(|_| format!("field SLOT_INDEX: not a positive integer: {:?}", fields[0]))?;
        if slot == 0 {
            return Err("field SLOT_INDEX: slot indices are 1-based".into());
        }
        let name = fields[1].clone();
        let type_guid = Uuid::parse_str(&fields[2])
            .map_err(|e| format!("field TYPE_ID: {e}"))?;
        let filesystem = Filesystem::from_str(&fields[3])
            .map_err(|e| format!("field FILESYSTEM: {e}"))?;
        let size = PartSize::parse(&fields[4]).map_err(|e| format!("field SIZE: {e}"))?;
        let mut flags = GptFlags::empty();
        for tok in &fields[5..] {
            let bit: u8 = tok
                .parse()
                .map_err(|_| format!("field FLAG: not an integer in 0..=63: {tok:?}"))?;
            flags.insert(bit).map_err(|e| format!("field FLAG: {e}"))?;
        }
        Ok(Self {
            slot,
            name,
            type_guid,
            filesystem,
            size,
            flags,
        })
    }
}

impl Display for PartitionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.slot,
            plan_line::escape_field(&self.name),
            self.type_guid,
            self.filesystem,
            self.size
        )?;
        for bit in self.flags.iter() {
            write!(f, " {bit}")?;
        }
        Ok(())
    }
}

/// An ordered sequence of plan entries. The sequence order is the physical
/// creation order on the device, which is intentionally decoupled from the
/// entries' table slots.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionPlan {
    entries: Vec<PartitionSpec>,
}

impl PartitionPlan {
    pub fn new(entries: Vec<PartitionSpec>) -> Self {
        Self { entries }
    }

    /// Parse plan text: one entry per line, `#` comments and blank lines
    /// skipped. Only line-level syntax is validated here; whole-plan
    /// invariants (slot permutation, single remaining-space entry) are the
    /// layout resolver's responsibility since they need plan-wide context.
    pub fn parse(text: &str) -> Result<Self, ProvisionError> {
        let mut entries = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let entry = PartitionSpec::parse_entry(line)
                .map_err(|reason| ProvisionError::malformed(idx + 1, reason))?;
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[PartitionSpec] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Display for PartitionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{entry}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::layout::partition_types;

    const MIB: u64 = 1 << 20;

    fn parse_err(text: &str) -> ProvisionError {
        PartitionPlan::parse(text).unwrap_err()
    }

    #[test]
    fn test_parse_basic_plan() {
        let text = indoc::indoc! { "
            # storage first physically, slot 1
            1 storage ebd0a0a2-b9e5-4433-87c0-68b6b72699c7 ntfs 0
            2 bios 21686148-6449-6e6f-744e-656564454649 none 1MiB 2

            3 EFI c12a7328-f81f-11d2-ba4b-00a0c93ec93b fat32 300MiB
        " };
        let plan = PartitionPlan::parse(text).unwrap();
        assert_eq!(plan.len(), 3);
        let storage = &plan.entries()[0];
        assert_eq!(storage.slot, 1);
        assert_eq!(storage.name, "storage");
        assert_eq!(storage.filesystem, Filesystem::Ntfs);
        assert!(storage.size.is_remaining());
        assert!(storage.flags.is_empty());
        let bios = &plan.entries()[1];
        assert_eq!(bios.size, PartSize::Bytes(MIB));
        assert!(bios.flags.contains(2));
        assert_eq!(bios.flags.iter().collect::<Vec<_>>(), vec![2]);
        let efi = &plan.entries()[2];
        assert_eq!(efi.size, PartSize::Bytes(300 * MIB));
        assert_eq!(efi.type_guid, partition_types::EFI_SYSTEM);
    }

    #[test]
    fn test_parse_escaped_name() {
        let text = r"4 My\ Data 0fc63daf-8483-4772-8e79-3d69d8477de4 ext4 2GiB";
        let plan = PartitionPlan::parse(text).unwrap();
        assert_eq!(plan.entries()[0].name, "My Data");
    }

    #[test]
    fn test_parse_rejects_field_count() {
        let e = parse_err("1 root 0fc63daf-8483-4772-8e79-3d69d8477de4 ext4");
        match e {
            ProvisionError::MalformedPlan { line, reason } => {
                assert_eq!(line, 1);
                assert!(reason.contains("5 fields"), "{reason}");
            }
            o => panic!("wrong error {o}"),
        }
    }

    #[test]
    fn test_parse_rejects_bad_size() {
        for bad in ["12", "12Q", "MiB", "0B", "-4GiB"] {
            let text = format!("1 root 0fc63daf-8483-4772-8e79-3d69d8477de4 ext4 {bad}");
            let e = parse_err(&text);
            assert!(
                matches!(&e, ProvisionError::MalformedPlan { reason, .. } if reason.contains("SIZE")),
                "size {bad:?} gave {e}"
            );
        }
    }

    #[test]
    fn test_parse_rejects_unknown_filesystem() {
        let e = parse_err("1 root 0fc63daf-8483-4772-8e79-3d69d8477de4 btrfs 4GiB");
        match e {
            ProvisionError::MalformedPlan { line: 1, reason } => {
                assert!(reason.contains("btrfs"), "{reason}");
            }
            o => panic!("wrong error {o}"),
        }
    }

    #[test]
    fn test_parse_rejects_flag_out_of_range() {
        let e = parse_err("1 root 0fc63daf-8483-4772-8e79-3d69d8477de4 ext4 4GiB 64");
        assert!(
            matches!(&e, ProvisionError::MalformedPlan { reason, .. } if reason.contains("64")),
            "{e}"
        );
    }

    #[test]
    fn test_parse_rejects_zero_slot() {
        let e = parse_err("0 root 0fc63daf-8483-4772-8e79-3d69d8477de4 ext4 4GiB");
        assert!(
            matches!(&e, ProvisionError::MalformedPlan { reason, .. } if reason.contains("1-based")),
            "{e}"
        );
    }

    #[test]
    fn test_error_reports_real_line_number() {
        let text = "# comment\n\n3 root 0fc63daf-8483-4772-8e79-3d69d8477de4 ext4 nope\n";
        match parse_err(text) {
            ProvisionError::MalformedPlan { line, .. } => assert_eq!(line, 3),
            o => panic!("wrong error {o}"),
        }
    }

    #[test]
    fn test_roundtrip_display_parse() {
        let text = indoc::indoc! { "
            2 bios 21686148-6449-6e6f-744e-656564454649 none 1MiB 2
            1 My\\ Storage ebd0a0a2-b9e5-4433-87c0-68b6b72699c7 ntfs 0
            3 root 0fc63daf-8483-4772-8e79-3d69d8477de4 ext4 1050MiB
        " };
        let plan = PartitionPlan::parse(text).unwrap();
        let rendered = plan.to_string();
        let reparsed = PartitionPlan::parse(&rendered).unwrap();
        assert_eq!(plan, reparsed);
    }

    #[test]
    fn test_part_size_display() {
        assert_eq!(PartSize::Remaining.to_string(), "0");
        assert_eq!(PartSize::Bytes(300 * MIB).to_string(), "300MiB");
        assert_eq!(PartSize::Bytes(4 << 30).to_string(), "4GiB");
    }

    #[test]
    fn test_filesystem_from_str() {
        assert_eq!(Filesystem::from_str("ext4").unwrap(), Filesystem::Ext4);
        assert_eq!(Filesystem::from_str("fat32").unwrap().fat_width(), Some(32));
        assert!(Filesystem::from_str("none").unwrap().fat_width().is_none());
        let e = Filesystem::from_str("zfs").unwrap_err();
        assert!(matches!(e, ProvisionError::UnsupportedFilesystem(ref s) if s == "zfs"));
    }
}
