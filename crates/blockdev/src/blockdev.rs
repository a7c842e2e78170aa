//! Read-only block device inspection plus the partition naming convention.
//!
//! Everything here observes device state; mutation lives in the
//! provisioning pipeline.

use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use liveforge_utils::CommandRunExt;

/// Fallback when lsblk does not report a sector size.
pub const DEFAULT_SECTOR_SIZE: u64 = 512;

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// A block device (or partition) as reported by `lsblk`.
#[derive(Debug, Deserialize)]
pub struct Device {
    pub name: String,
    /// Size in bytes (lsblk is invoked with `-b`)
    pub size: u64,
    /// Physical sector size in bytes
    #[serde(rename = "phy-sec")]
    pub physical_sector_size: Option<u64>,
    /// Logical sector size in bytes; the unit partition tools count in
    #[serde(rename = "log-sec")]
    pub logical_sector_size: Option<u64>,
    pub label: Option<String>,
    pub fstype: Option<String>,
    pub path: Option<String>,
    // Older util-linux reports a single mountpoint; newer also reports
    // the full list. We look at both.
    pub mountpoint: Option<String>,
    pub mountpoints: Option<Vec<Option<String>>>,
    pub children: Option<Vec<Device>>,
}

impl Device {
    /// Device node path; synthesized from the name when lsblk predates PATH.
    pub fn path(&self) -> Utf8PathBuf {
        self.path
            .clone()
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| Utf8PathBuf::from(format!("/dev/{}", &self.name)))
    }

    pub fn has_children(&self) -> bool {
        self.children.as_ref().is_some_and(|v| !v.is_empty())
    }

    /// Physical sector size, defaulting to 512 when unreported.
    pub fn sector_size(&self) -> u64 {
        self.physical_sector_size.unwrap_or(DEFAULT_SECTOR_SIZE)
    }

    /// Logical sector size, defaulting to 512 when unreported.
    pub fn logical_sector_size(&self) -> u64 {
        self.logical_sector_size.unwrap_or(DEFAULT_SECTOR_SIZE)
    }

    fn own_mountpoints(&self) -> impl Iterator<Item = &str> {
        let single = self.mountpoint.as_deref();
        let multi = self
            .mountpoints
            .iter()
            .flatten()
            .filter_map(|m| m.as_deref());
        single.into_iter().chain(multi)
    }

    /// All `(partition path, mountpoint)` pairs anywhere under this device.
    pub fn mounted_partitions(&self) -> Vec<(Utf8PathBuf, String)> {
        let mut r = Vec::new();
        for child in self.children.iter().flatten() {
            for m in child.own_mountpoints() {
                r.push((child.path(), m.to_owned()));
            }
            r.extend(child.mounted_partitions());
        }
        // lsblk can report the same mountpoint via both fields
        r.sort();
        r.dedup();
        r
    }
}

/// Query a single device via lsblk.
#[context("Listing device {dev}")]
pub fn list_dev(dev: &Utf8Path) -> Result<Device> {
    let mut devs: DevicesOutput = Command::new("lsblk")
        .args(["-J", "-b", "-O"])
        .arg(dev)
        .log_debug()
        .run_and_parse_json()?;
    let result = devs
        .blockdevices
        .drain(..)
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"));
    result
}

/// Map a whole-disk device and a 1-based partition table slot to the
/// partition's device path. Devices whose name ends in a digit get a `p`
/// separator (`/dev/nvme0n1` -> `/dev/nvme0n1p3`), others do not
/// (`/dev/sda` -> `/dev/sda3`).
pub fn partition_path(dev: &Utf8Path, slot: u32) -> Utf8PathBuf {
    let dev = dev.as_str();
    if dev.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{dev}p{slot}").into()
    } else {
        format!("{dev}{slot}").into()
    }
}

/// Parse a size written as a non-negative integer immediately followed by an
/// IEC unit, e.g. `300MiB` or `4GiB`. Bare byte counts take a `B` suffix.
/// The single-letter forms `K`/`M`/`G`/`T` are accepted as their IEC
/// equivalents.
pub fn parse_iec_size(s: &str) -> Result<u64> {
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| anyhow!("Missing unit in size {s:?}"))?;
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        anyhow::bail!("Missing integer in size {s:?}");
    }
    let mul: u64 = match unit {
        "B" => 1,
        "K" | "KiB" => 1 << 10,
        "M" | "MiB" => 1 << 20,
        "G" | "GiB" => 1 << 30,
        "T" | "TiB" => 1 << 40,
        o => anyhow::bail!("Unknown size unit {o:?} in {s:?}"),
    };
    let v = digits
        .parse::<u64>()
        .with_context(|| format!("Parsing size {s:?}"))?;
    v.checked_mul(mul)
        .ok_or_else(|| anyhow!("Size overflow in {s:?}"))
}

/// Render a byte count in the same syntax [`parse_iec_size`] accepts,
/// using the largest unit that divides it exactly.
pub fn format_iec_size(bytes: u64) -> String {
    for (unit, mul) in [("TiB", 1u64 << 40), ("GiB", 1 << 30), ("MiB", 1 << 20), ("KiB", 1 << 10)] {
        if bytes != 0 && bytes % mul == 0 {
            return format!("{}{unit}", bytes / mul);
        }
    }
    format!("{bytes}B")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_partition_path() {
        let cases = [
            ("/dev/sda", 3, "/dev/sda3"),
            ("/dev/nvme0n1", 3, "/dev/nvme0n1p3"),
            ("/dev/loop0", 1, "/dev/loop0p1"),
            ("/dev/mmcblk0", 2, "/dev/mmcblk0p2"),
            ("/dev/vdb", 5, "/dev/vdb5"),
        ];
        for (dev, slot, expected) in cases {
            assert_eq!(partition_path(Utf8Path::new(dev), slot), expected);
        }
    }

    #[test]
    fn test_parse_iec_size() {
        let cases = [
            ("1B", 1),
            ("512B", 512),
            ("1KiB", 1024),
            ("300MiB", 300 * 1024 * 1024),
            ("4GiB", 4 * 1024 * 1024 * 1024),
            ("2TiB", 2u64 << 40),
            ("10M", 10 * 1024 * 1024),
            ("1G", 1 << 30),
        ];
        for (s, v) in cases {
            assert_eq!(parse_iec_size(s).unwrap(), v, "Parsing {s}");
        }
        for bad in ["", "MiB", "10", "10Mib", "10 MiB", "-1MiB", "1.5GiB", "10KB"] {
            assert!(parse_iec_size(bad).is_err(), "Should reject {bad:?}");
        }
    }

    #[test]
    fn test_format_iec_size_roundtrip() {
        for v in [1, 512, 1024, 300 << 20, (4u64 << 30) + 512, 7, 1 << 40] {
            let s = format_iec_size(v);
            assert_eq!(parse_iec_size(&s).unwrap(), v, "{v} -> {s}");
        }
        assert_eq!(format_iec_size(300 << 20), "300MiB");
        assert_eq!(format_iec_size(4 << 30), "4GiB");
        assert_eq!(format_iec_size(1025), "1025B");
    }

    #[test]
    fn test_parse_lsblk() {
        let fixture = include_str!("../tests/fixtures/lsblk.json");
        let devs: DevicesOutput = serde_json::from_str(fixture).unwrap();
        let dev = devs.blockdevices.into_iter().next().unwrap();
        assert_eq!(dev.name, "sdb");
        assert_eq!(dev.size, 15728640000);
        assert_eq!(dev.sector_size(), 512);
        assert!(dev.has_children());
        let mounted = dev.mounted_partitions();
        assert_eq!(mounted.len(), 1);
        assert_eq!(mounted[0].0, "/dev/sdb2");
        assert_eq!(mounted[0].1, "/run/media/user/stick");
    }

    #[test]
    fn test_mounted_partitions_empty() {
        let fixture = indoc::indoc! { r#"
        {
           "blockdevices": [
              {"name": "sdc", "size": 8000000000, "phy-sec": 4096,
               "label": null, "fstype": null, "path": "/dev/sdc",
               "mountpoint": null, "mountpoints": [null], "children": []}
           ]
        }
        "# };
        let devs: DevicesOutput = serde_json::from_str(fixture).unwrap();
        let dev = &devs.blockdevices[0];
        assert_eq!(dev.sector_size(), 4096);
        assert!(!dev.has_children());
        assert!(dev.mounted_partitions().is_empty());
    }
}
