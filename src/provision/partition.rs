//! Partition layout of the device's boot disk.
//!
//! The disk carries two A/B slot pairs: root A (3) with kernel A (2) and
//! root B (5) with kernel B (4). Provisioning always writes the slot that is
//! not currently booted.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{Error, Result};

pub const PARTITION_NUM_KERNEL_A: &str = "2";
pub const PARTITION_NUM_KERNEL_B: &str = "4";
pub const PARTITION_NUM_ROOT_A: &str = "3";
pub const PARTITION_NUM_ROOT_B: &str = "5";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub active_root: String,
    pub inactive_root: String,
    pub active_kernel: String,
    pub inactive_kernel: String,
}

/// DLC image slot paired with a root partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlcSlot {
    A,
    B,
}

impl DlcSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlcSlot::A => "dlc_a",
            DlcSlot::B => "dlc_b",
        }
    }

    /// Slot in use while booted from `root_part`.
    pub fn active_for(root_part: &str) -> Result<Self> {
        match root_part {
            PARTITION_NUM_ROOT_A => Ok(DlcSlot::A),
            PARTITION_NUM_ROOT_B => Ok(DlcSlot::B),
            other => Err(Error::InvalidPartition(other.to_string())),
        }
    }

    /// Slot written while booted from `root_part`.
    pub fn inactive_for(root_part: &str) -> Result<Self> {
        Self::active_for(root_part).map(|slot| slot.other())
    }

    pub fn other(&self) -> Self {
        match self {
            DlcSlot::A => DlcSlot::B,
            DlcSlot::B => DlcSlot::A,
        }
    }
}

impl std::fmt::Display for DlcSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

static PARTITION_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9]+)$").expect("partition regex is valid"));

/// Extracts the root partition number from a device path such as
/// `/dev/nvme0n1p3` or `/dev/sda3`. Only the two root slots are accepted.
pub fn root_part_number(root: &str) -> Result<String> {
    let number = PARTITION_NUMBER
        .captures(root.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| Error::InvalidPartition(format!("none found in {}", root)))?;

    match number {
        PARTITION_NUM_ROOT_A | PARTITION_NUM_ROOT_B => Ok(number.to_string()),
        other => Err(Error::InvalidPartition(other.to_string())),
    }
}

/// Computes the slot layout from `rootdev -s` and `rootdev -s -d` output.
///
/// Disks whose name ends in a digit (`/dev/nvme0n1`, `/dev/mmcblk0`) name
/// their partitions with a `p` separator.
pub fn partition_info(root: &str, disk: &str, root_part: &str) -> Result<PartitionInfo> {
    let disk = disk.trim();
    let delimiter = if disk.ends_with(|c: char| c.is_ascii_digit()) {
        "p"
    } else {
        ""
    };
    let part = |number: &str| format!("{}{}{}", disk, delimiter, number);

    match root_part {
        PARTITION_NUM_ROOT_A => Ok(PartitionInfo {
            active_root: root.trim().to_string(),
            inactive_root: part(PARTITION_NUM_ROOT_B),
            active_kernel: part(PARTITION_NUM_KERNEL_A),
            inactive_kernel: part(PARTITION_NUM_KERNEL_B),
        }),
        PARTITION_NUM_ROOT_B => Ok(PartitionInfo {
            active_root: root.trim().to_string(),
            inactive_root: part(PARTITION_NUM_ROOT_A),
            active_kernel: part(PARTITION_NUM_KERNEL_B),
            inactive_kernel: part(PARTITION_NUM_KERNEL_A),
        }),
        other => Err(Error::InvalidPartition(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_part_number() {
        assert_eq!(root_part_number("/dev/nvme0n1p3").unwrap(), "3");
        assert_eq!(root_part_number("/dev/sda3").unwrap(), "3");
        assert_eq!(root_part_number("/dev/mmcblk0p5\n").unwrap(), "5");
    }

    #[test]
    fn test_root_part_number_rejects_other_slots() {
        for root in ["/dev/sda1", "/dev/mmcblk0p13", "/dev/sda", "/dev/nvme0n1p4"] {
            let err = root_part_number(root).unwrap_err();
            assert!(err.is_fatal(), "{} should be fatal", root);
        }
    }

    #[test]
    fn test_partition_info_nvme() {
        let info = partition_info("/dev/nvme0n1p3", "/dev/nvme0n1", "3").unwrap();
        assert_eq!(
            info,
            PartitionInfo {
                active_root: "/dev/nvme0n1p3".to_string(),
                inactive_root: "/dev/nvme0n1p5".to_string(),
                active_kernel: "/dev/nvme0n1p2".to_string(),
                inactive_kernel: "/dev/nvme0n1p4".to_string(),
            }
        );
    }

    #[test]
    fn test_partition_info_sata_slot_b() {
        let info = partition_info("/dev/sda5", "/dev/sda", "5").unwrap();
        assert_eq!(info.inactive_root, "/dev/sda3");
        assert_eq!(info.active_kernel, "/dev/sda4");
        assert_eq!(info.inactive_kernel, "/dev/sda2");
    }

    #[test]
    fn test_dlc_slots() {
        assert_eq!(DlcSlot::active_for("3").unwrap(), DlcSlot::A);
        assert_eq!(DlcSlot::inactive_for("3").unwrap().as_str(), "dlc_b");
        assert_eq!(DlcSlot::inactive_for("5").unwrap().as_str(), "dlc_a");
        assert!(DlcSlot::inactive_for("7").is_err());
    }
}
