//! A/B slot bookkeeping.
//!
//! The kernel and root partitions of a device come in two well-known pairs,
//! and MiniOS has its own independent pair. Given the partition the device is
//! currently running from, we compute which pair is active and which one is
//! the target of an update.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{ImagerError, Result};

/// The kind of partition an updater writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRole {
    /// Kernel partition
    Kernel,
    /// Root filesystem partition
    Rootfs,
    /// MiniOS recovery partition
    MiniOS,
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionRole::Kernel => "kernel",
            PartitionRole::Rootfs => "root",
            PartitionRole::MiniOS => "minios",
        };
        f.write_str(s)
    }
}

/// One of the two redundant copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// The first copy
    A,
    /// The second copy
    B,
}

impl Slot {
    /// The other slot.
    pub fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    /// Parse the value reported by `crossystem minios_priority`.
    pub fn from_priority(s: &str) -> Option<Self> {
        match s.trim() {
            "A" => Some(Slot::A),
            "B" => Some(Slot::B),
            _ => None,
        }
    }

    /// The value understood by `crossystem minios_priority=`.
    pub fn as_priority(self) -> &'static str {
        match self {
            Slot::A => "A",
            Slot::B => "B",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_priority())
    }
}

/// A mapping from partition role to partition number for one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSet {
    slot: Slot,
    partitions: &'static [(PartitionRole, u32)],
}

impl SlotSet {
    /// Which copy this set describes.
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// The partition number for `role`, if this set carries it.
    pub fn get(&self, role: PartitionRole) -> Option<u32> {
        self.partitions
            .iter()
            .find_map(|&(r, n)| (r == role).then_some(n))
    }
}

impl fmt::Display for SlotSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.slot)?;
        for (i, (role, n)) in self.partitions.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{role}={n}")?;
        }
        f.write_str(")")
    }
}

/// Kernel and root partitions of slot A.
pub const KERNEL_A: SlotSet = SlotSet {
    slot: Slot::A,
    partitions: &[(PartitionRole::Kernel, 2), (PartitionRole::Rootfs, 3)],
};
/// Kernel and root partitions of slot B.
pub const KERNEL_B: SlotSet = SlotSet {
    slot: Slot::B,
    partitions: &[(PartitionRole::Kernel, 4), (PartitionRole::Rootfs, 5)],
};
/// MiniOS partition of slot A.
pub const MINIOS_A: SlotSet = SlotSet {
    slot: Slot::A,
    partitions: &[(PartitionRole::MiniOS, 9)],
};
/// MiniOS partition of slot B.
pub const MINIOS_B: SlotSet = SlotSet {
    slot: Slot::B,
    partitions: &[(PartitionRole::MiniOS, 10)],
};

/// The active and inactive slot sets of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSlots {
    /// The block device prefix, e.g. `/dev/mmcblk0p`.
    pub prefix: String,
    /// The slot currently running.
    pub active: SlotSet,
    /// The slot an update targets.
    pub inactive: SlotSet,
}

impl ResolvedSlots {
    /// Path to the partition for `role` in `set`, e.g. `/dev/mmcblk0p5`.
    pub fn path(&self, set: &SlotSet, role: PartitionRole) -> Option<Utf8PathBuf> {
        set.get(role)
            .map(|n| Utf8PathBuf::from(format!("{}{n}", self.prefix)))
    }
}

/// Splits a block device path into its prefix and trailing partition number,
/// e.g. `/dev/mmcblk0p3` -> (`/dev/mmcblk0p`, 3).
pub fn split_dev_path(path: &Utf8Path) -> Result<(String, u32)> {
    let s = path.as_str();
    let prefix = s.trim_end_matches(|c: char| c.is_ascii_digit());
    let number = &s[prefix.len()..];
    match number.parse() {
        Ok(n) => Ok((prefix.to_string(), n)),
        Err(_) => Err(ImagerError::MalformedDevicePath(s.to_string())),
    }
}

/// Returns the (active, inactive) kernel/root slot sets given the active root partition number.
pub fn kernel_slots(root_num: u32) -> Result<(SlotSet, SlotSet)> {
    if Some(root_num) == KERNEL_A.get(PartitionRole::Rootfs) {
        Ok((KERNEL_A, KERNEL_B))
    } else if Some(root_num) == KERNEL_B.get(PartitionRole::Rootfs) {
        Ok((KERNEL_B, KERNEL_A))
    } else {
        Err(ImagerError::UnknownSlot {
            role: PartitionRole::Rootfs,
            number: root_num,
        })
    }
}

/// Returns the (active, inactive) MiniOS slot sets given the slot that
/// currently holds MiniOS priority.
pub fn minios_slots(priority: Slot) -> (SlotSet, SlotSet) {
    match priority {
        Slot::A => (MINIOS_A, MINIOS_B),
        Slot::B => (MINIOS_B, MINIOS_A),
    }
}

/// Resolve the active/inactive slots from the device's current root device.
pub fn resolve(root_dev: &Utf8Path) -> Result<ResolvedSlots> {
    let (prefix, root_num) = split_dev_path(root_dev)?;
    let (active, inactive) = kernel_slots(root_num)?;
    tracing::debug!("Active slot {active}, target slot {inactive}");
    Ok(ResolvedSlots {
        prefix,
        active,
        inactive,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_split_dev_path() {
        let cases = [
            ("/dev/mmcblk0p3", "/dev/mmcblk0p", 3),
            ("/dev/sda5", "/dev/sda", 5),
            ("/dev/nvme0n1p12", "/dev/nvme0n1p", 12),
        ];
        for (path, prefix, n) in cases {
            assert_eq!(
                split_dev_path(Utf8Path::new(path)).unwrap(),
                (prefix.to_string(), n),
                "{path}"
            );
        }
        for path in ["/dev/sda", "", "/dev/mmcblk0p"] {
            assert!(matches!(
                split_dev_path(Utf8Path::new(path)),
                Err(ImagerError::MalformedDevicePath(_))
            ));
        }
    }

    #[test]
    fn test_complementary() {
        for prefix in ["/dev/sda", "/dev/mmcblk0p", "/dev/nvme0n1p"] {
            let a = resolve(Utf8Path::new(&format!("{prefix}3"))).unwrap();
            assert_eq!(a.active, KERNEL_A);
            assert_eq!(a.inactive, KERNEL_B);
            let b = resolve(Utf8Path::new(&format!("{prefix}5"))).unwrap();
            assert_eq!(b.active, KERNEL_B);
            assert_eq!(b.inactive, KERNEL_A);
            for r in [a, b] {
                assert_ne!(r.active, r.inactive);
                assert_eq!(r.active.slot().other(), r.inactive.slot());
            }
        }
    }

    #[test]
    fn test_paths() {
        let r = resolve(Utf8Path::new("/dev/mmcblk0p3")).unwrap();
        assert_eq!(
            r.path(&r.inactive, PartitionRole::Rootfs).unwrap(),
            "/dev/mmcblk0p5"
        );
        assert_eq!(
            r.path(&r.inactive, PartitionRole::Kernel).unwrap(),
            "/dev/mmcblk0p4"
        );
        assert!(r.path(&r.inactive, PartitionRole::MiniOS).is_none());
        let (_, target) = minios_slots(Slot::A);
        assert_eq!(r.path(&target, PartitionRole::MiniOS).unwrap(), "/dev/mmcblk0p10");
    }

    #[test]
    fn test_unknown_slots() {
        for n in [1, 2, 4, 7] {
            assert!(matches!(
                kernel_slots(n),
                Err(ImagerError::UnknownSlot {
                    role: PartitionRole::Rootfs,
                    number
                }) if number == n
            ));
        }
        assert_eq!(minios_slots(Slot::B), (MINIOS_B, MINIOS_A));
        let (active, inactive) = minios_slots(Slot::A);
        assert_ne!(active, inactive);
        assert_eq!(inactive.get(PartitionRole::MiniOS), Some(10));
    }

    #[test]
    fn test_priority() {
        assert_eq!(Slot::from_priority("A\n"), Some(Slot::A));
        assert_eq!(Slot::from_priority("B"), Some(Slot::B));
        assert_eq!(Slot::from_priority(""), None);
        assert_eq!(Slot::from_priority("C"), None);
        assert_eq!(KERNEL_B.to_string(), "B(kernel=4, root=5)");
    }
}
