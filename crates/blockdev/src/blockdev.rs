//! Block device and disk image helpers: partition tables of images,
//! filesystem size introspection and loopback attachment.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use abflash_utils::CommandRunExt;

/// Sector size assumed when sfdisk does not report one.
pub const DEFAULT_SECTOR_SIZE: u64 = 512;

/// Byte offset of the ext2/3/4 superblock from the start of the filesystem.
const EXT_SUPERBLOCK_OFFSET: usize = 1024;
const EXT_MAGIC: u16 = 0xEF53;
// Offsets relative to the start of the superblock
const EXT_BLOCKS_COUNT_LO: usize = 0x04;
const EXT_LOG_BLOCK_SIZE: usize = 0x18;
const EXT_MAGIC_OFFSET: usize = 0x38;
const EXT_FEATURE_INCOMPAT: usize = 0x60;
const EXT_BLOCKS_COUNT_HI: usize = 0x150;
const EXT_INCOMPAT_64BIT: u32 = 0x80;

#[derive(Debug, Deserialize)]
struct SfDiskOutput {
    partitiontable: PartitionTable,
}

/// A single partition entry as reported by `sfdisk -J`.
#[derive(Debug, Deserialize)]
pub struct Partition {
    /// The device node (or `<image><N>` for image files).
    pub node: String,
    /// Start, in sectors.
    pub start: u64,
    /// Size, in sectors.
    pub size: u64,
    /// The partition type; a GUID for GPT.
    #[serde(rename = "type")]
    pub parttype: String,
    /// The partition UUID.
    pub uuid: Option<String>,
    /// The partition label.
    pub name: Option<String>,
}

/// The kind of partition table.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
    /// MBR
    Dos,
    /// GUID partition table
    Gpt,
    /// Anything else
    #[serde(untagged)]
    Unknown(String),
}

/// A partition table as reported by `sfdisk -J`.
#[derive(Debug, Deserialize)]
pub struct PartitionTable {
    /// The kind of table.
    pub label: PartitionType,
    /// Disk identifier.
    pub id: String,
    /// The device or image file the table was read from.
    pub device: String,
    /// Logical sector size, not reported by older util-linux.
    pub sectorsize: Option<u64>,
    // We're not using these fields
    // pub unit: String,
    // pub firstlba: u64,
    // pub lastlba: u64,
    /// The partitions.
    #[serde(default)]
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    /// The logical sector size in bytes.
    pub fn sector_size(&self) -> u64 {
        self.sectorsize.unwrap_or(DEFAULT_SECTOR_SIZE)
    }

    /// The partition number of `part`, derived from its node name.
    pub fn partno(&self, part: &Partition) -> Result<u32> {
        let suffix = part
            .node
            .strip_prefix(self.device.as_str())
            .unwrap_or(part.node.as_str());
        let digits = suffix.trim_start_matches(|c: char| !c.is_ascii_digit());
        digits
            .parse()
            .with_context(|| format!("Parsing partition number of {}", part.node))
    }

    /// Byte offset and byte length of `part`.
    pub fn byte_range(&self, part: &Partition) -> (u64, u64) {
        let ss = self.sector_size();
        (part.start * ss, part.size * ss)
    }
}

/// Read the partition table of a block device or a disk image file.
#[context("Listing partitions of {dev}")]
pub fn partitions_of(dev: &Utf8Path) -> Result<PartitionTable> {
    let o: SfDiskOutput = Command::new("sfdisk")
        .args(["-J", dev.as_str()])
        .log_debug()
        .run_and_parse_json()?;
    Ok(o.partitiontable)
}

fn le_u16(buf: &[u8], off: usize) -> Option<u16> {
    let b = buf.get(off..off + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

fn le_u32(buf: &[u8], off: usize) -> Option<u32> {
    let b = buf.get(off..off + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Given the leading bytes of an ext2/3/4 filesystem (at least the first
/// 2 KiB), return the number of bytes the filesystem occupies.
///
/// Returns `None` if the buffer does not hold a plausible superblock.
pub fn ext_filesystem_size(buf: &[u8]) -> Option<u64> {
    let sb = buf.get(EXT_SUPERBLOCK_OFFSET..)?;
    if le_u16(sb, EXT_MAGIC_OFFSET)? != EXT_MAGIC {
        return None;
    }
    let log_block_size = le_u32(sb, EXT_LOG_BLOCK_SIZE)?;
    // Block sizes above 64KiB are not valid for ext filesystems
    if log_block_size > 6 {
        return None;
    }
    let block_size = 1024u64 << log_block_size;
    let mut blocks = u64::from(le_u32(sb, EXT_BLOCKS_COUNT_LO)?);
    if le_u32(sb, EXT_FEATURE_INCOMPAT)? & EXT_INCOMPAT_64BIT != 0 {
        blocks |= u64::from(le_u32(sb, EXT_BLOCKS_COUNT_HI)?) << 32;
    }
    match blocks.checked_mul(block_size) {
        Some(0) | None => None,
        Some(n) => Some(n),
    }
}

/// A disk image attached to a loopback device with its partitions scanned.
#[derive(Debug)]
pub struct LoopbackDevice {
    dev: Option<Utf8PathBuf>,
}

impl LoopbackDevice {
    /// Create a new read-only loopback block device targeting the provided file path.
    #[context("Attaching loopback for {}", path.display())]
    pub fn new(path: &Path) -> Result<Self> {
        let dev = Command::new("losetup")
            .args(["--show", "--read-only", "-P", "--find"])
            .arg(path)
            .log_debug()
            .run_get_string()?;
        let dev = Utf8PathBuf::from(dev.trim());
        tracing::debug!("Allocated loopback {dev}");
        Ok(Self { dev: Some(dev) })
    }

    /// Access the path to the loopback block device.
    pub fn path(&self) -> &Utf8Path {
        // The option is only taken by `impl_close`, after which `self` is gone.
        self.dev.as_deref().unwrap_or(Utf8Path::new(""))
    }

    /// Path to the node of partition `partno` of the attached image.
    pub fn partition(&self, partno: u32) -> Utf8PathBuf {
        format!("{}p{partno}", self.path()).into()
    }

    // Shared backend for our `close` and `drop` implementations.
    fn impl_close(&mut self) -> Result<()> {
        let Some(dev) = self.dev.take() else {
            tracing::trace!("loopback device already deallocated");
            return Ok(());
        };
        Command::new("losetup")
            .args(["-d", dev.as_str()])
            .run_capture_stderr()
    }

    /// Consume this device, detaching it.
    pub fn close(mut self) -> Result<()> {
        self.impl_close()
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        // Best effort to detach if we're dropped without invoking `close`
        let _ = self.impl_close();
    }
}
