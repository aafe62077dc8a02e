//! The handle used to act on the device being imaged.

use std::fmt;
use std::fs::File;
use std::time::Duration;

use anyhow::Result;
use camino::Utf8PathBuf;

/// Compression formats used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// gzip, optionally via a parallel implementation.
    Gzip,
}

/// What to feed a device command on stdin.
#[derive(Debug, Default)]
pub enum Input {
    /// Nothing; stdin is `/dev/null`.
    #[default]
    Null,
    /// A small in-memory buffer.
    Bytes(Vec<u8>),
    /// A stream, typically the read end of a pipe, consumed until EOF.
    Stream(File),
}

/// A device that can be flashed.
///
/// Implementations must tolerate concurrent invocations of [`Device::run`]
/// from several threads; each updater drives its own commands.
pub trait Device: Send + Sync {
    /// A human readable name for logs.
    fn hostname(&self) -> &str;

    /// Run `argv` on the device, feeding it `input`, and return its stdout.
    /// A non-zero exit status is an error.
    fn run(&self, argv: &[&str], input: Input) -> Result<String>;

    /// The block device currently mounted as root, e.g. `/dev/mmcblk0p3`.
    fn root_dev(&self) -> Result<Utf8PathBuf>;

    /// A scratch directory on the device.
    fn work_dir(&self) -> &str;

    /// Reboot and wait until the device is back, or `timeout` expires.
    fn reboot(&self, timeout: Duration) -> Result<()>;

    /// The argv of a device-side command that decompresses stdin to stdout.
    fn decompressor(&self, kind: Compression) -> Result<Vec<String>>;

    /// Request the TPM owner be cleared on next boot.
    fn clear_tpm_owner(&self) -> Result<()>;

    /// Disable rootfs verification; this reboots the device.
    fn disable_rootfs_verification(&self, timeout: Duration) -> Result<()>;
}

impl fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({})", self.hostname())
    }
}
