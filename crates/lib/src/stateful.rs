//! The stateful partition payload.
//!
//! Unlike the kernel and root partitions the stateful partition is not
//! overwritten. We ship a tarball of the developer image and `/var` overlay,
//! unpack it next to the live copies under new names, and leave a marker so
//! that the device swaps them in on the next boot.

use std::fs::File;
use std::os::fd::OwnedFd;
use std::process::{Command, Stdio};

use abflash_blockdev::LoopbackDevice;
use abflash_utils::{check_output, CommandRunExt};
use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::device::{Device, Input};

/// Where the stateful partition is mounted on the device.
pub const STATEFUL_DIR: &str = "/mnt/stateful_partition";
/// Name of the stateful payload in a remote image directory.
pub const STATEFUL_FILE: &str = "stateful.tgz";

const VAR_NEW: &str = "var_new";
const DEV_IMAGE_NEW: &str = "dev_image_new";
const UPDATE_MARKER: &str = ".update_available";
/// Marker content asking the device to wipe stateful except for the new
/// developer image.
const CLOBBER: &str = "clobber";
/// Partition number of the stateful partition in a full image.
const STATE_PARTNO: u32 = 1;

/// Builds the stateful payload of a full disk image.
pub trait StatefulPayloadGenerator: Send + Sync {
    /// Write a gzip compressed tarball of the stateful payload of `image`
    /// into `out`.
    fn generate(&self, image: &Utf8Path, out: OwnedFd) -> Result<()>;
}

/// Generates the payload by mounting the image's stateful partition through
/// a loopback device. Requires root.
#[derive(Debug, Default)]
pub struct LoopbackStatefulGenerator;

impl StatefulPayloadGenerator for LoopbackStatefulGenerator {
    #[context("Generating stateful payload from {image}")]
    fn generate(&self, image: &Utf8Path, out: OwnedFd) -> Result<()> {
        let loopdev = LoopbackDevice::new(image.as_std_path())?;
        let mnt = tempfile::Builder::new()
            .prefix("abflash-stateful")
            .tempdir()
            .context("Creating mount point")?;
        let mnt_path = Utf8Path::from_path(mnt.path()).context("Non UTF-8 temporary directory")?;
        Command::new("mount")
            .args(["-o", "ro"])
            .arg(loopdev.partition(STATE_PARTNO).as_str())
            .arg(mnt_path.as_str())
            .log_debug()
            .run_capture_stderr()?;
        let archived = archive_stateful(mnt_path, out);
        let unmounted = Command::new("umount")
            .arg(mnt_path.as_str())
            .run_capture_stderr();
        archived?;
        unmounted?;
        loopdev.close()
    }
}

fn archive_stateful(root: &Utf8Path, out: OwnedFd) -> Result<()> {
    let output = Command::new("tar")
        .args(["--selinux", "-czf", "-", "-C", root.as_str()])
        .arg(format!("--transform=s,^dev_image,{DEV_IMAGE_NEW},"))
        .arg(format!("--transform=s,^var_overlay,{VAR_NEW},"))
        .args(["dev_image", "var_overlay"])
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::piped())
        .log_debug()
        .output()
        .context("Spawning tar")?;
    check_output("tar", &output)
}

/// Applies and rolls back stateful payloads on a device.
pub(crate) struct StatefulService<'a> {
    device: &'a dyn Device,
}

impl<'a> StatefulService<'a> {
    pub(crate) fn new(device: &'a dyn Device) -> Self {
        Self { device }
    }

    fn path(name: &str) -> String {
        format!("{STATEFUL_DIR}/{name}")
    }

    /// Unpack `payload` into the stateful partition and mark it for the next boot.
    pub(crate) fn update(&self, payload: File, clobber: bool) -> Result<()> {
        self.device
            .run(
                &[
                    "tar",
                    "--ignore-command-error",
                    "--overwrite",
                    "--selinux",
                    "--directory",
                    STATEFUL_DIR,
                    "-xzf",
                    "-",
                ],
                Input::Stream(payload),
            )
            .context("Unpacking the stateful payload")?;
        for dir in [VAR_NEW, DEV_IMAGE_NEW] {
            let dir = Self::path(dir);
            self.device
                .run(&["test", "-d", &dir], Input::Null)
                .with_context(|| format!("Stateful payload is missing {dir}"))?;
        }
        self.mark_update(clobber)
    }

    fn mark_update(&self, clobber: bool) -> Result<()> {
        let content = if clobber {
            tracing::info!("Restoring stateful to factory_install with dev_image.");
            CLOBBER
        } else {
            tracing::info!("Performing standard stateful update.");
            ""
        };
        let marker = Self::path(UPDATE_MARKER);
        self.device
            .run(
                &["dd", "status=none", &format!("of={marker}")],
                Input::Bytes(content.as_bytes().to_vec()),
            )
            .with_context(|| format!("Writing {marker}"))?;
        Ok(())
    }

    /// Remove a pending update. Failures are logged and otherwise ignored,
    /// so this is safe to call in any state.
    pub(crate) fn reset(&self) {
        let targets = [UPDATE_MARKER, VAR_NEW, DEV_IMAGE_NEW].map(Self::path);
        let mut argv = vec!["rm", "-rf"];
        argv.extend(targets.iter().map(String::as_str));
        if let Err(e) = self.device.run(&argv, Input::Null) {
            tracing::warn!("Resetting the stateful update failed: {e:#}");
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;
    use crate::testutil::FakeDevice;

    fn payload(data: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(data).unwrap();
        std::io::Seek::rewind(&mut f).unwrap();
        f
    }

    #[test]
    fn test_update() {
        let device = FakeDevice::new("/dev/sda3");
        let service = StatefulService::new(&device);
        service.update(payload(b"tarball"), false).unwrap();
        similar_asserts::assert_eq!(
            device.commands(),
            [
                "tar --ignore-command-error --overwrite --selinux --directory /mnt/stateful_partition -xzf -",
                "test -d /mnt/stateful_partition/var_new",
                "test -d /mnt/stateful_partition/dev_image_new",
                "dd status=none of=/mnt/stateful_partition/.update_available",
            ]
        );
        assert_eq!(device.input_of("tar").unwrap(), b"tarball");
        assert_eq!(device.input_of("dd").unwrap(), b"");
    }

    #[test]
    fn test_update_clobber() {
        let device = FakeDevice::new("/dev/sda3");
        StatefulService::new(&device)
            .update(payload(b"tarball"), true)
            .unwrap();
        assert_eq!(device.input_of("dd").unwrap(), b"clobber");
    }

    #[test]
    fn test_update_missing_dirs() {
        let device = FakeDevice::new("/dev/sda3");
        device.fail_matching("test -d /mnt/stateful_partition/dev_image_new", 1);
        let e = StatefulService::new(&device)
            .update(payload(b"tarball"), false)
            .unwrap_err();
        assert!(format!("{e:#}").contains("missing"), "{e:#}");
        assert_eq!(device.count("dd"), 0);
    }

    #[test]
    fn test_reset() {
        let device = FakeDevice::new("/dev/sda3");
        device.fail_matching("rm -rf", 1);
        let service = StatefulService::new(&device);
        // Failures are swallowed
        service.reset();
        service.reset();
        assert_eq!(device.count("rm -rf"), 2);
        assert_eq!(
            device.commands()[1],
            "rm -rf /mnt/stateful_partition/.update_available /mnt/stateful_partition/var_new /mnt/stateful_partition/dev_image_new"
        );
    }
}
