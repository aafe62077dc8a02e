//! Per-partition updaters.
//!
//! Each updater moves one payload from the image source onto the device and
//! knows how to undo the parts of its work that would change what the device
//! boots next.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Instant;

use abflash_blockdev::ext_filesystem_size;
use abflash_utils::shell_join;
use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::device::{Compression, Device, Input};
use crate::pipe::{PipeTransfer, RangeReader, RemoteCopier};
use crate::progress::{ProgressWatch, POSTINSTALL_MARKER};
use crate::slots::Slot;
use crate::source::{HostTools, ImagePartition, ImageSource};
use crate::stateful::{StatefulService, STATEFUL_DIR, STATEFUL_FILE};
use crate::storage::join_uri;

/// Image partition holding the kernel we install.
pub(crate) const PART_KERNEL: &str = "KERN-B";
/// Image partition holding the root filesystem we install.
pub(crate) const PART_ROOTFS: &str = "ROOT-A";
/// Image partition holding MiniOS.
pub(crate) const PART_MINIOS: &str = "MINIOS-A";
/// Payload names in a remote image directory.
pub(crate) const REMOTE_KERNEL: &str = "full_dev_part_KERN.bin.gz";
pub(crate) const REMOTE_ROOTFS: &str = "full_dev_part_ROOT.bin.gz";
pub(crate) const REMOTE_MINIOS: &str = "full_dev_part_MINIOS.bin.gz";
/// GPT type of MiniOS partitions.
pub(crate) const MINIOS_TYPE_GUID: &str = "09845860-705F-4BB5-B16C-8A8A099CAF52";
/// Partition numbers of the two MiniOS copies on a device.
const MINIOS_PARTNOS: [&str; 2] = ["9", "10"];
/// Enough of a filesystem image to cover an ext superblock.
const SUPERBLOCK_READ_SIZE: u64 = 8192;

/// A unit of work in an installation.
pub(crate) trait Updater: Send {
    /// Name for logs.
    fn name(&self) -> String;

    /// Perform the update.
    fn run(&mut self) -> Result<()>;

    /// Whether [`Updater::run`] has completed successfully.
    fn is_finished(&self) -> bool;

    /// Undo whatever changes the next boot. Safe to call in any state.
    fn revert(&mut self) -> Result<()>;
}

/// Everything an updater needs besides its own target.
#[derive(Debug)]
pub(crate) struct UpdateContext {
    pub(crate) device: Arc<dyn Device>,
    pub(crate) source: ImageSource,
    pub(crate) tools: HostTools,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UpdaterKind {
    Kernel,
    Rootfs {
        /// The root partition currently booted, handed to postinst on revert.
        current_root: Utf8PathBuf,
    },
    Stateful {
        clobber: bool,
    },
    MiniOS,
}

impl fmt::Display for UpdaterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UpdaterKind::Kernel => "kernel",
            UpdaterKind::Rootfs { .. } => "rootfs",
            UpdaterKind::Stateful { .. } => "stateful",
            UpdaterKind::MiniOS => "miniOS",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdaterState {
    Pending,
    Running,
    Finished,
    Failed,
}

/// Updates one partition (or the stateful directory tree) of the device.
#[derive(Debug)]
pub(crate) struct PartitionUpdater {
    ctx: Arc<UpdateContext>,
    kind: UpdaterKind,
    target: Utf8PathBuf,
    state: UpdaterState,
    /// Set once the device was told to boot something new.
    finalized: bool,
}

impl PartitionUpdater {
    fn new(ctx: &Arc<UpdateContext>, kind: UpdaterKind, target: Utf8PathBuf) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            kind,
            target,
            state: UpdaterState::Pending,
            finalized: false,
        }
    }

    pub(crate) fn kernel(ctx: &Arc<UpdateContext>, target: Utf8PathBuf) -> Self {
        Self::new(ctx, UpdaterKind::Kernel, target)
    }

    pub(crate) fn rootfs(
        ctx: &Arc<UpdateContext>,
        current_root: Utf8PathBuf,
        target: Utf8PathBuf,
    ) -> Self {
        Self::new(ctx, UpdaterKind::Rootfs { current_root }, target)
    }

    pub(crate) fn stateful(ctx: &Arc<UpdateContext>, clobber: bool) -> Self {
        Self::new(ctx, UpdaterKind::Stateful { clobber }, STATEFUL_DIR.into())
    }

    pub(crate) fn minios(ctx: &Arc<UpdateContext>, target: Utf8PathBuf) -> Self {
        Self::new(ctx, UpdaterKind::MiniOS, target)
    }

    fn device(&self) -> &dyn Device {
        self.ctx.device.as_ref()
    }

    fn run_inner(&mut self) -> Result<()> {
        match &self.kind {
            UpdaterKind::Kernel => self.write_raw(PART_KERNEL, REMOTE_KERNEL),
            UpdaterKind::Rootfs { .. } => {
                {
                    let _watch = match ProgressWatch::start(
                        Arc::clone(&self.ctx.device),
                        &self.target,
                    ) {
                        Ok(w) => Some(w),
                        Err(e) => {
                            tracing::warn!("Not monitoring rootfs progress: {e:#}");
                            None
                        }
                    };
                    self.write_raw(PART_ROOTFS, REMOTE_ROOTFS)?;
                }
                self.postinst()
            }
            UpdaterKind::Stateful { clobber } => self.write_stateful(*clobber),
            UpdaterKind::MiniOS => self.update_minios(),
        }
    }

    fn image_partition(&self, image: &Utf8Path, name: &str) -> Result<ImagePartition> {
        self.ctx
            .tools
            .partitions
            .partitions(image)?
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| anyhow!("No partition named {name} in {image}"))
    }

    /// Stream a raw partition payload into the target block device.
    fn write_raw(&self, partition: &str, remote_name: &str) -> Result<()> {
        let decompressor = self.device().decompressor(Compression::Gzip)?;
        let of = format!("of={}", self.target);
        let script = format!(
            "{} | {}",
            shell_join(&decompressor)?,
            shell_join(&["dd", "bs=1M", of.as_str()])?
        );
        let transfer = match &self.ctx.source {
            ImageSource::Full(image) => {
                let part = self.image_partition(image, partition)?;
                let length = if matches!(self.kind, UpdaterKind::Rootfs { .. }) {
                    transfer_length(image, &part)
                } else {
                    part.size
                };
                RangeReader {
                    image: image.clone(),
                    offset: part.start,
                    length,
                    compressor: self.ctx.tools.compressor.clone(),
                }
                .spawn()?
            }
            ImageSource::RemoteDirectory(dir) => RemoteCopier {
                source: join_uri(dir, remote_name),
                storage: Arc::clone(&self.ctx.tools.storage),
            }
            .spawn()?,
        };
        transfer.consume(|payload| {
            self.device()
                .run(&["sh", "-c", &script], Input::Stream(payload))
                .with_context(|| format!("Writing {}", self.target))?;
            Ok(())
        })
    }

    /// Run the postinst program of the freshly written root, which marks it
    /// as the next boot target.
    fn postinst(&mut self) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let device = ctx.device.as_ref();
        let target = self.target.as_str();
        let mnt = device
            .run(&["mktemp", "-d", "-p", device.work_dir()], Input::Null)?
            .trim()
            .to_string();
        device
            .run(&["mount", "-o", "ro", target, &mnt], Input::Null)
            .with_context(|| format!("Mounting {target}"))?;
        // Even a failed postinst may have flipped the boot priority.
        self.finalized = true;
        let postinst = format!("{mnt}/postinst");
        let ran = device.run(&[&postinst, target], Input::Null);
        let unmounted = device.run(&["umount", &mnt], Input::Null);
        let out = ran.with_context(|| format!("Running postinst on {target}"))?;
        unmounted.with_context(|| format!("Unmounting {mnt}"))?;
        tracing::debug!("Postinst result on {postinst}:\n{out}");
        tracing::info!("{POSTINSTALL_MARKER}.");
        Ok(())
    }

    fn write_stateful(&self, clobber: bool) -> Result<()> {
        let transfer = match &self.ctx.source {
            ImageSource::Full(image) => {
                let generator = Arc::clone(&self.ctx.tools.stateful_generator);
                let image = image.clone();
                PipeTransfer::anonymous("stateful-generator", move |out| {
                    generator.generate(&image, out)
                })?
            }
            ImageSource::RemoteDirectory(dir) => RemoteCopier {
                source: join_uri(dir, STATEFUL_FILE),
                storage: Arc::clone(&self.ctx.tools.storage),
            }
            .spawn()?,
        };
        let service = StatefulService::new(self.device());
        transfer.consume(|payload| service.update(payload, clobber))
    }

    fn minios_available(&self) -> Result<bool> {
        match &self.ctx.source {
            ImageSource::Full(image) => {
                let found = self
                    .ctx
                    .tools
                    .partitions
                    .partitions(image)?
                    .iter()
                    .any(|p| p.type_guid.eq_ignore_ascii_case(MINIOS_TYPE_GUID));
                if !found {
                    tracing::warn!("Not updating miniOS partition as it does not exist in the image.");
                }
                Ok(found)
            }
            ImageSource::RemoteDirectory(dir) => {
                if !self.ctx.tools.storage.exists(&join_uri(dir, REMOTE_MINIOS))? {
                    tracing::warn!("Not updating miniOS partition as the image has no miniOS payload.");
                    return Ok(false);
                }
                if !self.device_has_minios()? {
                    tracing::warn!("Not updating miniOS partition as the device has no miniOS partitions.");
                    return Ok(false);
                }
                Ok(true)
            }
        }
    }

    fn device_has_minios(&self) -> Result<bool> {
        let device = self.device();
        let drive = device.run(&["rootdev", "-s", "-d"], Input::Null)?;
        let drive = drive.trim();
        for partno in MINIOS_PARTNOS {
            let guid = device.run(&["cgpt", "show", "-t", drive, "-i", partno], Input::Null)?;
            if !guid.trim().eq_ignore_ascii_case(MINIOS_TYPE_GUID) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn update_minios(&mut self) -> Result<()> {
        if read_minios_priority(self.device()).is_none() {
            tracing::warn!("Not updating miniOS partition as no miniOS priority is set.");
            return Ok(());
        }
        if !self.minios_available()? {
            return Ok(());
        }
        self.write_raw(PART_MINIOS, REMOTE_MINIOS)?;
        flip_minios_priority(self.device())?;
        self.finalized = true;
        Ok(())
    }
}

impl Updater for PartitionUpdater {
    fn name(&self) -> String {
        format!("{} updater ({})", self.kind, self.target)
    }

    fn run(&mut self) -> Result<()> {
        let start = Instant::now();
        self.state = UpdaterState::Running;
        let r = self.run_inner();
        self.state = match r {
            Ok(()) => UpdaterState::Finished,
            Err(_) => UpdaterState::Failed,
        };
        tracing::debug!(
            "{} {:?} after {:.2?}",
            self.name(),
            self.state,
            start.elapsed()
        );
        r.with_context(|| format!("Updating {}", self.kind))
    }

    fn is_finished(&self) -> bool {
        self.state == UpdaterState::Finished
    }

    fn revert(&mut self) -> Result<()> {
        match &self.kind {
            // Nothing boots an unreferenced kernel partition.
            UpdaterKind::Kernel => Ok(()),
            UpdaterKind::Rootfs { current_root } => {
                if !self.finalized {
                    return Ok(());
                }
                tracing::info!("Reverting the rootfs partition update.");
                self.ctx
                    .device
                    .run(&["/postinst", current_root.as_str()], Input::Null)
                    .with_context(|| format!("Restoring {current_root} as the boot target"))?;
                self.finalized = false;
                Ok(())
            }
            UpdaterKind::Stateful { .. } => {
                tracing::info!("Reverting the stateful update.");
                StatefulService::new(self.device()).reset();
                Ok(())
            }
            UpdaterKind::MiniOS => {
                if !self.finalized {
                    return Ok(());
                }
                tracing::info!("Reverting the miniOS partition update.");
                flip_minios_priority(self.device())?;
                self.finalized = false;
                Ok(())
            }
        }
    }
}

/// How many bytes of a root partition to send: the size of the filesystem it
/// holds when that can be determined, never more than the partition.
fn transfer_length(image: &Utf8Path, part: &ImagePartition) -> u64 {
    match read_filesystem_size(image, part.start) {
        Ok(Some(size)) => {
            if size > part.size {
                tracing::debug!(
                    "Filesystem in {} claims {size} bytes, more than its {} byte partition",
                    part.name,
                    part.size
                );
            }
            size.min(part.size)
        }
        Ok(None) => part.size,
        Err(e) => {
            tracing::debug!("Reading filesystem size of {}: {e:#}", part.name);
            part.size
        }
    }
}

fn read_filesystem_size(image: &Utf8Path, offset: u64) -> Result<Option<u64>> {
    let mut f = File::open(image).with_context(|| format!("Opening {image}"))?;
    f.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    f.take(SUPERBLOCK_READ_SIZE).read_to_end(&mut buf)?;
    Ok(ext_filesystem_size(&buf))
}

/// The slot MiniOS boots from next, if the device reports a usable one.
pub(crate) fn read_minios_priority(device: &dyn Device) -> Option<Slot> {
    match device.run(&["crossystem", "minios_priority"], Input::Null) {
        Ok(out) => {
            let slot = Slot::from_priority(&out);
            if slot.is_none() {
                tracing::warn!("Unusable miniOS priority {:?}", out.trim());
            }
            slot
        }
        Err(e) => {
            tracing::warn!("Reading miniOS priority: {e:#}");
            None
        }
    }
}

fn flip_minios_priority(device: &dyn Device) -> Result<()> {
    let current = read_minios_priority(device)
        .ok_or_else(|| anyhow!("Unable to read the current miniOS priority"))?;
    let next = current.other();
    tracing::info!("Setting miniOS priority to {next}");
    device
        .run(
            &["crossystem", &format!("minios_priority={next}")],
            Input::Null,
        )
        .context("Setting miniOS priority")?;
    Ok(())
}
