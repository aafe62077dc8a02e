//! The installation orchestrator.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::{ImagerError, Result};
use crate::progress::COMPLETED_MARKER;
use crate::slots::{self, PartitionRole, ResolvedSlots, SlotSet};
use crate::source::{HostTools, ImageSource};
use crate::updater::{read_minios_priority, PartitionUpdater, UpdateContext, Updater};

/// Default time we wait for the device to come back from a reboot.
pub const DEFAULT_REBOOT_TIMEOUT_SECS: u64 = 600;
/// A failed batch of updates is retried once.
const TRANSFER_ATTEMPTS: u32 = 2;

/// Options controlling an imaging run.
///
/// These can be flattened into a front-end's argument parser, or loaded from
/// a TOML file with kebab-case keys.
#[derive(clap::Args, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ImagerOpts {
    /// Do not update the kernel and root partitions.
    #[clap(long)]
    pub skip_rootfs: bool,

    /// Do not update the stateful partition.
    #[clap(long)]
    pub skip_stateful: bool,

    /// Do not update the MiniOS partition.
    #[clap(long)]
    pub skip_minios: bool,

    /// Do not reboot after updating.
    #[clap(long)]
    pub skip_reboot: bool,

    /// Disable rootfs verification after updating. This reboots the device.
    #[clap(long)]
    pub disable_verification: bool,

    /// Wipe the stateful partition, keeping only the new developer image.
    #[clap(long)]
    pub clobber_stateful: bool,

    /// Clear the TPM owner on the next boot.
    #[clap(long)]
    pub clear_tpm_owner: bool,

    /// Seconds to wait for the device to come back from a reboot.
    #[clap(long, default_value_t = DEFAULT_REBOOT_TIMEOUT_SECS)]
    pub reboot_timeout: u64,
}

impl Default for ImagerOpts {
    fn default() -> Self {
        Self {
            skip_rootfs: false,
            skip_stateful: false,
            skip_minios: false,
            skip_reboot: false,
            disable_verification: false,
            clobber_stateful: false,
            clear_tpm_owner: false,
            reboot_timeout: DEFAULT_REBOOT_TIMEOUT_SECS,
        }
    }
}

impl ImagerOpts {
    /// Load options from a TOML file; missing keys take their defaults.
    #[context("Loading options from {path}")]
    pub fn from_toml_file(path: &Utf8Path) -> anyhow::Result<Self> {
        let buf = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&buf)?)
    }

    /// The reboot timeout as a [`Duration`].
    pub fn reboot_timeout(&self) -> Duration {
        Duration::from_secs(self.reboot_timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ResolvingSource,
    ComputingSlots,
    TransferringPartitions,
    PostActions,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::ResolvingSource => "resolving image source",
            Phase::ComputingSlots => "computing slots",
            Phase::TransferringPartitions => "transferring partitions",
            Phase::PostActions => "running post actions",
        };
        f.write_str(s)
    }
}

/// Installs an image onto the inactive slot of a device.
#[derive(Debug)]
pub struct DeviceImager {
    device: Arc<dyn Device>,
    image: String,
    opts: ImagerOpts,
    tools: HostTools,
}

impl DeviceImager {
    /// An imager writing `image` (a local disk image, a `gs://` directory or
    /// a reference understood by the configured resolver) to `device`.
    pub fn new(
        device: Arc<dyn Device>,
        image: impl Into<String>,
        opts: ImagerOpts,
        tools: HostTools,
    ) -> Self {
        Self {
            device,
            image: image.into(),
            opts,
            tools,
        }
    }

    fn enter(&self, phase: Phase) {
        tracing::debug!("{}: {phase}", self.device.hostname());
    }

    /// Perform the installation.
    pub fn run(&self) -> Result<()> {
        let start = Instant::now();

        self.enter(Phase::ResolvingSource);
        let source = ImageSource::resolve(&self.image, self.tools.resolver.as_deref())?;
        tracing::info!(
            "Preparing to update the remote device {} with image {source}",
            self.device.hostname()
        );

        self.enter(Phase::ComputingSlots);
        let slots = slots::resolve(&self.device.root_dev()?)?;

        self.enter(Phase::TransferringPartitions);
        let mut updaters = self.build_updaters(source, &slots)?;
        run_updaters(&mut updaters)?;

        self.enter(Phase::PostActions);
        self.post_actions(&slots.inactive)?;

        tracing::debug!("Imaging took {:.2?}", start.elapsed());
        tracing::info!("{COMPLETED_MARKER}");
        Ok(())
    }

    fn build_updaters(
        &self,
        source: ImageSource,
        slots: &ResolvedSlots,
    ) -> anyhow::Result<Vec<PartitionUpdater>> {
        let ctx = Arc::new(UpdateContext {
            device: Arc::clone(&self.device),
            source,
            tools: self.tools.clone(),
        });
        let path = |set: &SlotSet, role: PartitionRole| -> anyhow::Result<Utf8PathBuf> {
            slots
                .path(set, role)
                .ok_or_else(|| anyhow!("Slot {set} has no {role} partition"))
        };
        let mut updaters = Vec::new();
        if !self.opts.skip_rootfs {
            updaters.push(PartitionUpdater::kernel(
                &ctx,
                path(&slots.inactive, PartitionRole::Kernel)?,
            ));
            updaters.push(PartitionUpdater::rootfs(
                &ctx,
                path(&slots.active, PartitionRole::Rootfs)?,
                path(&slots.inactive, PartitionRole::Rootfs)?,
            ));
        }
        if !self.opts.skip_stateful {
            updaters.push(PartitionUpdater::stateful(&ctx, self.opts.clobber_stateful));
        }
        if !self.opts.skip_minios {
            match read_minios_priority(self.device.as_ref()) {
                Some(priority) => {
                    let (_, target) = slots::minios_slots(priority);
                    updaters.push(PartitionUpdater::minios(
                        &ctx,
                        path(&target, PartitionRole::MiniOS)?,
                    ));
                }
                None => tracing::warn!("Skipping miniOS update as the device reports no usable priority."),
            }
        }
        Ok(updaters)
    }

    fn post_actions(&self, expected: &SlotSet) -> Result<()> {
        let timeout = self.opts.reboot_timeout();
        if self.opts.clear_tpm_owner {
            self.device.clear_tpm_owner()?;
        }
        if self.opts.disable_verification {
            self.device.disable_rootfs_verification(timeout)?;
            self.verify_boot_expectations(expected)
        } else if !self.opts.skip_reboot {
            self.device
                .reboot(timeout)
                .map_err(ImagerError::RebootFailed)?;
            self.verify_boot_expectations(expected)
        } else {
            Ok(())
        }
    }

    fn verify_boot_expectations(&self, expected: &SlotSet) -> Result<()> {
        let root = self.device.root_dev()?;
        let (_, root_num) = slots::split_dev_path(&root)?;
        let (active, _) = slots::kernel_slots(root_num)?;
        if active != *expected {
            return Err(ImagerError::RebootVerificationFailed {
                expected: expected.to_string(),
                actual: active.to_string(),
            });
        }
        tracing::info!("Verified boot expectations.");
        Ok(())
    }
}

/// Run `updaters` concurrently, retrying the unfinished ones once. If the
/// retry fails too, every updater is reverted.
pub(crate) fn run_updaters<U: Updater>(updaters: &mut [U]) -> Result<()> {
    let mut attempt = 1;
    let source = loop {
        match run_unfinished(updaters) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < TRANSFER_ATTEMPTS => {
                tracing::warn!("Partition update failed, retrying: {e:#}");
                attempt += 1;
            }
            Err(e) => break e,
        }
    };
    tracing::error!("Partition update failed again, reverting: {source:#}");
    let revert_failures = revert_all(updaters);
    Err(ImagerError::TransferFailed {
        source,
        revert_failures,
    })
}

fn run_unfinished<U: Updater>(updaters: &mut [U]) -> anyhow::Result<()> {
    let errors: Vec<anyhow::Error> = std::thread::scope(|s| {
        let workers: Vec<_> = updaters
            .iter_mut()
            .filter(|u| !u.is_finished())
            .map(|u| (u.name(), s.spawn(move || u.run())))
            .collect();
        workers
            .into_iter()
            .filter_map(|(name, worker)| match worker.join() {
                Ok(r) => r.err(),
                Err(_) => Some(anyhow!("{name} panicked")),
            })
            .collect()
    });
    aggregate(errors)
}

/// Collapse the failures of one batch into a single error.
fn aggregate(errors: Vec<anyhow::Error>) -> anyhow::Result<()> {
    let mut errors = errors.into_iter();
    let Some(first) = errors.next() else {
        return Ok(());
    };
    let rest: Vec<String> = errors.map(|e| format!("{e:#}")).collect();
    if rest.is_empty() {
        return Err(first);
    }
    Err(first.context(format!(
        "{} partition updates failed; also: {}",
        rest.len() + 1,
        rest.join("; ")
    )))
}

/// Revert every updater concurrently, returning how many failed to.
fn revert_all<U: Updater>(updaters: &mut [U]) -> usize {
    std::thread::scope(|s| {
        let workers: Vec<_> = updaters
            .iter_mut()
            .map(|u| (u.name(), s.spawn(move || u.revert())))
            .collect();
        let mut failures = 0;
        for (name, worker) in workers {
            let r = worker
                .join()
                .unwrap_or_else(|_| Err(anyhow!("revert panicked")));
            if let Err(e) = r {
                tracing::error!("Reverting {name} failed: {e:#}");
                failures += 1;
            }
        }
        failures
    })
}
