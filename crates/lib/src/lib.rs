//! # A/B device imaging
//!
//! This crate installs a disk image onto the inactive slot of a device with
//! redundant (A/B) kernel and root partitions, updates its stateful partition
//! and MiniOS, then reboots it into the new slot.
//!
//! Partition payloads are streamed from a local disk image or from a storage
//! directory of pre-built payloads through OS pipes straight into commands
//! running on the device, so nothing is staged on disk. Updaters run
//! concurrently; a failed batch is retried once and then reverted.
//!
//! The entry point is [`DeviceImager::run`].

pub mod device;
mod error;
mod imager;
mod pipe;
pub mod progress;
pub mod slots;
mod source;
pub mod ssh;
mod stateful;
pub mod storage;
mod updater;

#[cfg(test)]
mod testutil;

pub use device::{Compression, Device, Input};
pub use error::{ImagerError, Result};
pub use imager::{DeviceImager, ImagerOpts, DEFAULT_REBOOT_TIMEOUT_SECS};
pub use progress::{ProgressLayer, ProgressReporter};
pub use source::{
    find_compressor, HostTools, ImagePartition, ImageResolver, ImageSource, PartitionReader,
    SfdiskReader,
};
pub use ssh::SshDevice;
pub use stateful::{
    LoopbackStatefulGenerator, StatefulPayloadGenerator, STATEFUL_DIR, STATEFUL_FILE,
};
pub use storage::{GsUtil, ObjectStore};
