//! The error type surfaced by [`crate::DeviceImager::run`].

use crate::slots::PartitionRole;

/// A fatal failure while imaging a device.
///
/// Transfer failures have already been retried and reverted by the time they
/// are returned; post-action failures (reboot, boot verification) are not
/// reverted since the partitions have been committed.
#[derive(Debug, thiserror::Error)]
pub enum ImagerError {
    /// The image reference could not be turned into a full image or a remote directory.
    #[error("{reference}: {reason}")]
    NoMatchingImage {
        /// What the user asked for.
        reference: String,
        /// Why nothing matched.
        reason: String,
    },
    /// The device's root block device path does not end in a partition number.
    #[error("{0}: Could not parse root dev path")]
    MalformedDevicePath(String),
    /// A partition number that belongs to neither A/B slot.
    #[error("Invalid {role} partition number {number}")]
    UnknownSlot {
        /// The partition role that was being resolved.
        role: PartitionRole,
        /// The offending partition number.
        number: u32,
    },
    /// Writing the partitions failed twice; every updater has been reverted.
    #[error("Failed to install partitions ({revert_failures} revert failures)")]
    TransferFailed {
        /// The aggregated failure of the last attempt.
        #[source]
        source: anyhow::Error,
        /// How many updaters failed to revert.
        revert_failures: usize,
    },
    /// The device did not come back from a reboot.
    #[error("Could not recover from reboot; the image may not be a test image or the system failed to boot after the update")]
    RebootFailed(#[source] anyhow::Error),
    /// The device booted, but not into the slot that was just written.
    #[error("The expected kernel state after update is invalid: booted {actual}, expected {expected}")]
    RebootVerificationFailed {
        /// The slot that was written.
        expected: String,
        /// The slot the device reports as active.
        actual: String,
    },
    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result alias for [`ImagerError`].
pub type Result<T, E = ImagerError> = std::result::Result<T, E>;
