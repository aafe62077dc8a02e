//! Where the partition payloads come from.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ImagerError;
use crate::stateful::{LoopbackStatefulGenerator, StatefulPayloadGenerator};
use crate::storage::{is_storage_uri, GsUtil, ObjectStore};

/// The resolved source of an installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// A local GPT disk image, e.g. `chromiumos_test_image.bin`.
    Full(Utf8PathBuf),
    /// A storage directory of pre-built per-partition payloads,
    /// e.g. `gs://chromeos-image-archive/eve-release/R90-x.x.x`.
    RemoteDirectory(String),
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Full(p) => write!(f, "{p}"),
            ImageSource::RemoteDirectory(u) => f.write_str(u),
        }
    }
}

/// Translates a logical image reference (e.g. `xbuddy://remote/eve/latest`)
/// into a concrete source.
pub trait ImageResolver: Send + Sync {
    /// Returns `None` if nothing matches `reference`.
    fn translate(&self, reference: &str) -> Result<Option<ImageSource>>;
}

impl ImageSource {
    /// Resolve a user supplied image reference.
    pub fn resolve(
        reference: &str,
        resolver: Option<&dyn ImageResolver>,
    ) -> Result<Self, ImagerError> {
        let no_match = |reason: &str| ImagerError::NoMatchingImage {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };
        let path = Utf8Path::new(reference);
        if path.is_file() {
            return Ok(ImageSource::Full(path.to_owned()));
        }
        if path.is_dir() {
            return Err(no_match("input must be a disk image, not a directory"));
        }
        if is_storage_uri(reference) {
            return Ok(ImageSource::RemoteDirectory(reference.to_string()));
        }
        let Some(resolver) = resolver else {
            return Err(no_match("not a local file or a storage path"));
        };
        match resolver
            .translate(reference)
            .map_err(|e| no_match(&format!("{e:#}")))?
        {
            Some(source) => {
                tracing::info!("Image path translated to {source}");
                Ok(source)
            }
            None => Err(no_match("unable to find a matching image")),
        }
    }
}

/// A partition of a disk image, with byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePartition {
    /// Partition number (1 based).
    pub number: u32,
    /// Byte offset into the image.
    pub start: u64,
    /// Length in bytes.
    pub size: u64,
    /// Partition label.
    pub name: String,
    /// Partition type GUID.
    pub type_guid: String,
}

/// Reads the partition table of a disk image.
pub trait PartitionReader: Send + Sync {
    /// All partitions of `image`.
    fn partitions(&self, image: &Utf8Path) -> Result<Vec<ImagePartition>>;
}

/// [`PartitionReader`] using `sfdisk`.
#[derive(Debug, Default)]
pub struct SfdiskReader;

impl PartitionReader for SfdiskReader {
    fn partitions(&self, image: &Utf8Path) -> Result<Vec<ImagePartition>> {
        let table = abflash_blockdev::partitions_of(image)?;
        table
            .partitions
            .iter()
            .map(|p| {
                let (start, size) = table.byte_range(p);
                Ok(ImagePartition {
                    number: table.partno(p)?,
                    start,
                    size,
                    name: p.name.clone().unwrap_or_default(),
                    type_guid: p.parttype.clone(),
                })
            })
            .collect()
    }
}

/// The host side collaborators of an installation.
#[derive(Clone)]
pub struct HostTools {
    /// Reads partition tables of full images.
    pub partitions: Arc<dyn PartitionReader>,
    /// Fetches payloads of remote directories.
    pub storage: Arc<dyn ObjectStore>,
    /// Builds the stateful payload of full images.
    pub stateful_generator: Arc<dyn StatefulPayloadGenerator>,
    /// Translates logical image references.
    pub resolver: Option<Arc<dyn ImageResolver>>,
    /// The local command compressing partition data before it is sent.
    pub compressor: Vec<String>,
}

impl fmt::Debug for HostTools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTools")
            .field("compressor", &self.compressor)
            .field("resolver", &self.resolver.is_some())
            .finish_non_exhaustive()
    }
}

/// Find a local gzip compressor, preferring the parallel implementation.
pub fn find_compressor() -> Result<Vec<String>> {
    for prog in ["pigz", "gzip"] {
        if let Ok(path) = which::which(prog) {
            let path = path.to_str().context("Non UTF-8 compressor path")?.to_string();
            return Ok(vec![path, "-c".to_string()]);
        }
    }
    anyhow::bail!("Neither pigz nor gzip found in PATH")
}

impl HostTools {
    /// The production set of tools.
    pub fn detect() -> Result<Self> {
        Ok(Self {
            partitions: Arc::new(SfdiskReader),
            storage: Arc::new(GsUtil),
            stateful_generator: Arc::new(LoopbackStatefulGenerator),
            resolver: None,
            compressor: find_compressor()?,
        })
    }

    /// Use `resolver` for logical image references.
    pub fn with_resolver(mut self, resolver: Arc<dyn ImageResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }
}
