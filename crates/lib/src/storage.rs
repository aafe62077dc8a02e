//! Access to the object storage holding pre-built partition payloads.

use std::process::{Command, Stdio};

use abflash_utils::{stderr_tail, CommandRunExt};
use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

/// URI scheme of the storage service.
pub const GS_PREFIX: &str = "gs://";

/// Returns true if `path` names an object in the storage service.
pub fn is_storage_uri(path: &str) -> bool {
    path.starts_with(GS_PREFIX)
}

/// Join a directory URI (or path) and a file name.
pub fn join_uri(dir: &str, name: &str) -> String {
    format!("{}/{name}", dir.trim_end_matches('/'))
}

/// An object storage client.
pub trait ObjectStore: Send + Sync {
    /// Copy the object at `uri` to `dest`, which may be a named pipe.
    fn copy(&self, uri: &str, dest: &Utf8Path) -> Result<()>;

    /// Returns whether an object exists at `uri`.
    fn exists(&self, uri: &str) -> Result<bool>;
}

/// [`ObjectStore`] backed by the `gsutil` command line tool.
#[derive(Debug, Default)]
pub struct GsUtil;

impl ObjectStore for GsUtil {
    #[context("Copying {uri}")]
    fn copy(&self, uri: &str, dest: &Utf8Path) -> Result<()> {
        Command::new("gsutil")
            .args(["-q", "cp", uri, dest.as_str()])
            .log_debug()
            .run_capture_stderr()
    }

    fn exists(&self, uri: &str) -> Result<bool> {
        let o = Command::new("gsutil")
            .args(["-q", "stat", uri])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .context("Spawning gsutil")?;
        // `stat` exits 1 for a missing object and prints nothing
        match o.status.code() {
            Some(0) => Ok(true),
            Some(1) if o.stderr.is_empty() => Ok(false),
            _ => anyhow::bail!(
                "gsutil stat {uri} failed: {}: {}",
                o.status,
                stderr_tail(&o.stderr)
            ),
        }
    }
}
