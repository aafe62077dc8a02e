//! Helpers related to tracing, used by main entrypoints

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Initialize tracing with the default configuration: compact output on
/// stderr without timestamps, filtered by `RUST_LOG` (default `info`).
///
/// `extra` sees every event regardless of the filter; pass
/// [`tracing_subscriber::layer::Identity`] for none.
pub fn initialize_tracing<L>(extra: L) -> Result<()>
where
    L: Layer<Registry> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let format = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .with_filter(filter);
    tracing_subscriber::registry()
        .with(extra)
        .with(format)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_once() {
        initialize_tracing(tracing_subscriber::layer::Identity::new()).unwrap();
        tracing::info!("tracing initialized");
        // A global subscriber can only be installed once
        assert!(initialize_tracing(tracing_subscriber::layer::Identity::new()).is_err());
    }
}
