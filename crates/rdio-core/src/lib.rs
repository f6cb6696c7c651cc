//! Core types, authorization model and live protocol for the rdio relay

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

pub mod access;
pub mod config;
pub mod error;
pub mod livefeed;
pub mod protocol;
pub mod scope;
pub mod types;

// Re-export commonly used types
pub use access::{Access, Accesses, Apikey, Apikeys, Downstream, Downstreams};
pub use config::{Config, ConversionMode, LoggingConfig};
pub use error::{Error, Result};
pub use livefeed::LiveFeedMatrix;
pub use protocol::{CallPayload, Command, Message};
pub use scope::{Scope, SystemScope, TalkgroupScope};
pub use types::{Call, CallId, CallMeta, CallUnit, DelayedEntry, Frequency, Group, System, Tag, Talkgroup, Unit};

/// Initialize the logging system
///
/// `RUST_LOG` takes precedence over the configured level. The `text` format
/// selects the human readable formatter, anything else emits JSON lines.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.format == "text" {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    };

    installed.map_err(|e| Error::Configuration {
        message: format!("logging: {e}"),
    })
}

#[cfg(test)]
#[allow(clippy::missing_panics_doc)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_reports_error() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config);

        assert!(init_logging(&config).is_err());
    }
}
