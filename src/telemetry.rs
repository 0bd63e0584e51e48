//! Shared tracing bootstrap for Flotilla binaries.
//!
//! Library modules record metrics through the `opentelemetry` global meter;
//! installing an exporting meter provider is left to the embedding process.

use crate::{Error, Result};

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Initialize the global tracing subscriber at the given level.
pub fn init_tracing(log_level: &str) -> Result<()> {
    let level = parse_log_level(log_level)?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))?;
    Ok(())
}

fn parse_log_level(s: &str) -> Result<Level> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!("unknown log level: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert!(parse_log_level("verbose").is_err());
    }
}
