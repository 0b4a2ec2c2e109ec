/*!
 * Logging functionality for bleq.
 *
 * This module provides tracing setup and utilities for consistent logging
 * across the bleq workspace.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "bleq=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a peripheral session
///
/// # Arguments
///
/// * `peripheral` - The peripheral address the span belongs to
pub fn session_span(peripheral: &str) -> Span {
    tracing::info_span!("session", peripheral = %peripheral)
}

/// Create a new span for an operation
///
/// # Arguments
///
/// * `name` - The name of the operation
/// * `peripheral` - The peripheral the operation targets
pub fn operation_span(name: &str, peripheral: &str) -> Span {
    tracing::info_span!("operation", name = %name, peripheral = %peripheral)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // This will fail if called multiple times in the same process
        // but it's fine for a single test
        let _ = init();
    }

    #[test]
    fn test_session_span() {
        // Whether the span is enabled depends on the active subscriber;
        // only its metadata is stable across test ordering.
        let span = session_span("AA:BB:CC:DD:EE:FF");
        if let Some(meta) = span.metadata() {
            assert_eq!(meta.name(), "session");
        }
    }

    #[test]
    fn test_operation_span() {
        let span = operation_span("read", "AA:BB:CC:DD:EE:FF");
        if let Some(meta) = span.metadata() {
            assert_eq!(meta.name(), "operation");
        }
    }
}
