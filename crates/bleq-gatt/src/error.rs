/*!
 * Error types for the bleq gatt crate.
 */
use thiserror::Error;

use bleq_core::types::PeripheralId;

/// Error type for gatt-level operations.
///
/// Operation-level failures (timeout, not connected, driver status) are
/// not errors in this sense: they are delivered as the resolution of the
/// request they belong to (see [`crate::session::Outcome`]). This type
/// covers failures outside any single request's result path.
#[derive(Error, Debug)]
pub enum GattError {
    /// No session exists for the peripheral
    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(PeripheralId),

    /// The session is not connected, for calls with no result listener
    #[error("Peripheral {0} is not connected")]
    NotConnected(PeripheralId),

    /// The wrapper has not been started or was stopped
    #[error("Wrapper is not running")]
    NotRunning,

    /// The native transport rejected a call
    #[error("Transport error: {0}")]
    Transport(String),

    /// A queued task was dropped before resolving its result
    #[error("Operation was abandoned before resolving")]
    Abandoned,

    /// Core error (queue full, executor stopped, configuration)
    #[error("Core error: {0}")]
    Core(#[from] bleq_core::error::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for gatt-level operations
pub type Result<T> = std::result::Result<T, GattError>;

impl GattError {
    /// Create a new transport error
    pub fn transport<S: AsRef<str>>(msg: S) -> Self {
        GattError::Transport(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        GattError::Other(msg.as_ref().to_string())
    }
}
