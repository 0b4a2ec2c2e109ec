/*!
 * # bleq-gatt
 *
 * Peripheral sessions, result correlation and the operation facade for
 * bleq.
 *
 * The crate is layered bottom-up:
 *
 * - [`transport`]: the traits the OS Bluetooth binding implements, plus
 *   the events it delivers
 * - [`session`]: per-peripheral connection state machines that pair
 *   every request with exactly one resolution
 * - [`registry`]: one session per peripheral id
 * - [`scanner`]: advertising scan with duplicate filtering and a
 *   deadline
 * - [`wrapper`]: the facade serializing all operations through the
 *   sequential task queue from `bleq-core`
 */

#![warn(missing_docs)]

pub mod error;
pub mod registry;
pub mod scanner;
pub mod session;
pub mod transport;
pub mod wrapper;

pub use error::{GattError, Result};
pub use registry::{RegistryEvent, SessionRegistry};
pub use scanner::{ScanEvent, ScanOptions, Scanner};
pub use session::{DeviceSession, Outcome, Reason, SessionEvent, SessionState};
pub use transport::{Advertisement, Channel, ChannelEvent, Status, Transport};
pub use wrapper::{BleWrapper, WrapperEvent};

/// Version of the bleq-gatt crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
