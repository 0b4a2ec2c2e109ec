/*!
 * Core data types for bleq.
 *
 * This module defines the identifier types used when addressing a
 * peripheral and the data it exposes.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The stable address of a remote peripheral (MAC-style string)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Create a peripheral id from a string address
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PeripheralId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A service id within a peripheral's data model
pub type ServiceId = Uuid;

/// A characteristic id within a service
pub type CharacteristicId = Uuid;

/// A descriptor id configuring one characteristic
pub type DescriptorId = Uuid;

/// The kind of a request/response operation issued against a peripheral.
///
/// Each kind has at most one pending result listener per session at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Establishing the connection
    Connect,
    /// Reading a characteristic
    Read,
    /// Writing a characteristic
    Write,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Connect => write!(f, "connect"),
            OperationKind::Read => write!(f, "read"),
            OperationKind::Write => write!(f, "write"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peripheral_id_creation() {
        let id = PeripheralId::new("AA:BB:CC:DD:EE:FF");
        assert_eq!(id.as_str(), "AA:BB:CC:DD:EE:FF");

        let id: PeripheralId = "11:22:33:44:55:66".into();
        assert_eq!(id.as_str(), "11:22:33:44:55:66");

        let id: PeripheralId = String::from("01:02:03:04:05:06").into();
        assert_eq!(id.as_str(), "01:02:03:04:05:06");
    }

    #[test]
    fn test_peripheral_id_display() {
        let id = PeripheralId::new("AA:BB:CC:DD:EE:FF");
        assert_eq!(format!("{}", id), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_operation_kind_display() {
        assert_eq!(OperationKind::Connect.to_string(), "connect");
        assert_eq!(OperationKind::Read.to_string(), "read");
        assert_eq!(OperationKind::Write.to_string(), "write");
    }
}
