/*!
 * Transport boundary for bleq.
 *
 * The actual OS Bluetooth binding lives behind the [`Transport`] and
 * [`Channel`] traits. Every channel call is asynchronous at the call
 * level: it returns as soon as the request is handed to the driver, and
 * the result (if any) arrives later as a [`ChannelEvent`] on the event
 * sender supplied at connect time. Within one session the driver
 * delivers events in the order the transport emits them.
 */
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use bleq_core::types::{CharacteristicId, DescriptorId, PeripheralId, ServiceId};

use crate::error::Result;

/// Raw status code reported by the native layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status(pub i32);

impl Status {
    /// The success status code
    pub const SUCCESS: Status = Status(0);

    /// Whether this status reports success
    pub fn is_success(&self) -> bool {
        self.0 == 0
    }
}

/// Descriptor value enabling notification delivery
pub const NOTIFY_ENABLE: [u8; 2] = [0x01, 0x00];

/// Descriptor value disabling notification delivery
pub const NOTIFY_DISABLE: [u8; 2] = [0x00, 0x00];

/// Asynchronous completion delivered by the driver for one channel.
///
/// Every connect/read/write request produces exactly zero or one of the
/// matching events; `ValueChanged` and `Disconnected` are unsolicited.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The physical connection was established
    Connected,
    /// The connection attempt failed
    ConnectFailed {
        /// Driver status code
        status: Status,
    },
    /// The connection dropped (requested or unsolicited)
    Disconnected,
    /// Service discovery finished
    ServicesDiscovered {
        /// Driver status code
        status: Status,
    },
    /// A characteristic read completed
    ReadResult {
        /// The characteristic that was read
        characteristic: CharacteristicId,
        /// Driver status code
        status: Status,
        /// The data, when the read succeeded
        data: Option<Bytes>,
    },
    /// A characteristic write completed
    WriteResult {
        /// The characteristic that was written
        characteristic: CharacteristicId,
        /// Driver status code
        status: Status,
    },
    /// Unsolicited notification with a new characteristic value
    ValueChanged {
        /// The characteristic whose value changed
        characteristic: CharacteristicId,
        /// The new value
        data: Bytes,
    },
}

/// An advertisement observed while scanning
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// The advertising peripheral
    pub peripheral: PeripheralId,
    /// The advertised device name, if any
    pub name: Option<String>,
    /// Received signal strength
    pub rssi: i16,
    /// When the advertisement was observed
    pub discovered_at: DateTime<Utc>,
}

/// The live connection handle to one peripheral.
///
/// Owned solely by the session that created it; all calls are
/// fire-and-forget at the native level, with results delivered as
/// [`ChannelEvent`]s.
#[async_trait]
pub trait Channel: Send + Sync + Debug {
    /// Start service discovery
    async fn discover_services(&self) -> Result<()>;

    /// Issue a characteristic read
    async fn read(&self, service: ServiceId, characteristic: CharacteristicId) -> Result<()>;

    /// Issue a characteristic write
    async fn write(
        &self,
        service: ServiceId,
        characteristic: CharacteristicId,
        data: Bytes,
    ) -> Result<()>;

    /// Write a descriptor value (used to toggle notifications)
    async fn write_descriptor(
        &self,
        service: ServiceId,
        characteristic: CharacteristicId,
        descriptor: DescriptorId,
        data: Bytes,
    ) -> Result<()>;

    /// Request a disconnect; the `Disconnected` event confirms it
    async fn disconnect(&self) -> Result<()>;

    /// Release the native handle. Idempotent; no further events follow.
    async fn close(&self);
}

/// The OS Bluetooth binding.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Begin connecting to a peripheral.
    ///
    /// Returns the channel handle immediately; the outcome arrives as a
    /// `Connected` or `ConnectFailed` event on `events`. All events for
    /// the returned channel are delivered on `events` in driver order.
    async fn connect(
        &self,
        peripheral: &PeripheralId,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<std::sync::Arc<dyn Channel>>;

    /// Start advertising scan, delivering results on `events`
    async fn start_scan(&self, events: mpsc::Sender<Advertisement>) -> Result<()>;

    /// Stop an in-progress scan. Idempotent.
    async fn stop_scan(&self);
}
