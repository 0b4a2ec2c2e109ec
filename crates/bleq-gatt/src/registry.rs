/*!
 * Session registry for bleq.
 *
 * Keeps at most one [`DeviceSession`] per peripheral id. Sessions are
 * created lazily on first reference and persist across connect and
 * disconnect cycles until explicitly removed or the registry shuts
 * down.
 */
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, info};

use bleq_core::types::PeripheralId;

use crate::error::{GattError, Result};
use crate::session::DeviceSession;
use crate::transport::Transport;

/// Capacity of the registry event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Events emitted when the set of sessions changes
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A session was created for a peripheral
    SessionCreated(PeripheralId),
    /// A session was removed and shut down
    SessionRemoved(PeripheralId),
}

/// Registry holding the one session per peripheral.
#[derive(Debug)]
pub struct SessionRegistry {
    transport: Arc<dyn Transport>,
    sessions: RwLock<HashMap<PeripheralId, Arc<DeviceSession>>>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl SessionRegistry {
    /// Create an empty registry backed by `transport`
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            sessions: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    /// Subscribe to registry events
    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// The session for `peripheral`, created if absent.
    pub fn get_or_create(&self, peripheral: &PeripheralId) -> Result<Arc<DeviceSession>> {
        {
            let sessions = self
                .sessions
                .read()
                .map_err(|_| GattError::other("session registry lock poisoned"))?;
            if let Some(session) = sessions.get(peripheral) {
                return Ok(session.clone());
            }
        }

        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| GattError::other("session registry lock poisoned"))?;
        // Another caller may have won the race for the write lock
        if let Some(session) = sessions.get(peripheral) {
            return Ok(session.clone());
        }
        info!("registering session for {}", peripheral);
        let session = Arc::new(DeviceSession::new(
            peripheral.clone(),
            self.transport.clone(),
        ));
        sessions.insert(peripheral.clone(), session.clone());
        let _ = self.event_tx.send(RegistryEvent::SessionCreated(peripheral.clone()));
        Ok(session)
    }

    /// The session for `peripheral`, if one exists
    pub fn get(&self, peripheral: &PeripheralId) -> Result<Option<Arc<DeviceSession>>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| GattError::other("session registry lock poisoned"))?;
        Ok(sessions.get(peripheral).cloned())
    }

    /// Remove the session for `peripheral` and shut it down.
    ///
    /// Fails with [`GattError::UnknownPeripheral`] when no session
    /// exists.
    pub async fn remove(&self, peripheral: &PeripheralId) -> Result<()> {
        let session = {
            let mut sessions = self
                .sessions
                .write()
                .map_err(|_| GattError::other("session registry lock poisoned"))?;
            sessions
                .remove(peripheral)
                .ok_or_else(|| GattError::UnknownPeripheral(peripheral.clone()))?
        };
        debug!("removing session for {}", peripheral);
        session.shutdown().await;
        let _ = self.event_tx.send(RegistryEvent::SessionRemoved(peripheral.clone()));
        Ok(())
    }

    /// Shut down every session and empty the registry
    pub async fn shutdown_all(&self) -> Result<()> {
        let sessions: Vec<_> = {
            let mut map = self
                .sessions
                .write()
                .map_err(|_| GattError::other("session registry lock poisoned"))?;
            map.drain().collect()
        };
        debug!("shutting down {} session(s)", sessions.len());
        for (peripheral, session) in sessions {
            session.shutdown().await;
            let _ = self.event_tx.send(RegistryEvent::SessionRemoved(peripheral));
        }
        Ok(())
    }

    /// Ids of every registered peripheral
    pub fn ids(&self) -> Result<Vec<PeripheralId>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| GattError::other("session registry lock poisoned"))?;
        Ok(sessions.keys().cloned().collect())
    }

    /// Number of registered sessions
    pub fn count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }
}
