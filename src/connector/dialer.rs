//! Connection memoization keyed by host name

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Connection, Connector};
use crate::error::Result;
use crate::host::Host;

type Slot = Arc<Mutex<Option<Arc<dyn Connection>>>>;

/// Hands out at most one live connection per host
///
/// Concurrent first requests for the same host wait on that host's slot,
/// so only one of them dials.
#[derive(Clone)]
pub struct Dialer {
    connector: Arc<dyn Connector>,
    slots: Arc<DashMap<String, Slot>>,
}

impl Dialer {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Get the memoized connection for `host`, connecting on first use
    pub async fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>> {
        loop {
            let slot: Slot = self
                .slots
                .entry(host.name().to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone();

            let mut guard = slot.lock().await;
            // A concurrent close retired this slot while we waited on it
            if !self.is_current(host.name(), &slot) {
                continue;
            }
            if let Some(conn) = guard.as_ref() {
                return Ok(Arc::clone(conn));
            }

            debug!(host = %host.name(), "dialing");
            let conn = self.connector.connect(host).await?;
            *guard = Some(Arc::clone(&conn));
            return Ok(conn);
        }
    }

    /// Close and forget the connection for `host`
    ///
    /// The slot stays locked until it is unmapped, so no dial can land in it.
    pub async fn close(&self, host_name: &str) {
        let Some(slot) = self.slots.get(host_name).map(|s| Arc::clone(s.value())) else {
            return;
        };
        let mut guard = slot.lock().await;
        let conn = guard.take();
        self.slots
            .remove_if(host_name, |_, current| Arc::ptr_eq(current, &slot));
        drop(guard);

        if let Some(conn) = conn {
            if let Err(e) = conn.close().await {
                warn!(host = %host_name, error = %e, "failed to close connection");
            }
        }
    }

    fn is_current(&self, host_name: &str, slot: &Slot) -> bool {
        self.slots
            .get(host_name)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    pub async fn close_all(&self) {
        let names: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.close(&name).await;
        }
    }

    /// Whether a live connection is memoized for `host_name`
    pub fn is_connected(&self, host_name: &str) -> bool {
        self.slots
            .get(host_name)
            .map(|slot| slot.try_lock().map(|g| g.is_some()).unwrap_or(true))
            .unwrap_or(false)
    }
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("connections", &self.slots.len())
            .finish()
    }
}
