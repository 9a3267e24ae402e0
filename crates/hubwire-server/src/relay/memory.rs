use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{broadcast, mpsc, watch};
use tracing::info;

use hubwire_core::InstanceId;

use super::{RelayEnvelope, RelayHealth, RelayTransport, forward_remote};
use crate::error::{RelayError, RelayResult};
use crate::hub::BoxFuture;

/// In-process relay for several dispatchers sharing one process.
///
/// Availability can be switched off to exercise the degraded path.
#[derive(Clone)]
pub struct MemoryRelay {
    feed: broadcast::Sender<RelayEnvelope>,
    available: Arc<AtomicBool>,
    health: Arc<watch::Sender<RelayHealth>>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MemoryRelay {
    pub fn new(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        let (health, _) = watch::channel(RelayHealth::Connected);
        Self {
            feed,
            available: Arc::new(AtomicBool::new(true)),
            health: Arc::new(health),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
        let health = if available {
            RelayHealth::Connected
        } else {
            RelayHealth::Degraded
        };
        if self.health.send_replace(health) != health {
            info!(health = ?health, "Memory relay availability changed");
        }
    }
}

impl RelayTransport for MemoryRelay {
    fn publish(&self, envelope: RelayEnvelope) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(async move {
            if !self.available.load(Ordering::Acquire) {
                return Err(RelayError::unavailable("memory relay switched off"));
            }
            // No subscribers is not an error: there is simply nobody else.
            let _ = self.feed.send(envelope);
            Ok(())
        })
    }

    fn subscribe(&self, instance: &InstanceId) -> mpsc::Receiver<RelayEnvelope> {
        forward_remote(self.feed.subscribe(), instance.clone())
    }

    fn health(&self) -> watch::Receiver<RelayHealth> {
        self.health.subscribe()
    }
}
