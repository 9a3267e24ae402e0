//! TCP relay broker.
//!
//! A minimal pub/sub hub for [`super::TcpRelay`] clients: every envelope
//! received from one peer is forwarded to all other peers. Frames are
//! length-prefixed MessagePack. Delivery is best-effort; a peer that cannot
//! keep up has envelopes dropped rather than slowing down the others.
//!
//! When a peer disconnects, the broker publishes
//! [`super::RelayEvent::InstanceLeft`] on behalf of the instance it carried,
//! so the remaining instances can expire that instance's connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use hubwire_core::InstanceId;
use hubwire_protocol::{read_frame, write_frame};

use super::{RelayEnvelope, RelayEvent};
use crate::error::ServerResult;

/// Envelopes queued per peer before the broker starts dropping for it.
const PEER_QUEUE: usize = 1024;

type Peers = Arc<RwLock<HashMap<u64, mpsc::Sender<RelayEnvelope>>>>;

/// Accepts relay clients and fans envelopes out between them.
pub struct RelayBroker {
    listener: TcpListener,
    peers: Peers,
    next_peer: AtomicU64,
    /// Limits concurrent peers.
    peer_slots: Arc<Semaphore>,
}

impl RelayBroker {
    /// Binds the broker to `addr`.
    pub async fn bind(addr: SocketAddr, max_peers: usize) -> ServerResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Relay broker listening");
        Ok(Self {
            listener,
            peers: Arc::new(RwLock::new(HashMap::new())),
            next_peer: AtomicU64::new(1),
            peer_slots: Arc::new(Semaphore::new(max_peers.max(1))),
        })
    }

    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Runs the accept loop forever.
    pub async fn run(&self) -> ServerResult<()> {
        loop {
            let Ok(permit) = self.peer_slots.clone().acquire_owned().await else {
                return Ok(());
            };
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
                    debug!(peer = id, addr = %addr, "Relay peer connected");
                    tokio::spawn(serve_peer(id, stream, self.peers.clone(), permit));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept relay peer");
                    // Continue accepting despite errors
                }
            }
        }
    }

    /// Runs the accept loop until `shutdown` completes.
    pub async fn run_until_shutdown<S>(&self, shutdown: S) -> ServerResult<()>
    where
        S: std::future::Future<Output = ()> + Send,
    {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown => {
                info!("Relay broker shutting down");
                self.peers.write().await.clear();
                Ok(())
            }
        }
    }
}

async fn serve_peer(id: u64, stream: TcpStream, peers: Peers, _permit: OwnedSemaphorePermit) {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<RelayEnvelope>(PEER_QUEUE);
    peers.write().await.insert(id, tx);

    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &envelope).await {
                debug!(peer = id, error = %e, "Relay peer write failed");
                break;
            }
        }
    });

    let mut instance: Option<InstanceId> = None;
    loop {
        match read_frame::<_, RelayEnvelope>(&mut read_half).await {
            Ok(Some(envelope)) => {
                if instance.is_none() {
                    instance = Some(envelope.origin.clone());
                }
                fan_out(id, envelope, &peers).await;
            }
            Ok(None) => break,
            Err(e) => {
                warn!(peer = id, error = %e, "Dropping relay peer after bad frame");
                break;
            }
        }
    }

    peers.write().await.remove(&id);
    writer.abort();
    debug!(peer = id, instance = ?instance, "Relay peer disconnected");
    if let Some(origin) = instance {
        let left = RelayEnvelope {
            origin,
            hub: String::new(),
            event: RelayEvent::InstanceLeft,
        };
        fan_out(id, left, &peers).await;
    }
}

async fn fan_out(from: u64, envelope: RelayEnvelope, peers: &Peers) {
    let peers = peers.read().await;
    for (id, tx) in peers.iter().filter(|(id, _)| **id != from) {
        if tx.try_send(envelope.clone()).is_err() {
            warn!(peer = *id, "Relay peer queue full, envelope dropped");
        }
    }
}
