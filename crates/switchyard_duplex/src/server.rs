//! Socket-indexed duplex server.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use switchyard::{Gate, GateConfig, Reason, Registry, Scheduler};

use crate::peer::{Peer, REPEAT_SOCKET_ID};
use crate::socket::{tcp_socket, SocketHandle};
use crate::DuplexError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DuplexServerConfig {
    #[serde(default)]
    pub gate: Option<GateConfig>,
}

struct ServerInner {
    scheduler: Scheduler,
    registry: Arc<Registry>,
    gate: Option<Gate>,
    peers: Mutex<HashMap<String, Peer>>,
    next_socket: AtomicU64,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// Listens for sockets, wraps each in a [`Peer`], and indexes peers by
/// socket id.
///
/// A connection reporting a socket id that already maps to a live peer
/// aborts and closes the existing peer before the new one replaces it; on
/// disconnect the index entry is removed only if it still points at the
/// disconnecting peer.
#[derive(Clone)]
pub struct DuplexServer {
    inner: Arc<ServerInner>,
}

impl DuplexServer {
    pub fn new(config: DuplexServerConfig, registry: Arc<Registry>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                scheduler: Scheduler::new(),
                registry,
                gate: config.gate.map(|gate| gate.build()),
                peers: Mutex::new(HashMap::new()),
                next_socket: AtomicU64::new(1),
                accept_task: Mutex::new(None),
            }),
        }
    }

    /// Binds the listener and spawns the accept loop; returns the local
    /// address for ephemeral-port setups.
    pub async fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, DuplexError> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| DuplexError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| DuplexError::Bind { addr, source })?;

        let server = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let id = format!(
                            "sock-{}",
                            server.inner.next_socket.fetch_add(1, Ordering::Relaxed)
                        );
                        let (socket, frames) = tcp_socket(id.clone(), stream);
                        server.adopt(id, socket, frames);
                    }
                    Err(error) => {
                        warn!("accept failed: {error}");
                        break;
                    }
                }
            }
        });
        *self.inner.accept_task.lock() = Some(task);
        Ok(local_addr)
    }

    /// Registers a connected socket: builds (or replaces) the peer for its
    /// id and spawns the pump that feeds inbound frames into dispatch.
    pub fn adopt(
        &self,
        id: String,
        socket: Arc<dyn SocketHandle>,
        mut frames: mpsc::UnboundedReceiver<Value>,
    ) -> Peer {
        let peer = {
            let mut peers = self.inner.peers.lock();
            if let Some(existing) = peers.remove(&id) {
                debug!("socket id {id} already mapped; replacing the live peer");
                existing.abort(Reason::new(REPEAT_SOCKET_ID));
                existing.close();
            }
            let peer = Peer::new(
                &self.inner.scheduler,
                id.clone(),
                self.inner.registry.clone(),
                self.inner.gate.clone(),
            );
            peers.insert(id.clone(), peer.clone());
            peer
        };
        peer.attach(socket);

        let server = self.inner.clone();
        let pump_peer = peer.clone();
        tokio::spawn(async move {
            while let Some(value) = frames.recv().await {
                pump_peer.handle_frame(value);
            }
            pump_peer.detach();
            let mut peers = server.peers.lock();
            if let Some(current) = peers.get(&id) {
                if Peer::ptr_eq(current, &pump_peer) {
                    peers.remove(&id);
                }
            }
        });
        peer
    }

    pub fn peer(&self, id: &str) -> Option<Peer> {
        self.inner.peers.lock().get(id).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().len()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Aborts every peer and stops accepting sockets.
    pub fn abort(&self, reason: Reason) {
        if let Some(task) = self.inner.accept_task.lock().take() {
            task.abort();
        }
        let peers: Vec<Peer> = self.inner.peers.lock().values().cloned().collect();
        for peer in peers {
            peer.abort(reason.clone());
            peer.close();
        }
        self.inner.scheduler.abort(reason);
    }

    /// Stops accepting new sockets; existing peers keep running.
    pub fn stop(&self) {
        if let Some(task) = self.inner.accept_task.lock().take() {
            task.abort();
        }
    }

    /// Awaits the transport scheduler, every peer, and the gate.
    pub async fn wait_drain(&self) {
        self.inner.scheduler.wait_drain().await;
        let peers: Vec<Peer> = self.inner.peers.lock().values().cloned().collect();
        for peer in peers {
            peer.wait_drain().await;
        }
        if let Some(gate) = &self.inner.gate {
            gate.wait_drain().await;
        }
    }
}
