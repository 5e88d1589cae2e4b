//! The peer state machine shared by the duplex client and server.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use switchyard::{
    dispatch, jsonrpc, Correlator, CoreError, DispatchContext, Gate, Outbound, Reason, Registry,
    Scheduler,
};

use crate::socket::SocketHandle;

/// Abort reason recorded when the underlying socket disconnects.
pub const DISCONNECT: &str = "disconnect";
/// Abort reason used when a new connection reuses a live socket id.
pub const REPEAT_SOCKET_ID: &str = "repeat socket id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Connect,
    Disconnect,
}

struct PeerInner {
    id: String,
    scheduler: Scheduler,
    correlator: Correlator,
    registry: Arc<Registry>,
    gate: Option<Gate>,
    socket: Mutex<Option<Arc<dyn SocketHandle>>>,
    sinks: Mutex<Vec<mpsc::UnboundedSender<PeerEvent>>>,
    connected: watch::Sender<bool>,
}

impl PeerInner {
    fn send(&self, frame: Value) -> bool {
        let socket = self.socket.lock().clone();
        match socket {
            Some(socket) => socket.send(frame),
            None => false,
        }
    }

    fn emit(&self, event: PeerEvent) {
        self.sinks.lock().retain(|sink| sink.send(event).is_ok());
    }
}

/// A bidirectional endpoint binding a socket to a scheduler, a per-peer
/// correlator, the shared handler registry, and an optional gate.
///
/// The same peer object survives reconnects: a `disconnect` aborts its
/// scheduler with [`DISCONNECT`] and detaches it from the transport's abort
/// broadcast; the next `connect` resumes and reattaches it, so requests
/// issued afterwards run as if the drop never happened. Outstanding
/// correlator entries are *not* rejected on disconnect; they age out
/// through their own timeouts unless [`Peer::abort`] is called.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    pub fn new(
        parent: &Scheduler,
        id: impl Into<String>,
        registry: Arc<Registry>,
        gate: Option<Gate>,
    ) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(PeerInner {
                id: id.into(),
                scheduler: parent.child(),
                correlator: Correlator::new(),
                registry,
                gate,
                socket: Mutex::new(None),
                sinks: Mutex::new(Vec::new()),
                connected,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Whether two handles refer to the same peer.
    pub fn ptr_eq(a: &Peer, b: &Peer) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Streams connect/disconnect events; dead receivers are pruned on emit.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.sinks.lock().push(tx);
        rx
    }

    /// Resolves once the peer is connected.
    pub async fn wait_connected(&self) {
        let mut rx = self.inner.connected.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Socket-connected transition: resume a `disconnect` abort, reattach to
    /// the transport's abort broadcast, and emit [`PeerEvent::Connect`].
    pub fn attach(&self, socket: Arc<dyn SocketHandle>) {
        if let Some(reason) = self.inner.scheduler.reason() {
            if reason == DISCONNECT {
                self.inner.scheduler.resume();
            }
        }
        self.inner.scheduler.recover();
        *self.inner.socket.lock() = Some(socket);
        let _ = self.inner.connected.send(true);
        self.inner.emit(PeerEvent::Connect);
    }

    /// Socket-gone transition: abort in-flight work with [`DISCONNECT`]
    /// (unless already aborted), detach from the abort broadcast, and emit
    /// [`PeerEvent::Disconnect`].
    pub fn detach(&self) {
        if !self.inner.scheduler.aborted() {
            self.inner.scheduler.abort(Reason::new(DISCONNECT));
        }
        self.inner.scheduler.destroy();
        *self.inner.socket.lock() = None;
        let _ = self.inner.connected.send(false);
        self.inner.emit(PeerEvent::Disconnect);
    }

    /// Feeds one raw inbound value through the dispatch pipeline. Malformed
    /// frames are logged and dropped; handler execution is spawned so slow
    /// handlers do not stall the socket pump.
    pub fn handle_frame(&self, value: Value) {
        let frame = match jsonrpc::parse_value(value) {
            Ok(frame) => frame,
            Err(error) => {
                warn!("dropping malformed inbound frame: {error}");
                return;
            }
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outbound = dispatch(
                frame,
                DispatchContext {
                    registry: &inner.registry,
                    scheduler: &inner.scheduler,
                    gate: inner.gate.as_ref(),
                    correlator: Some(&inner.correlator),
                    sender: Some(&inner.id),
                    limited_by_default: false,
                    child_slot: None,
                },
            )
            .await;
            match outbound {
                Some(Outbound::Reply { frame, .. }) | Some(Outbound::Notify { frame }) => {
                    if !inner.send(frame) {
                        debug!("dropping outbound frame for disconnected peer {}", inner.id);
                    }
                }
                None => {}
            }
        });
    }

    /// Issues a request to the remote side, raced against this peer's
    /// scheduler so a disconnect fails it with [`DISCONNECT`].
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CoreError> {
        let (frame, response) = self.inner.correlator.create_request(method, params, timeout);
        let id = frame["id"].as_str().unwrap_or_default().to_string();
        if !self.inner.send(frame) {
            self.inner.correlator.forget(&id);
            return Err(CoreError::ChannelClosed);
        }
        self.inner.scheduler.race(response.recv()).await?
    }

    /// Fire-and-forget notify; fails only when the socket is gone.
    pub fn notify(&self, method: &str, params: Value) -> Result<(), CoreError> {
        if self.inner.send(jsonrpc::format_notify(method, params)) {
            Ok(())
        } else {
            Err(CoreError::ChannelClosed)
        }
    }

    /// Commands the underlying socket to disconnect.
    pub fn close(&self) {
        let socket = self.inner.socket.lock().clone();
        if let Some(socket) = socket {
            socket.close();
        }
    }

    /// Aborts both the scheduler and the correlator.
    pub fn abort(&self, reason: Reason) {
        self.inner.scheduler.abort(reason.clone());
        self.inner.correlator.abort_all(reason);
    }

    /// Awaits the scheduler, the correlator, and the gate.
    pub async fn wait_drain(&self) {
        self.inner.scheduler.wait_drain().await;
        self.inner.correlator.wait_drain().await;
        if let Some(gate) = &self.inner.gate {
            gate.wait_drain().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::socket::memory_socket;

    use super::*;

    fn peer() -> (Scheduler, Peer) {
        let root = Scheduler::new();
        let peer = Peer::new(&root, "s1", Arc::new(Registry::new()), None);
        (root, peer)
    }

    #[tokio::test]
    async fn request_without_a_socket_fails_cleanly() {
        let (_root, peer) = peer();
        let result = peer.request("echo", json!(null), None).await;
        assert!(matches!(result, Err(CoreError::ChannelClosed)));
        // The never-sent request left nothing outstanding.
        peer.wait_drain().await;
    }

    #[tokio::test]
    async fn connect_after_disconnect_resumes_the_scheduler() {
        let (_root, peer) = peer();
        let mut events = peer.subscribe();

        let (socket, _outbound, _closer) = memory_socket("s1");
        peer.attach(socket);
        assert_eq!(events.try_recv().unwrap(), PeerEvent::Connect);
        assert!(peer.connected());

        peer.detach();
        assert_eq!(events.try_recv().unwrap(), PeerEvent::Disconnect);
        assert!(peer.scheduler().aborted());
        assert_eq!(peer.scheduler().reason().unwrap(), DISCONNECT);

        let (socket, _outbound, _closer) = memory_socket("s1");
        peer.attach(socket);
        assert_eq!(events.try_recv().unwrap(), PeerEvent::Connect);
        assert!(!peer.scheduler().aborted());
        assert!(!peer.scheduler().destroyed());
    }

    #[tokio::test]
    async fn detach_keeps_a_foreign_abort_reason() {
        let (_root, peer) = peer();
        let (socket, _outbound, _closer) = memory_socket("s1");
        peer.attach(socket);

        peer.abort(Reason::new(REPEAT_SOCKET_ID));
        peer.detach();
        assert_eq!(peer.scheduler().reason().unwrap(), REPEAT_SOCKET_ID);

        // A later reconnect must not resume a repeat-socket-id abort.
        let (socket, _outbound, _closer) = memory_socket("s1");
        peer.attach(socket);
        assert!(peer.scheduler().aborted());
    }
}
