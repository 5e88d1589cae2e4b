//! Reconnecting duplex client.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;

use switchyard::{CoreError, GateConfig, Reason, Registry, Scheduler};

use crate::peer::{Peer, PeerEvent};
use crate::socket::tcp_socket;

fn default_reconnect_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DuplexClientConfig {
    /// Server address, e.g. `127.0.0.1:9000`.
    pub addr: String,
    /// Delay between reconnect attempts.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default)]
    pub gate: Option<GateConfig>,
}

impl DuplexClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            gate: None,
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

struct ClientInner {
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// A duplex client that keeps one [`Peer`] alive across reconnects.
///
/// The connect loop dials, pumps inbound frames until the socket drops, then
/// waits the configured delay and dials again, reusing the same peer object
/// so its scheduler resumes and requests issued after the reconnect succeed.
/// [`DuplexClient::close`] ends the loop for good.
#[derive(Clone)]
pub struct DuplexClient {
    peer: Peer,
    scheduler: Scheduler,
    inner: Arc<ClientInner>,
}

impl DuplexClient {
    pub fn connect(config: DuplexClientConfig, registry: Arc<Registry>) -> Self {
        let scheduler = Scheduler::new();
        let gate = config.gate.map(|gate| gate.build());
        let peer = Peer::new(&scheduler, config.addr.clone(), registry, gate);
        let inner = Arc::new(ClientInner {
            stopped: AtomicBool::new(false),
            task: Mutex::new(None),
        });

        let task = tokio::spawn(connect_loop(config, peer.clone(), inner.clone()));
        *inner.task.lock() = Some(task);

        Self {
            peer,
            scheduler,
            inner,
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// The client's transport scheduler (the peer's parent).
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn wait_connected(&self) {
        self.peer.wait_connected().await;
    }

    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<PeerEvent> {
        self.peer.subscribe()
    }

    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CoreError> {
        self.peer.request(method, params, timeout).await
    }

    pub fn notify(&self, method: &str, params: Value) -> Result<(), CoreError> {
        self.peer.notify(method, params)
    }

    /// Disconnects without reconnection intent.
    pub fn close(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.peer.close();
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        if self.peer.connected() {
            self.peer.detach();
        }
    }

    pub fn abort(&self, reason: Reason) {
        self.peer.abort(reason);
    }

    pub async fn wait_drain(&self) {
        self.peer.wait_drain().await;
    }
}

async fn connect_loop(config: DuplexClientConfig, peer: Peer, inner: Arc<ClientInner>) {
    loop {
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        match tokio::net::TcpStream::connect(&config.addr).await {
            Ok(stream) => {
                let (socket, mut frames) = tcp_socket(config.addr.clone(), stream);
                peer.attach(socket);
                while let Some(value) = frames.recv().await {
                    peer.handle_frame(value);
                }
                peer.detach();
            }
            Err(error) => {
                debug!("connect to {} failed: {error}", config.addr);
            }
        }
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(config.reconnect_delay()).await;
    }
}
