use std::{
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    time::Duration,
};

use axum::{
    body::Body,
    extract::State,
    http::{header, Response, StatusCode},
    response::IntoResponse,
    routing::post,
    Router,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, warn};

use switchyard::{
    dispatch, jsonrpc, ChildSlot, DispatchContext, Gate, GateConfig, Outbound, Reason, Registry,
    Scheduler, DISCONNECTED,
};

use crate::HttpError;

const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";

fn default_path() -> String {
    "/".to_string()
}

fn default_drain_grace_secs() -> u64 {
    5
}

/// Gateway configuration; deserializable so deployments can load it from a
/// TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub gate: Option<GateConfig>,
    /// How long [`HttpGateway::wait_drain`] waits before giving up on
    /// in-flight work.
    #[serde(default = "default_drain_grace_secs")]
    pub drain_grace_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            gate: None,
            drain_grace_secs: default_drain_grace_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }
}

struct ServeState {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

struct GatewayInner {
    registry: Arc<Registry>,
    scheduler: Scheduler,
    gate: Option<Gate>,
    stopped: AtomicBool,
    path: String,
    drain_grace: Duration,
    serve: Mutex<Option<ServeState>>,
}

/// JSON-RPC over HTTP POST.
///
/// Each request body is a single JSON-RPC frame; the response body is the
/// matching result or error frame with HTTP 200, or HTTP 503 while the
/// gateway is stopped or its gate queue is full. A client that disconnects
/// mid-request aborts that request's scheduler with `disconnected`; the
/// handler unwinds and nothing is written to the dead socket.
#[derive(Clone)]
pub struct HttpGateway {
    inner: Arc<GatewayInner>,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig, registry: Arc<Registry>) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                registry,
                scheduler: Scheduler::new(),
                gate: config.gate.map(|gate| gate.build()),
                stopped: AtomicBool::new(false),
                path: config.path.clone(),
                drain_grace: config.drain_grace(),
                serve: Mutex::new(None),
            }),
        }
    }

    /// The transport scheduler in-flight requests are rooted at.
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn gate(&self) -> Option<&Gate> {
        self.inner.gate.as_ref()
    }

    /// The POST route; serve it with [`HttpGateway::serve`] or mount it into
    /// a larger router.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.inner.path, post(handle))
            .with_state(self.inner.clone())
    }

    /// Binds the listener and spawns the accept loop.
    pub async fn serve(&self, addr: SocketAddr) -> Result<SocketAddr, HttpError> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| HttpError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| HttpError::Bind { addr, source })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let router = self.router();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(error) = server.await {
                warn!("http gateway server error: {error}");
            }
        });
        *self.inner.serve.lock() = Some(ServeState {
            shutdown: Some(shutdown_tx),
            task,
        });
        Ok(local_addr)
    }

    /// Admits new requests again after a [`HttpGateway::stop`].
    pub fn start(&self) {
        self.inner.scheduler.resume();
        self.inner.stopped.store(false, Ordering::SeqCst);
    }

    /// Rejects new requests with 503; in-flight requests keep running.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    /// Cancels every in-flight request.
    pub fn abort(&self, reason: Reason) {
        self.inner.scheduler.abort(reason);
    }

    /// Waits for the scheduler and gate to drain, up to the configured grace
    /// period. Returns whether the drain completed; when it did not, lingering
    /// work is forcibly cancelled.
    pub async fn wait_drain(&self) -> bool {
        let inner = self.inner.clone();
        let drained = async move {
            inner.scheduler.wait_drain().await;
            if let Some(gate) = &inner.gate {
                gate.wait_drain().await;
            }
        };
        match tokio::time::timeout(self.inner.drain_grace, drained).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "drain grace of {:?} expired; terminating lingering requests",
                    self.inner.drain_grace
                );
                self.inner.scheduler.abort(Reason::new("shutdown"));
                false
            }
        }
    }

    /// Full shutdown: stop admissions, drain within the grace period, then
    /// tear down the listener (forcibly after one more grace period).
    pub async fn shutdown(&self) {
        self.stop();
        self.wait_drain().await;

        let state = self.inner.serve.lock().take();
        if let Some(mut state) = state {
            if let Some(shutdown) = state.shutdown.take() {
                let _ = shutdown.send(());
            }
            if tokio::time::timeout(self.inner.drain_grace, &mut state.task)
                .await
                .is_err()
            {
                state.task.abort();
            }
        }
    }
}

async fn handle(State(inner): State<Arc<GatewayInner>>, body: String) -> Response<Body> {
    if inner.stopped.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if let Some(gate) = &inner.gate {
        if gate.available() == 0 {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    let frame = match jsonrpc::parse_str(&body) {
        Ok(frame) => frame,
        Err(error) => {
            debug!("rejecting malformed request body: {error}");
            return json_response(StatusCode::OK, jsonrpc::format_error(&Value::Null, &error), &[]);
        }
    };

    // Dispatch on its own task so that dropping this future (hyper does so
    // when the client disconnects) aborts the request instead of silently
    // freezing the handler mid-poll.
    let slot = ChildSlot::new();
    let guard = DisconnectGuard {
        slot: slot.clone(),
        armed: true,
    };
    let dispatched = tokio::spawn({
        let inner = inner.clone();
        let slot = slot.clone();
        async move {
            dispatch(
                frame,
                DispatchContext {
                    registry: &inner.registry,
                    scheduler: &inner.scheduler,
                    gate: inner.gate.as_ref(),
                    correlator: None,
                    sender: None,
                    limited_by_default: true,
                    child_slot: Some(&slot),
                },
            )
            .await
        }
    });

    let outbound = match dispatched.await {
        Ok(outbound) => outbound,
        Err(error) => {
            warn!("dispatch task failed: {error}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    guard.disarm();

    match outbound {
        Some(Outbound::Reply { frame, http }) => {
            let status = http
                .as_ref()
                .and_then(|meta| StatusCode::from_u16(meta.status).ok())
                .unwrap_or(StatusCode::OK);
            let headers = http.map(|meta| meta.headers).unwrap_or_default();
            json_response(status, frame, &headers)
        }
        Some(Outbound::Notify { .. }) => {
            warn!("handler produced an out-of-band notify on HTTP; dropping");
            empty_response()
        }
        None => empty_response(),
    }
}

/// Aborts the in-flight request when the response future is dropped before
/// dispatch finished.
struct DisconnectGuard {
    slot: Arc<ChildSlot>,
    armed: bool,
}

impl DisconnectGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.armed {
            self.slot.abort(Reason::new(DISCONNECTED));
        }
    }
}

fn json_response(status: StatusCode, body: Value, headers: &[(String, String)]) -> Response<Body> {
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, CONTENT_TYPE_JSON);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    match builder.body(Body::from(body.to_string())) {
        Ok(response) => response,
        Err(error) => {
            warn!("failed to assemble response: {error}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn empty_response() -> Response<Body> {
    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, CONTENT_TYPE_JSON)
        .body(Body::empty())
    {
        Ok(response) => response,
        Err(_) => StatusCode::OK.into_response(),
    }
}
