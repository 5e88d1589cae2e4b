//! Pairs outbound JSON-RPC requests with inbound responses by id.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicI64, Ordering},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::{sync::oneshot, task::JoinHandle, time};
use tracing::debug;

use crate::counter::Counter;
use crate::error::{CoreError, Reason};
use crate::jsonrpc::{self, Frame};

struct Entry {
    tx: oneshot::Sender<Result<Value, CoreError>>,
    timeout: Option<JoinHandle<()>>,
}

struct Shared {
    pending: Mutex<HashMap<String, Entry>>,
    next_id: AtomicI64,
    drain: Counter,
}

/// The pending half of an outstanding request.
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Value, CoreError>>,
}

impl ResponseFuture {
    pub async fn recv(self) -> Result<Value, CoreError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CoreError::ChannelClosed),
        }
    }
}

/// Allocates request ids, tracks outstanding requests, enforces per-request
/// timeouts, and resolves futures when responses arrive.
///
/// Ids are a monotonic signed counter that wraps at the i64 bounds,
/// serialized as decimal strings; uniqueness holds while the number of
/// outstanding requests stays far below the id space.
#[derive(Clone)]
pub struct Correlator {
    shared: Arc<Shared>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(1),
                drain: Counter::new(),
            }),
        }
    }

    /// Registers a pending entry and returns the wire frame plus the future
    /// that resolves when the response arrives. `timeout: None` never fires;
    /// otherwise the entry is removed and rejected with
    /// [`CoreError::Timeout`] when the timer lapses, and a response arriving
    /// after that is dropped as unmatched.
    pub fn create_request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> (Value, ResponseFuture) {
        let id = self
            .shared
            .next_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let frame = jsonrpc::format_request(&id, method, params);
        let (tx, rx) = oneshot::channel();

        let timeout = timeout.map(|after| {
            let shared = self.shared.clone();
            let id = id.clone();
            tokio::spawn(async move {
                time::sleep(after).await;
                let entry = shared.pending.lock().remove(&id);
                if let Some(entry) = entry {
                    shared.drain.decrement(1);
                    let _ = entry.tx.send(Err(CoreError::Timeout(after)));
                }
            })
        });

        self.shared
            .pending
            .lock()
            .insert(id, Entry { tx, timeout });
        self.shared.drain.increment(1);

        (frame, ResponseFuture { rx })
    }

    /// Resolves the matching pending entry; returns whether one matched.
    pub fn deliver_response(&self, frame: &Frame) -> bool {
        let Frame::Response { id, result } = frame else {
            return false;
        };
        let key = match id {
            Value::String(text) => text.clone(),
            Value::Number(number) => number.to_string(),
            _ => return false,
        };
        let entry = self.shared.pending.lock().remove(&key);
        let Some(entry) = entry else {
            debug!("dropping response for unknown request id {key}");
            return false;
        };
        if let Some(timer) = entry.timeout {
            timer.abort();
        }
        self.shared.drain.decrement(1);
        let _ = entry.tx.send(result.clone().map_err(CoreError::Rpc));
        true
    }

    /// Drops a pending entry without resolving it, for requests that never
    /// made it onto the wire. The caller's future fails with
    /// [`CoreError::ChannelClosed`].
    pub fn forget(&self, id: &str) -> bool {
        let entry = self.shared.pending.lock().remove(id);
        match entry {
            Some(entry) => {
                if let Some(timer) = entry.timeout {
                    timer.abort();
                }
                self.shared.drain.decrement(1);
                true
            }
            None => false,
        }
    }

    /// Rejects every pending entry with `reason` and clears the table.
    pub fn abort_all(&self, reason: Reason) {
        let entries: Vec<Entry> = {
            let mut pending = self.shared.pending.lock();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            if let Some(timer) = entry.timeout {
                timer.abort();
            }
            self.shared.drain.decrement(1);
            let _ = entry.tx.send(Err(CoreError::Aborted(reason.clone())));
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Resolves when no entries remain outstanding.
    pub async fn wait_drain(&self) {
        self.shared.drain.wait_zero().await;
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}
