//! A named node on the cluster bus.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, warn};

use switchyard::{
    dispatch, jsonrpc, Correlator, CoreError, DispatchContext, Gate, Outbound, Reason, Registry,
    Scheduler,
};

use crate::bus::{BusEnvelope, ClusterBus};
use crate::{BusError, BROADCAST};

struct NodeInner {
    name: String,
    bus: Arc<dyn ClusterBus>,
    scheduler: Scheduler,
    correlator: Correlator,
    registry: Arc<Registry>,
    gate: Option<Gate>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NodeInner {
    fn publish(&self, to: &str, payload: Value) -> Result<(), CoreError> {
        let envelope = BusEnvelope {
            from: self.name.clone(),
            to: to.to_string(),
            payload,
        };
        self.bus.publish(envelope).map_err(|error| {
            warn!("publish from `{}` failed: {error}", self.name);
            CoreError::ChannelClosed
        })
    }

    fn handle(self: &Arc<Self>, envelope: BusEnvelope) {
        let frame = match jsonrpc::parse_value(envelope.payload) {
            Ok(frame) => frame,
            Err(error) => {
                warn!("dropping malformed bus payload from `{}`: {error}", envelope.from);
                return;
            }
        };
        let inner = self.clone();
        tokio::spawn(async move {
            let outbound = dispatch(
                frame,
                DispatchContext {
                    registry: &inner.registry,
                    scheduler: &inner.scheduler,
                    gate: inner.gate.as_ref(),
                    correlator: Some(&inner.correlator),
                    sender: Some(&envelope.from),
                    limited_by_default: false,
                    child_slot: None,
                },
            )
            .await;
            match outbound {
                Some(Outbound::Reply { frame, .. }) | Some(Outbound::Notify { frame }) => {
                    let _ = inner.publish(&envelope.from, frame);
                }
                None => {}
            }
        });
    }
}

/// A named endpoint on a [`ClusterBus`]: ignores envelopes addressed to
/// other nodes, answers requests through the shared dispatch pipeline, and
/// correlates its own outbound requests by id.
///
/// Responses to a request travel back over the bus addressed to the
/// requester by name. A node receives its own broadcasts like any other
/// subscriber; without a matching handler they are dropped silently, since
/// notifies never produce replies.
#[derive(Clone)]
pub struct BusNode {
    inner: Arc<NodeInner>,
}

impl BusNode {
    /// Joins the bus under `name`. The name `"all"` is reserved for
    /// broadcasts and refused.
    pub fn new(
        name: impl Into<String>,
        bus: Arc<dyn ClusterBus>,
        registry: Arc<Registry>,
        gate: Option<Gate>,
    ) -> Result<Self, BusError> {
        let name = name.into();
        if name == BROADCAST {
            return Err(BusError::ReservedName);
        }

        // Subscribe before the loop task spawns so nothing published after
        // construction can be missed.
        let receiver = bus.subscribe();
        let inner = Arc::new(NodeInner {
            name,
            bus,
            scheduler: Scheduler::new(),
            correlator: Correlator::new(),
            registry,
            gate,
            task: Mutex::new(None),
        });

        let task = tokio::spawn(run_loop(inner.clone(), receiver));
        *inner.task.lock() = Some(task);

        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Requests `method` from the node named `to`; the response is matched
    /// by id when it comes back addressed to this node.
    pub async fn request(
        &self,
        to: &str,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, CoreError> {
        let (frame, response) = self.inner.correlator.create_request(method, params, timeout);
        let id = frame["id"].as_str().unwrap_or_default().to_string();
        if let Err(error) = self.inner.publish(to, frame) {
            self.inner.correlator.forget(&id);
            return Err(error);
        }
        self.inner.scheduler.race(response.recv()).await?
    }

    /// Emits a notify addressed to every node.
    pub fn broadcast(&self, method: &str, params: Value) -> Result<(), CoreError> {
        self.inner.publish(BROADCAST, jsonrpc::format_notify(method, params))
    }

    /// Emits a notify addressed to one node.
    pub fn notify(&self, to: &str, method: &str, params: Value) -> Result<(), CoreError> {
        self.inner.publish(to, jsonrpc::format_notify(method, params))
    }

    /// Aborts in-flight handler executions and outstanding requests.
    pub fn abort(&self, reason: Reason) {
        self.inner.scheduler.abort(reason.clone());
        self.inner.correlator.abort_all(reason);
    }

    /// Leaves the bus; envelopes published afterwards are not delivered.
    pub fn close(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
    }

    pub async fn wait_drain(&self) {
        self.inner.scheduler.wait_drain().await;
        self.inner.correlator.wait_drain().await;
        if let Some(gate) = &self.inner.gate {
            gate.wait_drain().await;
        }
    }
}

async fn run_loop(inner: Arc<NodeInner>, mut receiver: broadcast::Receiver<BusEnvelope>) {
    loop {
        match receiver.recv().await {
            Ok(envelope) => {
                if envelope.to != BROADCAST && envelope.to != inner.name {
                    continue;
                }
                debug!(
                    "node `{}` accepted `{}` envelope from `{}`",
                    inner.name, envelope.to, envelope.from
                );
                inner.handle(envelope);
            }
            Err(broadcast::error::RecvError::Lagged(count)) => {
                warn!("node `{}` lagged behind the bus by {count} envelopes", inner.name);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
