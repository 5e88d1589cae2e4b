//! The cluster bus seam and its in-process implementation.

use serde_json::Value;
use tokio::sync::broadcast;

use crate::BusError;

/// Addressed bus message: `to == "all"` broadcasts, anything else is picked
/// up only by the node carrying that name.
#[derive(Debug, Clone, PartialEq)]
pub struct BusEnvelope {
    pub from: String,
    pub to: String,
    pub payload: Value,
}

/// The external fan-out primitive nodes communicate over. Implementations
/// deliver every published envelope to every subscriber; addressing is the
/// node's concern, not the bus's.
pub trait ClusterBus: Send + Sync + 'static {
    fn publish(&self, envelope: BusEnvelope) -> Result<(), BusError>;
    fn subscribe(&self) -> broadcast::Receiver<BusEnvelope>;
}

/// A single-process bus over a tokio broadcast channel, for tests and
/// same-process clusters.
pub struct InMemoryBus {
    tx: broadcast::Sender<BusEnvelope>,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ClusterBus for InMemoryBus {
    fn publish(&self, envelope: BusEnvelope) -> Result<(), BusError> {
        // A bus with no subscribers simply drops the envelope.
        let _ = self.tx.send(envelope);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusEnvelope> {
        self.tx.subscribe()
    }
}
