#![forbid(unsafe_code)]
//! Server-to-server JSON-RPC messaging over a pluggable broadcast bus.
//!
//! Each process joins the bus as a named [`BusNode`]; messages are
//! `(from, to, payload)` triples where `to == "all"` fans out to every
//! node. Requests and responses ride the same correlator machinery as the
//! point-to-point transports; a response simply travels back addressed to
//! the requester by name. The bus primitive itself is external; the
//! in-process [`InMemoryBus`] serves tests and single-process clusters.

mod bus;
mod node;

use thiserror::Error;

pub use bus::{BusEnvelope, ClusterBus, InMemoryBus};
pub use node::BusNode;

/// The reserved broadcast address.
pub const BROADCAST: &str = "all";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("node name `all` is reserved for broadcasts")]
    ReservedName,
    #[error("bus publish failed: {0}")]
    Publish(String),
}
