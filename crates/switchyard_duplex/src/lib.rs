#![forbid(unsafe_code)]
//! Bidirectional JSON-RPC over message-oriented sockets.
//!
//! Client and server share one [`Peer`] state machine: a socket bound to a
//! scheduler (a child of the transport root), a per-peer correlator, the
//! handler registry, and an optional gate. Frames are newline-delimited
//! JSON; there is no additional framing above the socket layer. Handlers on
//! this transport are *not* gated by default: only handler entries
//! registered with `limited(true)` go through the gate, and a saturated
//! gate answers id-bearing requests with the server-busy code instead of
//! dropping the frame.
//!
//! Disconnect aborts the peer scheduler with [`DISCONNECT`] and detaches it;
//! reconnect resumes and reattaches the same peer, which is what lets a
//! [`DuplexClient`] pick up where it left off after the socket drops.

mod client;
mod peer;
mod server;
mod socket;

use std::net::SocketAddr;

use thiserror::Error;

pub use client::{DuplexClient, DuplexClientConfig};
pub use peer::{Peer, PeerEvent, DISCONNECT, REPEAT_SOCKET_ID};
pub use server::{DuplexServer, DuplexServerConfig};
pub use socket::{memory_socket, tcp_socket, MemorySocket, SocketHandle, TcpSocket};

/// Fatal startup errors for the duplex transport.
#[derive(Debug, Error)]
pub enum DuplexError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
