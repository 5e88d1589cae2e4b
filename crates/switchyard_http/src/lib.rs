#![forbid(unsafe_code)]
//! HTTP POST transport for switchyard JSON-RPC services.
//!
//! [`HttpGateway`] turns POST bodies into dispatcher input and handler
//! output into HTTP responses. Admission runs three checks in order: a
//! stopped gateway answers 503, a full gate queue answers 503 before
//! anything is queued, and only then does the frame reach the shared
//! dispatch pipeline. Handlers are gated by default on this transport.
//!
//! Client disconnects are honored: when the peer drops the connection
//! mid-request, the per-request scheduler is aborted with `disconnected`,
//! the handler's race waits wake, and no reply is written.

mod gateway;

use std::net::SocketAddr;

use thiserror::Error;

pub use gateway::{GatewayConfig, HttpGateway};
pub use switchyard::GateConfig;

/// Fatal startup errors for the HTTP transport.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
