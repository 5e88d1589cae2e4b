#![forbid(unsafe_code)]
//! Cooperative concurrency core for JSON-RPC 2.0 services.
//!
//! Three tightly coupled subsystems back every transport built on this
//! crate:
//! - [`Scheduler`]: a hierarchical cancellation tree driving cooperative
//!   tasks; aborts carry a [`Reason`], fan out to descendants, and wake
//!   in-flight [`Scheduler::race`] waits without waiting for their futures.
//! - [`Gate`]: a fixed token pool with a bounded FIFO wait queue that caps
//!   concurrent handler executions deterministically.
//! - [`Correlator`]: pairs outbound requests with inbound responses by id
//!   and enforces per-request timeouts.
//!
//! [`dispatch`] binds them together: it decodes an inbound frame, routes
//! responses to the correlator, runs registered handlers under fresh child
//! schedulers (optionally through the gate), and maps outcomes to outbound
//! frames. The HTTP, duplex-socket, and bus adapters in the sibling crates
//! are thin shells around this pipeline.
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use switchyard::{
//!     dispatch, handler_fn, jsonrpc, DispatchContext, HandlerReply, Registry, Scheduler,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = Registry::new();
//! registry.register(
//!     "echo",
//!     handler_fn(|ctx| async move { Ok(HandlerReply::result(ctx.params)) }),
//! );
//!
//! let scheduler = Scheduler::new();
//! let frame = jsonrpc::parse_str(r#"{"jsonrpc":"2.0","id":"1","method":"echo","params":"wuhu"}"#)
//!     .expect("well-formed frame");
//! let outbound = dispatch(
//!     frame,
//!     DispatchContext {
//!         registry: &registry,
//!         scheduler: &scheduler,
//!         gate: None,
//!         correlator: None,
//!         sender: None,
//!         limited_by_default: false,
//!         child_slot: None,
//!     },
//! )
//! .await;
//! # let _ = outbound;
//! # }
//! ```

mod channel;
mod correlator;
mod counter;
mod dispatch;
mod error;
mod gate;
pub mod jsonrpc;
mod registry;
mod scheduler;

pub use channel::Channel;
pub use correlator::{Correlator, ResponseFuture};
pub use counter::Counter;
pub use dispatch::{dispatch, ChildSlot, DispatchContext, HttpMeta, Outbound, DISCONNECTED};
pub use error::{CoreError, Reason};
pub use gate::{AcquireHandle, Gate, GateConfig, PendingToken, Token, TokenStatus};
pub use jsonrpc::{ErrorObject, Frame};
pub use registry::{
    handler_fn, Handler, HandlerContext, HandlerEntry, HandlerFuture, HandlerReply, Registry,
};
pub use scheduler::Scheduler;
