//! The uniform inbound-frame pipeline: resolve a handler, run it under a
//! fresh child scheduler (optionally through the gate), and map the outcome
//! to an outbound frame.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::correlator::Correlator;
use crate::error::{CoreError, Reason};
use crate::gate::Gate;
use crate::jsonrpc::{self, ErrorObject, Frame};
use crate::registry::{Handler, HandlerContext, HandlerReply, Registry};
use crate::scheduler::Scheduler;

/// Abort reason used when an HTTP client drops mid-request. Handler failures
/// carrying it are swallowed instead of mapped to an error reply.
pub const DISCONNECTED: &str = "disconnected";

/// HTTP decoration attached to a reply by a [`HandlerReply::Http`] envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpMeta {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// What the transport should put on the wire, if anything.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A response frame for the request id.
    Reply {
        frame: Value,
        http: Option<HttpMeta>,
    },
    /// An out-of-band notify addressed to the sender; no reply is emitted
    /// for the request id.
    Notify { frame: Value },
}

/// Hands the per-request child scheduler to the transport so it can abort it
/// from outside the dispatch future (HTTP client disconnect).
#[derive(Default)]
pub struct ChildSlot {
    slot: Mutex<Option<Scheduler>>,
}

impl ChildSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Aborts the published child if it still has running work.
    pub fn abort(&self, reason: Reason) {
        let child = self.slot.lock().clone();
        if let Some(child) = child {
            if child.running_tasks() > 0 {
                child.abort(reason);
            }
        }
    }

    fn publish(&self, child: Scheduler) {
        *self.slot.lock() = Some(child);
    }
}

/// Everything the dispatcher needs from the transport it serves.
pub struct DispatchContext<'a> {
    pub registry: &'a Registry,
    /// The transport scheduler request children are rooted at by default.
    pub scheduler: &'a Scheduler,
    pub gate: Option<&'a Gate>,
    pub correlator: Option<&'a Correlator>,
    /// Peer identity; `None` on HTTP.
    pub sender: Option<&'a str>,
    /// Whether bare handlers go through the gate (HTTP yes, duplex no).
    pub limited_by_default: bool,
    pub child_slot: Option<&'a Arc<ChildSlot>>,
}

/// Runs one decoded frame through the dispatch pipeline.
///
/// Responses route to the correlator. Requests and notifies resolve a
/// handler and run it under a fresh child scheduler; notifies never produce
/// a reply, gate saturation answers id-bearing requests with the server-busy
/// code, and the child scheduler is destroyed on every path.
pub async fn dispatch(frame: Frame, cx: DispatchContext<'_>) -> Option<Outbound> {
    let (id, method, params) = match frame {
        Frame::Response { .. } => {
            match cx.correlator {
                Some(correlator) if correlator.deliver_response(&frame) => {}
                _ => debug!("dropping unmatched response frame"),
            }
            return None;
        }
        Frame::Request { id, method, params } => (Some(id), method, params),
        Frame::Notify { method, params } => (None, method, params),
    };

    let Some(entry) = cx.registry.get(&method) else {
        return match id {
            Some(id) => Some(reply(jsonrpc::format_error(
                &id,
                &ErrorObject::method_not_found(),
            ))),
            None => {
                debug!("dropping notify for unregistered method `{method}`");
                None
            }
        };
    };

    let parent = entry.parent.unwrap_or_else(|| cx.scheduler.clone());
    let limited = entry.limited.unwrap_or(cx.limited_by_default);
    let child = parent.child();
    if let Some(slot) = cx.child_slot {
        slot.publish(child.clone());
    }

    let context = HandlerContext {
        params,
        scheduler: child.clone(),
        sender: cx.sender.map(str::to_string),
    };
    let gate = if limited { cx.gate } else { None };
    let outcome = run_handler(&child, entry.handler, context, gate).await;
    child.destroy();

    match outcome {
        Ok(HandlerReply::None) => None,
        Ok(HandlerReply::Result(value)) => match id {
            Some(id) => Some(reply(jsonrpc::format_result(&id, value))),
            None => {
                warn!("handler for notify `{method}` returned a value; discarding");
                None
            }
        },
        Ok(HandlerReply::Notify { method, params }) => Some(Outbound::Notify {
            frame: jsonrpc::format_notify(&method, params),
        }),
        Ok(HandlerReply::Http {
            status,
            headers,
            result,
        }) => match id {
            Some(id) => Some(Outbound::Reply {
                frame: jsonrpc::format_result(&id, result),
                http: Some(HttpMeta { status, headers }),
            }),
            None => {
                warn!("handler for notify `{method}` returned a value; discarding");
                None
            }
        },
        Err(error) => {
            if let Some(reason) = error.abort_reason() {
                if *reason == DISCONNECTED {
                    debug!("request for `{method}` abandoned by disconnected client");
                    return None;
                }
            }
            match id {
                Some(id) => Some(reply(jsonrpc::format_error(&id, &ErrorObject::from(&error)))),
                None => {
                    debug!("notify handler for `{method}` failed: {error}");
                    None
                }
            }
        }
    }
}

fn reply(frame: Value) -> Outbound {
    Outbound::Reply { frame, http: None }
}

/// Runs the handler under the child scheduler, wrapped in gate
/// acquire/release when gated. A queued acquire is raced against the child
/// scheduler and withdrawn from the queue on abort.
async fn run_handler(
    child: &Scheduler,
    handler: Arc<dyn Handler>,
    context: HandlerContext,
    gate: Option<&Gate>,
) -> Result<HandlerReply, CoreError> {
    let Some(gate) = gate else {
        return child.execute(handler.handle(context)).await?;
    };

    let pending = gate.acquire()?;
    let handle = pending.handle();
    let mut token = match child.race(pending.token()).await {
        Ok(token) => token?,
        Err(error) => {
            if let (Some(handle), Some(reason)) = (handle, error.abort_reason()) {
                gate.cancel(&handle, Some(reason.clone()));
            }
            return Err(error);
        }
    };

    let result = token.work(child.execute(handler.handle(context))).await;
    gate.release(token);
    result??
}
