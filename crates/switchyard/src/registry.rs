//! Method registry and handler plumbing shared by every transport.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::CoreError;
use crate::scheduler::Scheduler;

/// What a handler hands back to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerReply {
    /// No reply at all (the "undefined" sentinel).
    None,
    /// A plain JSON-RPC result.
    Result(Value),
    /// Respond out-of-band: send this notify to the sender and suppress the
    /// reply for the request id.
    Notify { method: String, params: Value },
    /// HTTP decoration: apply status and headers, then serialize `result` as
    /// a normal JSON-RPC result.
    Http {
        status: u16,
        headers: Vec<(String, String)>,
        result: Value,
    },
}

impl HandlerReply {
    pub fn result(value: Value) -> Self {
        HandlerReply::Result(value)
    }

    pub fn notify(method: impl Into<String>, params: Value) -> Self {
        HandlerReply::Notify {
            method: method.into(),
            params,
        }
    }
}

/// What a handler sees: its params, the per-request child scheduler it should
/// await through, and the sender identity (absent on HTTP).
#[derive(Clone)]
pub struct HandlerContext {
    pub params: Value,
    pub scheduler: Scheduler,
    pub sender: Option<String>,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<HandlerReply, CoreError>> + Send>>;

/// A registered method implementation.
pub trait Handler: Send + Sync {
    fn handle(&self, ctx: HandlerContext) -> HandlerFuture;
}

struct FnHandler<F>(F);

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerReply, CoreError>> + Send + 'static,
{
    fn handle(&self, ctx: HandlerContext) -> HandlerFuture {
        Box::pin((self.0)(ctx))
    }
}

/// Adapts a plain async closure into a registrable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerReply, CoreError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A handler plus its dispatch overrides: an explicit parent scheduler to
/// root request children at, and whether executions go through the gate.
#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: Arc<dyn Handler>,
    pub parent: Option<Scheduler>,
    pub limited: Option<bool>,
}

impl HandlerEntry {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler,
            parent: None,
            limited: None,
        }
    }

    pub fn parent(mut self, parent: Scheduler) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn limited(mut self, limited: bool) -> Self {
        self.limited = Some(limited);
        self
    }
}

/// Method-name → handler table. Keys are unique; insertion order is
/// irrelevant. Effectively immutable at steady state: registration races
/// are the caller's responsibility.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<String, HandlerEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a bare handler: it inherits the transport's scheduler and
    /// the transport's default gate policy.
    pub fn register(&self, method: impl Into<String>, handler: Arc<dyn Handler>) {
        self.register_entry(method, HandlerEntry::new(handler));
    }

    pub fn register_entry(&self, method: impl Into<String>, entry: HandlerEntry) {
        self.entries.lock().insert(method.into(), entry);
    }

    /// Removes a method; `false` when it was not present.
    pub fn unregister(&self, method: &str) -> bool {
        self.entries.lock().remove(method).is_some()
    }

    pub fn get(&self, method: &str) -> Option<HandlerEntry> {
        self.entries.lock().get(method).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn register_then_unregister_restores_the_registry() {
        let registry = Registry::new();
        assert!(registry.is_empty());

        registry.register(
            "echo",
            handler_fn(|ctx| async move { Ok(HandlerReply::result(ctx.params)) }),
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.get("echo").is_some());

        assert!(registry.unregister("echo"));
        assert!(registry.is_empty());
        assert!(!registry.unregister("echo"));
    }

    #[tokio::test]
    async fn entries_carry_overrides() {
        let registry = Registry::new();
        let parent = Scheduler::new();
        registry.register_entry(
            "work",
            HandlerEntry::new(handler_fn(|_ctx| async move {
                Ok(HandlerReply::result(json!(null)))
            }))
            .parent(parent)
            .limited(true),
        );

        let entry = registry.get("work").unwrap();
        assert!(entry.parent.is_some());
        assert_eq!(entry.limited, Some(true));
    }
}
