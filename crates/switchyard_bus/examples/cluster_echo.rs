//! Three nodes on one in-process bus: a broadcast fans out, each server
//! answers with an out-of-band notify.
//!
//! ```bash
//! cargo run --example cluster_echo
//! ```

use std::sync::Arc;

use serde_json::json;
use switchyard::{handler_fn, HandlerReply, Registry};
use switchyard_bus::{BusNode, ClusterBus, InMemoryBus};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let bus: Arc<dyn ClusterBus> = Arc::new(InMemoryBus::default());

    let emitter_registry = Arc::new(Registry::new());
    emitter_registry.register(
        "echoNotifyResponse",
        handler_fn(|ctx| async move {
            tracing::info!(
                "{} answered with {}",
                ctx.sender.as_deref().unwrap_or("?"),
                ctx.params
            );
            Ok(HandlerReply::None)
        }),
    );
    let emitter = BusNode::new("emitter", bus.clone(), emitter_registry, None)?;

    let mut servers = Vec::new();
    for name in ["server1", "server2"] {
        let registry = Arc::new(Registry::new());
        registry.register(
            "echoNotify",
            handler_fn(|ctx| async move {
                Ok(HandlerReply::notify("echoNotifyResponse", ctx.params))
            }),
        );
        servers.push(BusNode::new(name, bus.clone(), registry, None)?);
    }

    emitter.broadcast("echoNotify", json!("wuhu"))?;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}
