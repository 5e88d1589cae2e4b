//! Minimal JSON-RPC echo server with signal-driven shutdown.
//!
//! ```bash
//! cargo run --example echo_server
//! curl -s -X POST 127.0.0.1:8080 \
//!   -d '{"jsonrpc":"2.0","id":"1","method":"echo","params":"wuhu"}'
//! ```

use std::sync::Arc;

use switchyard::{handler_fn, HandlerReply, Registry};
use switchyard_http::{GatewayConfig, HttpGateway};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config: GatewayConfig = match std::env::args().nth(1) {
        Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
        None => GatewayConfig::default(),
    };

    let registry = Arc::new(Registry::new());
    registry.register(
        "echo",
        handler_fn(|ctx| async move { Ok(HandlerReply::result(ctx.params)) }),
    );

    let gateway = HttpGateway::new(config, registry);
    let addr = gateway.serve("127.0.0.1:8080".parse()?).await?;
    tracing::info!("listening on {addr}");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down: draining in-flight requests");
    gateway.shutdown().await;
    Ok(())
}
