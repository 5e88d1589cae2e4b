//! In-process duplex server + reconnecting client round trip.
//!
//! ```bash
//! cargo run --example echo_pair
//! ```

use std::sync::Arc;

use serde_json::json;
use switchyard::{handler_fn, HandlerReply, Registry};
use switchyard_duplex::{DuplexClient, DuplexClientConfig, DuplexServer, DuplexServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let registry = Arc::new(Registry::new());
    registry.register(
        "echo",
        handler_fn(|ctx| async move { Ok(HandlerReply::result(ctx.params)) }),
    );

    let server = DuplexServer::new(DuplexServerConfig::default(), registry);
    let addr = server.bind("127.0.0.1:0".parse()?).await?;
    tracing::info!("duplex server on {addr}");

    let client = DuplexClient::connect(
        DuplexClientConfig::new(addr.to_string()),
        Arc::new(Registry::new()),
    );
    client.wait_connected().await;

    let reply = client
        .request("echo", json!("wuhu"), Some(std::time::Duration::from_secs(5)))
        .await?;
    tracing::info!("echo replied: {reply}");

    client.close();
    server.abort(switchyard::Reason::new("example finished"));
    Ok(())
}
