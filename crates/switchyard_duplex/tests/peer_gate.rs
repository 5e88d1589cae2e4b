use std::{sync::Arc, time::Duration};

use serde_json::{json, Value};
use switchyard::{handler_fn, GateConfig, HandlerEntry, HandlerReply, Registry};
use switchyard_duplex::{memory_socket, DuplexServer, DuplexServerConfig};
use tokio::{sync::mpsc, time::timeout};

const TICK: Duration = Duration::from_secs(1);

#[tokio::test]
async fn saturated_gate_rejects_requests_and_drops_notifies() {
    let registry = Arc::new(Registry::new());
    registry.register_entry(
        "slow",
        HandlerEntry::new(handler_fn(|ctx| async move {
            ctx.scheduler
                .race(tokio::time::sleep(Duration::from_millis(200)))
                .await?;
            Ok(HandlerReply::result(json!("done")))
        }))
        .limited(true),
    );

    let config = DuplexServerConfig {
        gate: Some(GateConfig {
            max_tokens: 1,
            max_queued: 0,
        }),
    };
    let server = DuplexServer::new(config, registry);

    let (socket, mut outbound, _closer) = memory_socket("s1");
    let (frames_tx, frames_rx) = mpsc::unbounded_channel::<Value>();
    server.adopt("s1".to_string(), socket, frames_rx);

    frames_tx
        .send(json!({"jsonrpc":"2.0","id":"1","method":"slow","params":null}))
        .unwrap();
    // Give the first request time to claim the only token.
    tokio::time::sleep(Duration::from_millis(50)).await;
    frames_tx
        .send(json!({"jsonrpc":"2.0","id":"2","method":"slow","params":null}))
        .unwrap();
    frames_tx
        .send(json!({"jsonrpc":"2.0","method":"slow","params":null}))
        .unwrap();

    // The saturated request is answered immediately with the server-busy
    // code, before the first request completes.
    let busy = timeout(TICK, outbound.recv())
        .await
        .expect("busy reply should arrive")
        .expect("socket should stay open");
    assert_eq!(busy["id"], json!("2"));
    assert_eq!(busy["error"]["code"], json!(-32000));

    let done = timeout(TICK, outbound.recv())
        .await
        .expect("slow reply should arrive")
        .expect("socket should stay open");
    assert_eq!(done["id"], json!("1"));
    assert_eq!(done["result"], json!("done"));

    // The saturated notify was dropped silently.
    assert!(outbound.try_recv().is_err());
}

#[tokio::test]
async fn unlimited_handlers_ignore_the_gate_on_duplex() {
    let registry = Arc::new(Registry::new());
    registry.register(
        "echo",
        handler_fn(|ctx| async move { Ok(HandlerReply::result(ctx.params)) }),
    );

    let config = DuplexServerConfig {
        gate: Some(GateConfig {
            max_tokens: 1,
            max_queued: 0,
        }),
    };
    let server = DuplexServer::new(config, registry);

    let (socket, mut outbound, _closer) = memory_socket("s1");
    let (frames_tx, frames_rx) = mpsc::unbounded_channel::<Value>();
    server.adopt("s1".to_string(), socket, frames_rx);

    for n in 0..3 {
        frames_tx
            .send(json!({"jsonrpc":"2.0","id":n.to_string(),"method":"echo","params":n}))
            .unwrap();
    }
    for _ in 0..3 {
        let reply = timeout(TICK, outbound.recv())
            .await
            .expect("echo reply should arrive")
            .expect("socket should stay open");
        assert!(reply.get("result").is_some());
    }
}

#[tokio::test]
async fn notify_envelope_reaches_the_sender_as_a_notify() {
    let registry = Arc::new(Registry::new());
    registry.register(
        "echoNotify",
        handler_fn(|ctx| async move {
            Ok(HandlerReply::notify("echoNotifyResponse", ctx.params))
        }),
    );
    let server = DuplexServer::new(DuplexServerConfig::default(), registry);

    let (socket, mut outbound, _closer) = memory_socket("s1");
    let (frames_tx, frames_rx) = mpsc::unbounded_channel::<Value>();
    server.adopt("s1".to_string(), socket, frames_rx);

    frames_tx
        .send(json!({"jsonrpc":"2.0","id":"9","method":"echoNotify","params":"wuhu"}))
        .unwrap();

    let notify = timeout(TICK, outbound.recv())
        .await
        .expect("notify should arrive")
        .expect("socket should stay open");
    assert_eq!(
        notify,
        json!({"jsonrpc":"2.0","method":"echoNotifyResponse","params":"wuhu"})
    );
    // No reply frame follows for id "9".
    assert!(outbound.try_recv().is_err());
}
