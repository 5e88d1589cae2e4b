use std::{sync::Arc, time::Duration};

use serde_json::{json, Value};
use switchyard::{
    dispatch, handler_fn, jsonrpc, ChildSlot, Correlator, CoreError, DispatchContext, ErrorObject,
    Frame, Gate, HandlerReply, Outbound, Reason, Registry, Scheduler, DISCONNECTED,
};

fn echo_registry() -> Registry {
    let registry = Registry::new();
    registry.register(
        "echo",
        handler_fn(|ctx| async move { Ok(HandlerReply::result(ctx.params)) }),
    );
    registry
}

async fn run(frame: Frame, registry: &Registry, scheduler: &Scheduler) -> Option<Outbound> {
    dispatch(
        frame,
        DispatchContext {
            registry,
            scheduler,
            gate: None,
            correlator: None,
            sender: None,
            limited_by_default: false,
            child_slot: None,
        },
    )
    .await
}

fn reply_frame(outbound: Option<Outbound>) -> Value {
    match outbound {
        Some(Outbound::Reply { frame, .. }) => frame,
        other => panic!("expected a reply, got {other:?}"),
    }
}

#[tokio::test]
async fn request_round_trips_through_a_handler() {
    let registry = echo_registry();
    let scheduler = Scheduler::new();

    let frame =
        jsonrpc::parse_str(r#"{"jsonrpc":"2.0","id":"1","method":"echo","params":"wuhu"}"#)
            .unwrap();
    let reply = reply_frame(run(frame, &registry, &scheduler).await);
    assert_eq!(
        reply,
        json!({"jsonrpc":"2.0","id":"1","result":"wuhu"})
    );
}

#[tokio::test]
async fn handler_error_maps_to_internal_code() {
    let registry = Registry::new();
    registry.register(
        "echo",
        handler_fn(|_ctx| async move {
            Err::<HandlerReply, _>(CoreError::from(ErrorObject::internal("invalid params")))
        }),
    );
    let scheduler = Scheduler::new();

    let frame =
        jsonrpc::parse_str(r#"{"jsonrpc":"2.0","id":"2","method":"echo","params":1}"#).unwrap();
    let reply = reply_frame(run(frame, &registry, &scheduler).await);
    assert_eq!(
        reply,
        json!({"jsonrpc":"2.0","id":"2","error":{"code":-32603,"message":"invalid params"}})
    );
}

#[tokio::test]
async fn unknown_method_replies_not_found_only_with_id() {
    let registry = Registry::new();
    let scheduler = Scheduler::new();

    let request =
        jsonrpc::parse_str(r#"{"jsonrpc":"2.0","id":"3","method":"nope","params":null}"#).unwrap();
    let reply = reply_frame(run(request, &registry, &scheduler).await);
    assert_eq!(reply["error"]["code"], json!(-32601));

    let notify =
        jsonrpc::parse_str(r#"{"jsonrpc":"2.0","method":"nope","params":null}"#).unwrap();
    assert!(run(notify, &registry, &scheduler).await.is_none());
}

#[tokio::test]
async fn notify_handler_value_is_discarded() {
    let registry = echo_registry();
    let scheduler = Scheduler::new();

    let notify =
        jsonrpc::parse_str(r#"{"jsonrpc":"2.0","method":"echo","params":"wuhu"}"#).unwrap();
    assert!(run(notify, &registry, &scheduler).await.is_none());
}

#[tokio::test]
async fn notify_envelope_suppresses_the_reply() {
    let registry = Registry::new();
    registry.register(
        "echoNotify",
        handler_fn(|ctx| async move {
            Ok(HandlerReply::notify("echoNotifyResponse", ctx.params))
        }),
    );
    let scheduler = Scheduler::new();

    let frame = jsonrpc::parse_str(
        r#"{"jsonrpc":"2.0","id":"4","method":"echoNotify","params":"wuhu"}"#,
    )
    .unwrap();
    match run(frame, &registry, &scheduler).await {
        Some(Outbound::Notify { frame }) => {
            assert_eq!(
                frame,
                json!({"jsonrpc":"2.0","method":"echoNotifyResponse","params":"wuhu"})
            );
        }
        other => panic!("expected an out-of-band notify, got {other:?}"),
    }
}

#[tokio::test]
async fn responses_route_to_the_correlator() {
    let registry = Registry::new();
    let scheduler = Scheduler::new();
    let correlator = Correlator::new();

    let (request, response) = correlator.create_request("echo", json!("wuhu"), None);
    let inbound = Frame::Response {
        id: request["id"].clone(),
        result: Ok(json!("wuhu")),
    };
    let outbound = dispatch(
        inbound,
        DispatchContext {
            registry: &registry,
            scheduler: &scheduler,
            gate: None,
            correlator: Some(&correlator),
            sender: None,
            limited_by_default: false,
            child_slot: None,
        },
    )
    .await;
    assert!(outbound.is_none());
    assert_eq!(response.recv().await.unwrap(), json!("wuhu"));
}

#[tokio::test]
async fn saturated_gate_replies_server_busy_for_requests_only() {
    let registry = Registry::new();
    registry.register(
        "slow",
        handler_fn(|ctx| async move {
            ctx.scheduler
                .race(tokio::time::sleep(Duration::from_secs(60)))
                .await?;
            Ok(HandlerReply::result(json!(null)))
        }),
    );
    let scheduler = Scheduler::new();
    let gate = Gate::new(1, 0);

    // Hold the only token so the next acquire overflows the (empty) queue.
    let held = gate.acquire().unwrap().token().await.unwrap();

    let cx = |frame| {
        dispatch(
            frame,
            DispatchContext {
                registry: &registry,
                scheduler: &scheduler,
                gate: Some(&gate),
                correlator: None,
                sender: None,
                limited_by_default: true,
                child_slot: None,
            },
        )
    };

    let request =
        jsonrpc::parse_str(r#"{"jsonrpc":"2.0","id":"5","method":"slow","params":null}"#).unwrap();
    let reply = reply_frame(cx(request).await);
    assert_eq!(reply["error"]["code"], json!(-32000));

    let notify = jsonrpc::parse_str(r#"{"jsonrpc":"2.0","method":"slow","params":null}"#).unwrap();
    assert!(cx(notify).await.is_none());

    gate.release(held);
}

#[tokio::test]
async fn unlimited_handlers_bypass_the_gate() {
    let registry = Registry::new();
    registry.register(
        "free",
        handler_fn(|_ctx| async move { Ok(HandlerReply::result(json!("ok"))) }),
    );
    let scheduler = Scheduler::new();
    let gate = Gate::new(1, 0);
    let held = gate.acquire().unwrap().token().await.unwrap();

    let frame =
        jsonrpc::parse_str(r#"{"jsonrpc":"2.0","id":"6","method":"free","params":null}"#).unwrap();
    let reply = reply_frame(
        dispatch(
            frame,
            DispatchContext {
                registry: &registry,
                scheduler: &scheduler,
                gate: Some(&gate),
                correlator: None,
                sender: None,
                limited_by_default: false,
                child_slot: None,
            },
        )
        .await,
    );
    assert_eq!(reply["result"], json!("ok"));
    gate.release(held);
}

#[tokio::test]
async fn disconnected_abort_is_swallowed() {
    let registry = Registry::new();
    registry.register(
        "hang",
        handler_fn(|ctx| async move {
            let raced = ctx
                .scheduler
                .race(tokio::time::sleep(Duration::from_secs(60)))
                .await;
            assert!(raced.is_err());
            raced?;
            Ok(HandlerReply::result(json!("unreachable")))
        }),
    );
    let scheduler = Scheduler::new();
    let slot = ChildSlot::new();

    let frame =
        jsonrpc::parse_str(r#"{"jsonrpc":"2.0","id":"7","method":"hang","params":null}"#).unwrap();
    let pending = {
        let registry = Arc::new(registry);
        let scheduler = scheduler.clone();
        let slot = slot.clone();
        tokio::spawn(async move {
            dispatch(
                frame,
                DispatchContext {
                    registry: &registry,
                    scheduler: &scheduler,
                    gate: None,
                    correlator: None,
                    sender: None,
                    limited_by_default: false,
                    child_slot: Some(&slot),
                },
            )
            .await
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    slot.abort(Reason::new(DISCONNECTED));

    let outbound = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("dispatch should unwind promptly after the abort")
        .unwrap();
    assert!(outbound.is_none());
    scheduler.wait_drain().await;
}

#[tokio::test]
async fn handler_abort_reason_reaches_the_error_reply() {
    let registry = Registry::new();
    registry.register(
        "hang",
        handler_fn(|ctx| async move {
            ctx.scheduler
                .race(tokio::time::sleep(Duration::from_secs(60)))
                .await?;
            Ok(HandlerReply::None)
        }),
    );
    let scheduler = Scheduler::new();

    let frame =
        jsonrpc::parse_str(r#"{"jsonrpc":"2.0","id":"8","method":"hang","params":null}"#).unwrap();
    let pending = {
        let registry = Arc::new(registry);
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            dispatch(
                frame,
                DispatchContext {
                    registry: &registry,
                    scheduler: &scheduler,
                    gate: None,
                    correlator: None,
                    sender: None,
                    limited_by_default: false,
                    child_slot: None,
                },
            )
            .await
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    scheduler.abort(Reason::new("shutdown"));

    let reply = reply_frame(pending.await.unwrap());
    assert_eq!(
        reply["error"],
        json!({"code":-32603,"message":"shutdown"})
    );
    scheduler.resume();
}
