use std::{sync::Arc, time::Duration};

use serde_json::Value;
use switchyard_duplex::{memory_socket, DuplexServer, DuplexServerConfig, Peer, REPEAT_SOCKET_ID};
use tokio::{sync::mpsc, time::timeout};

use switchyard::Registry;

const TICK: Duration = Duration::from_secs(1);

fn server() -> DuplexServer {
    DuplexServer::new(DuplexServerConfig::default(), Arc::new(Registry::new()))
}

#[tokio::test]
async fn repeated_socket_id_replaces_the_live_peer() {
    let server = server();

    let (first_socket, _outbound1, first_closed) = memory_socket("s1");
    let (frames_tx1, frames_rx1) = mpsc::unbounded_channel::<Value>();
    let first = server.adopt("s1".to_string(), first_socket, frames_rx1);

    let (second_socket, _outbound2, _closer2) = memory_socket("s1");
    let (_frames_tx2, frames_rx2) = mpsc::unbounded_channel::<Value>();
    let second = server.adopt("s1".to_string(), second_socket, frames_rx2);

    // The old peer was aborted with the repeat reason and told to close.
    assert_eq!(
        first.scheduler().reason().expect("first peer must be aborted"),
        REPEAT_SOCKET_ID
    );
    timeout(TICK, first_closed)
        .await
        .expect("close should be commanded")
        .expect("close signal should fire");

    // The index now points at the replacement.
    let indexed = server.peer("s1").expect("id should stay mapped");
    assert!(Peer::ptr_eq(&indexed, &second));

    // The old peer's late disconnect must not evict the replacement.
    drop(frames_tx1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let indexed = server.peer("s1").expect("replacement should survive");
    assert!(Peer::ptr_eq(&indexed, &second));
    assert_eq!(server.peer_count(), 1);
}

#[tokio::test]
async fn disconnect_removes_the_index_entry() {
    let server = server();

    let (socket, _outbound, _closer) = memory_socket("s1");
    let (frames_tx, frames_rx) = mpsc::unbounded_channel::<Value>();
    let peer = server.adopt("s1".to_string(), socket, frames_rx);
    assert_eq!(server.peer_count(), 1);

    let mut events = peer.subscribe();
    drop(frames_tx);

    timeout(TICK, events.recv())
        .await
        .expect("disconnect should be observed")
        .expect("event stream should stay open");
    timeout(TICK, async {
        while server.peer_count() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("index entry should be removed");

    assert!(peer.scheduler().aborted());
    assert_eq!(peer.scheduler().reason().unwrap(), "disconnect");
}
