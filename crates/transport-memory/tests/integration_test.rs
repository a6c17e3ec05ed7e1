//! Integration tests for memory transport

use bytes::Bytes;
use conductor_transport::{Config, MemberId, Transport, TransportError};
use conductor_transport_memory::MemoryNetwork;
use futures::StreamExt;
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test]
async fn test_envelopes_reach_recipient() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let a = network.join("a");
    let b = network.join("b");

    let mut incoming = b.incoming();
    for i in 0..3 {
        a.send_envelope(&MemberId::new("b"), &Bytes::from(format!("m{i}")), "ping")
            .await
            .unwrap();
    }

    for i in 0..3 {
        let envelope = timeout(Duration::from_secs(1), incoming.next())
            .await
            .expect("timed out")
            .expect("stream ended");
        assert_eq!(envelope.sender, MemberId::new("a"));
        assert_eq!(envelope.message_type, "ping");
        assert_eq!(envelope.payload, Bytes::from(format!("m{i}")));
    }
}

#[tokio::test]
async fn test_partition_drops_both_directions_until_healed() {
    let network = MemoryNetwork::new();
    let a = network.join("a");
    let b = network.join("b");
    let (id_a, id_b) = (MemberId::new("a"), MemberId::new("b"));

    network.partition(&id_a, &id_b);
    a.send_envelope(&id_b, &Bytes::from("lost"), "x").await.unwrap();
    b.send_envelope(&id_a, &Bytes::from("lost"), "x").await.unwrap();

    let mut from_a = b.incoming();
    let mut from_b = a.incoming();
    assert!(
        timeout(Duration::from_millis(50), from_a.next())
            .await
            .is_err()
    );
    assert!(
        timeout(Duration::from_millis(50), from_b.next())
            .await
            .is_err()
    );

    network.heal();
    a.send_envelope(&id_b, &Bytes::from("found"), "x").await.unwrap();
    let envelope = timeout(Duration::from_secs(1), from_a.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.payload, Bytes::from("found"));
}

#[tokio::test]
async fn test_isolated_member_neither_sends_nor_receives() {
    let network = MemoryNetwork::new();
    let a = network.join("a");
    let b = network.join("b");
    let c = network.join("c");

    network.isolate(&MemberId::new("a"));
    a.send_envelope(&MemberId::new("b"), &Bytes::from("1"), "x")
        .await
        .unwrap();
    c.send_envelope(&MemberId::new("a"), &Bytes::from("2"), "x")
        .await
        .unwrap();
    c.send_envelope(&MemberId::new("b"), &Bytes::from("3"), "x")
        .await
        .unwrap();

    let envelope = timeout(Duration::from_secs(1), b.incoming().next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.sender, MemberId::new("c"));
    assert!(
        timeout(Duration::from_millis(50), a.incoming().next())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_duplicates_are_delivered_twice() {
    let network = MemoryNetwork::new();
    let a = network.join("a");
    let b = network.join("b");
    network.set_duplicate(true);

    a.send_envelope(&MemberId::new("b"), &Bytes::from("dup"), "x")
        .await
        .unwrap();

    let mut incoming = b.incoming();
    for _ in 0..2 {
        let envelope = timeout(Duration::from_secs(1), incoming.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.payload, Bytes::from("dup"));
    }
}

#[tokio::test]
async fn test_send_errors() {
    let network = MemoryNetwork::new();
    let a = network.join_with_config(
        "a",
        Config {
            max_message_size: 4,
            ..Config::default()
        },
    );
    let b = network.join("b");

    assert!(matches!(
        a.send_envelope(&MemberId::new("nobody"), &Bytes::from("x"), "x")
            .await,
        Err(TransportError::Unreachable(_))
    ));
    assert!(matches!(
        a.send_envelope(&MemberId::new("b"), &Bytes::from("too long"), "x")
            .await,
        Err(TransportError::MessageTooLarge { size: 8, limit: 4 })
    ));

    b.shutdown().await.unwrap();
    assert!(matches!(
        a.send_envelope(&MemberId::new("b"), &Bytes::from("x"), "x")
            .await,
        Err(TransportError::Unreachable(_))
    ));
    assert!(matches!(
        b.send_envelope(&MemberId::new("a"), &Bytes::from("x"), "x")
            .await,
        Err(TransportError::Shutdown)
    ));
}
