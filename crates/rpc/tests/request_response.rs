//! Integration tests for calls against the in-memory broker
//!
//! Tests include:
//! - Replies within the deadline
//! - Timeouts and late replies
//! - Reply destination reuse per routing key
//! - Many concurrent calls answered out of order
//! - Publish failures

mod common;
use common::{DelayedEcho, Ping, Pong, capture, reply_to};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_messaging_memory::{MemoryBroker, MemoryBrokerOptions};
use courier_rpc::{ConsumerOptions, Error, RpcClient, RpcServer, SendOptions};

fn ping(id: u32, text: &str) -> Ping {
    Ping {
        id,
        text: text.to_string(),
    }
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_reply_before_deadline() {
    let broker = Arc::new(MemoryBroker::default());
    let server = RpcServer::new(Arc::clone(&broker));
    server
        .respond(
            DelayedEcho {
                delay: Duration::from_millis(100),
            },
            ConsumerOptions::for_routing_key("echo"),
        )
        .await
        .unwrap();

    let client = RpcClient::new(Arc::clone(&broker));
    let started = Instant::now();
    let pong: Pong = client
        .request_with_options(
            "echo",
            &ping(1, "hello"),
            SendOptions::with_timeout(Duration::from_millis(500)),
        )
        .await
        .unwrap();

    assert_eq!(
        pong,
        Pong {
            id: 1,
            text: "hello".to_string()
        }
    );
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(client.pending_count(), 0);

    server.shutdown().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_timeout_without_reply() {
    let broker = Arc::new(MemoryBroker::default());
    let mut requests = capture(&broker, "silent").await;

    let client = RpcClient::new(Arc::clone(&broker));
    let started = Instant::now();
    let result: Result<Pong, _> = client
        .request_with_options(
            "silent",
            &ping(1, "anyone?"),
            SendOptions::with_timeout(Duration::from_millis(200)),
        )
        .await;
    let elapsed = started.elapsed();

    match result {
        Err(Error::Timeout {
            routing_key,
            timeout,
            ..
        }) => {
            assert_eq!(routing_key, "silent");
            assert_eq!(timeout, Duration::from_millis(200));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(client.pending_count(), 0);

    // A reply arriving after the deadline is dropped without effect.
    let request = requests.recv().await.unwrap();
    reply_to(&broker, &request, bytes::Bytes::from_static(b"{}")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(client.pending_count(), 0);
    assert!(logs_contain("orphaned reply discarded"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_key_shares_reply_destination() {
    let broker = Arc::new(MemoryBroker::default());
    let server = RpcServer::new(Arc::clone(&broker));
    server
        .respond(
            DelayedEcho {
                delay: Duration::from_millis(20),
            },
            ConsumerOptions::for_routing_key("echo"),
        )
        .await
        .unwrap();

    let client = Arc::new(RpcClient::new(Arc::clone(&broker)));
    let calls: Vec<_> = (0..2)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.request::<_, Pong>("echo", &ping(i, "x")).await })
        })
        .collect();
    for call in calls {
        call.await.unwrap().unwrap();
    }

    assert_eq!(client.reply_destination_count(), 1);
    assert_eq!(broker.temporary_destinations_declared(), 1);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_get_distinct_destinations() {
    let broker = Arc::new(MemoryBroker::default());
    let server = RpcServer::new(Arc::clone(&broker));
    for key in ["a", "b", "c", "d"] {
        server
            .respond(
                DelayedEcho {
                    delay: Duration::ZERO,
                },
                ConsumerOptions::for_routing_key(key),
            )
            .await
            .unwrap();
    }

    let client = Arc::new(RpcClient::new(Arc::clone(&broker)));
    let calls: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|key| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.request::<_, Pong>(key, &ping(0, key)).await })
        })
        .collect();
    for call in calls {
        call.await.unwrap().unwrap();
    }

    let destinations: HashSet<_> = ["a", "b", "c", "d"]
        .into_iter()
        .filter_map(|key| client.reply_destination(key))
        .collect();
    assert_eq!(destinations.len(), 4);
    assert_eq!(broker.temporary_destinations_declared(), 4);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_answered_in_reverse_order() {
    const KEYS: [&str; 5] = ["k0", "k1", "k2", "k3", "k4"];
    const CALLS: u32 = 100;

    let broker = Arc::new(MemoryBroker::new(MemoryBrokerOptions {
        concurrent_publish: true,
    }));

    // Every key feeds the same collector so replies can be reordered globally.
    let (all_tx, mut all_rx) = tokio::sync::mpsc::unbounded_channel();
    for key in KEYS {
        let mut requests = capture(&broker, key).await;
        let all_tx = all_tx.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                if all_tx.send(request).is_err() {
                    break;
                }
            }
        });
    }

    let client = Arc::new(RpcClient::new(Arc::clone(&broker)));
    let calls: Vec<_> = (0..CALLS)
        .map(|id| {
            let client = Arc::clone(&client);
            let key = KEYS[id as usize % KEYS.len()];
            tokio::spawn(async move {
                let pong: Pong = client
                    .request_with_options(
                        key,
                        &ping(id, key),
                        SendOptions::with_timeout(Duration::from_secs(10)),
                    )
                    .await
                    .unwrap();
                assert_eq!(pong.id, id);
                assert_eq!(pong.text, key);
            })
        })
        .collect();

    let mut requests = Vec::new();
    while requests.len() < CALLS as usize {
        requests.push(all_rx.recv().await.unwrap());
    }

    let correlation_ids: HashSet<_> = requests
        .iter()
        .map(|r| r.correlation_id().unwrap().to_string())
        .collect();
    assert_eq!(correlation_ids.len(), CALLS as usize);

    for request in requests.iter().rev() {
        reply_to(&broker, request, request.payload().clone()).await;
    }

    for call in calls {
        call.await.unwrap();
    }
    assert_eq!(client.pending_count(), 0);
    assert_eq!(client.reply_destination_count(), KEYS.len());
}

#[tokio::test]
async fn test_publish_failure_is_transport_error() {
    let broker = Arc::new(MemoryBroker::default());
    let _requests = capture(&broker, "orders").await;
    broker.set_publish_fault(Some("channel closed"));

    let client = RpcClient::new(Arc::clone(&broker));
    let started = Instant::now();
    let result: Result<Pong, _> = client
        .request_with_options(
            "orders",
            &ping(1, "buy"),
            SendOptions::with_timeout(Duration::from_secs(5)),
        )
        .await;

    assert!(matches!(result, Err(Error::Transport(ref reason)) if reason.contains("channel closed")));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(client.pending_count(), 0);

    broker.set_publish_fault(None::<String>);
}

#[tokio::test]
async fn test_dropped_call_releases_registration() {
    let broker = Arc::new(MemoryBroker::default());
    let _requests = capture(&broker, "slow").await;
    let client = Arc::new(RpcClient::new(Arc::clone(&broker)));

    let call = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.request::<_, Pong>("slow", &ping(1, "x")).await })
    };

    while client.pending_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    call.abort();
    assert!(call.await.unwrap_err().is_cancelled());

    assert_eq!(client.pending_count(), 0);
}
