//! Integration tests for responders
//!
//! Tests include:
//! - Remote errors reaching the caller
//! - Panicking handlers
//! - Undecodable requests
//! - Prefixed destinations

mod common;
use common::{DelayedEcho, Faulty, Ping, Pong};

use std::sync::Arc;
use std::time::Duration;

use courier_messaging_memory::MemoryBroker;
use courier_rpc::{Codec, ConsumerOptions, Error, RpcClient, RpcConfig, RpcServer};

#[tracing_test::traced_test]
#[tokio::test]
async fn test_responder_error_reaches_caller() {
    let broker = Arc::new(MemoryBroker::default());
    let server = RpcServer::new(Arc::clone(&broker));
    server
        .respond(Faulty, ConsumerOptions::for_routing_key("orders"))
        .await
        .unwrap();

    let client = RpcClient::new(Arc::clone(&broker));
    let result: Result<Pong, _> = client
        .request(
            "orders",
            &Ping {
                id: 1,
                text: "fail".to_string(),
            },
        )
        .await;

    let Err(Error::Remote(remote)) = result else {
        panic!("expected remote error");
    };
    assert_eq!(remote.kind, "OrderRejected");
    assert_eq!(remote.message, "credit limit exceeded");
    assert_eq!(remote.details, Some(serde_json::json!({ "limit": 100 })));
    assert!(logs_contain("respond handler failed"));

    server.shutdown().await;
}

#[tracing_test::traced_test]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_responder_panic_is_contained() {
    let broker = Arc::new(MemoryBroker::default());
    let server = RpcServer::new(Arc::clone(&broker));
    server
        .respond(Faulty, ConsumerOptions::for_routing_key("orders"))
        .await
        .unwrap();

    let client = RpcClient::new(Arc::clone(&broker));
    let result: Result<Pong, _> = client
        .request(
            "orders",
            &Ping {
                id: 1,
                text: "panic".to_string(),
            },
        )
        .await;

    let remote = result.unwrap_err().remote().cloned().unwrap();
    assert_eq!(remote.kind, "Panic");
    assert!(remote.message.contains("responder exploded"));

    // Still serving.
    let pong: Pong = client
        .request(
            "orders",
            &Ping {
                id: 2,
                text: "fine".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(pong.id, 2);

    server.shutdown().await;
}

#[tokio::test]
async fn test_undecodable_request_is_remote_error() {
    let broker = Arc::new(MemoryBroker::default());
    let server = RpcServer::new(Arc::clone(&broker));
    server
        .respond(Faulty, ConsumerOptions::for_routing_key("orders"))
        .await
        .unwrap();

    let client = RpcClient::new(Arc::clone(&broker));
    let error = client
        .request::<_, Pong>("orders", &"not a ping")
        .await
        .unwrap_err();

    assert_eq!(
        error.remote().map(|r| r.kind.as_str()),
        Some("CodecError")
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_prefixed_destinations_and_cbor() {
    let broker = Arc::new(MemoryBroker::default());
    let config = RpcConfig::new()
        .scope("billing")
        .exchange_name_prefix("test.")
        .queue_name_prefix("billing.");

    let server = RpcServer::with_options(Arc::clone(&broker), config.clone(), Codec::Cbor);
    let subscription = server
        .respond_on(
            DelayedEcho {
                delay: Duration::ZERO,
            },
            "invoice",
        )
        .await
        .unwrap();
    assert_eq!(subscription.destination(), "billing.invoice");
    assert!(broker.destination_exists("billing.invoice"));

    let client = RpcClient::builder(Arc::clone(&broker))
        .config(config)
        .build();
    let pong: Pong = client
        .request(
            "invoice",
            &Ping {
                id: 9,
                text: "total".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(pong.text, "total");

    server.shutdown().await;
    assert_eq!(broker.consumer_count("billing.invoice"), 0);
}
