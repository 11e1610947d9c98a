//! Responders shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_messaging::{
    Broker, DEFAULT_EXCHANGE, DeliveryError, Envelope, MessageProperties,
};
use courier_messaging_memory::MemoryBroker;
use courier_rpc::{Delivery, RemoteError, RespondHandler};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub id: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub id: u32,
    pub text: String,
}

/// Echoes after a fixed delay.
pub struct DelayedEcho {
    pub delay: Duration,
}

#[async_trait]
impl RespondHandler for DelayedEcho {
    type Request = Ping;
    type Response = Pong;
    type Error = RemoteError;

    async fn respond(&self, request: Delivery<Ping>) -> Result<Pong, RemoteError> {
        tokio::time::sleep(self.delay).await;
        let Ping { id, text } = request.into_body();
        Ok(Pong { id, text })
    }
}

/// Fails, or panics, depending on the request text.
pub struct Faulty;

#[async_trait]
impl RespondHandler for Faulty {
    type Request = Ping;
    type Response = Pong;
    type Error = RemoteError;

    async fn respond(&self, request: Delivery<Ping>) -> Result<Pong, RemoteError> {
        match request.body().text.as_str() {
            "panic" => panic!("responder exploded"),
            "fail" => Err(RemoteError::new("OrderRejected", "credit limit exceeded")
                .with_details(serde_json::json!({ "limit": 100 }))),
            _ => Ok(Pong {
                id: request.body().id,
                text: "ok".to_string(),
            }),
        }
    }
}

/// Binds `routing_key` on the `rpc` exchange to a destination whose
/// deliveries are forwarded, undecoded, to the returned receiver.
pub async fn capture(broker: &MemoryBroker, routing_key: &str) -> mpsc::UnboundedReceiver<Envelope> {
    let destination = broker.declare_destination(routing_key).await.unwrap();
    broker
        .bind_destination(&destination, "rpc", routing_key)
        .await
        .unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |envelope: Envelope| -> Result<(), DeliveryError> {
        tx.send(envelope)
            .map_err(|_| DeliveryError::Rejected("test receiver gone".to_string()))
    };
    broker
        .subscribe_no_ack(&destination, Arc::new(handler))
        .await
        .unwrap();

    rx
}

/// Publishes `payload` as the reply to `request`.
pub async fn reply_to(broker: &MemoryBroker, request: &Envelope, payload: bytes::Bytes) {
    let properties = MessageProperties {
        correlation_id: request.properties().correlation_id.clone(),
        content_type: request.properties().content_type.clone(),
        ..MessageProperties::default()
    };
    let reply_to = request.properties().reply_to.clone().unwrap();

    broker
        .publish(DEFAULT_EXCHANGE, &reply_to, properties, payload)
        .await
        .unwrap();
}
