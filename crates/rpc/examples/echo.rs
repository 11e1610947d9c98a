//! Echo responder and client over the in-memory broker.
//!
//! Run with `RUST_LOG=courier_rpc=debug` to follow each call.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use courier_messaging_memory::MemoryBroker;
use courier_rpc::{
    Delivery, RemoteError, RespondHandler, RpcClient, RpcServer, SendOptions,
};
use serde::{Deserialize, Serialize};
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

/// Echo request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EchoRequest {
    message: String,
}

/// Echo response message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EchoResponse {
    message: String,
    timestamp: u64,
}

/// Echo service handler.
struct EchoHandler;

#[async_trait]
impl RespondHandler for EchoHandler {
    type Request = EchoRequest;
    type Response = EchoResponse;
    type Error = RemoteError;

    async fn respond(&self, request: Delivery<EchoRequest>) -> Result<EchoResponse, RemoteError> {
        info!("Received echo request: {}", request.body().message);

        if request.body().message.is_empty() {
            return Err(RemoteError::new("EmptyMessage", "nothing to echo"));
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| RemoteError::from_error(&e))?
            .as_secs();

        Ok(EchoResponse {
            message: request.into_body().message,
            timestamp,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let broker = Arc::new(MemoryBroker::default());

    let server = RpcServer::new(Arc::clone(&broker));
    server.respond_on(EchoHandler, "echo.request").await?;

    let client = RpcClient::builder(Arc::clone(&broker))
        .default_timeout(Duration::from_secs(5))
        .build();

    let response: EchoResponse = client
        .request(
            "echo.request",
            &EchoRequest {
                message: "Hello, broker!".to_string(),
            },
        )
        .await?;
    info!(
        "Echo response: {} (at {})",
        response.message, response.timestamp
    );

    let failed = client
        .request_with_options::<_, EchoResponse>(
            "echo.request",
            &EchoRequest {
                message: String::new(),
            },
            SendOptions::with_timeout(Duration::from_secs(1)),
        )
        .await;
    if let Err(e) = failed {
        info!("Empty request rejected: {e}");
    }

    client.shutdown().await;
    server.shutdown().await;

    Ok(())
}
