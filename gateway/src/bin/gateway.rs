// Serves a single connection over newline-delimited JSON on stdin/stdout.
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_stream::wrappers::{LinesStream, ReceiverStream};
use tokio_stream::StreamExt;
use tracing::{info, warn};

use irl_core::telemetry::init_tracing;
use irl_core::{InMemoryKvStore, IrlConfig, StubDecisionEngine};
use irl_gateway::{serve_connection, GatewayServices, SubscriptionGateway};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = IrlConfig::from_env();
    let store = match &config.seed_file {
        Some(path) => {
            info!(path = %path, "Seeding in-memory store");
            InMemoryKvStore::from_seed_file(path)?
        }
        None => InMemoryKvStore::new(),
    };

    let services = GatewayServices::new(store, Arc::new(StubDecisionEngine), &config);
    let gateway = Arc::new(SubscriptionGateway::new(services));

    {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                gateway.shutdown().await;
            }
        });
    }

    let (connection, outbound) = gateway.connect();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut frames = ReceiverStream::new(outbound);
        while let Some(frame) = frames.next().await {
            let line = match serde_json::to_string(&frame) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Dropping unserialisable frame");
                    continue;
                }
            };
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines())
        .map_while(Result::ok)
        .filter(|line| !line.trim().is_empty());
    serve_connection(connection, lines).await;

    writer.await??;
    info!("stdin closed, exiting");
    Ok(())
}
