//! Entry point for the cdbsh MCP server.
//!
//! Initializes tracing (to stderr, so it doesn't interfere with MCP stdio
//! transport), loads configuration, wires the engine with production
//! capabilities, and serves on stdin/stdout. Engine notifications are
//! forwarded to stdout as JSON-RPC frames alongside the MCP transport.

use anyhow::Result;
use cdbsh::config::EngineConfig;
use cdbsh::engine::DebugEngine;
use cdbsh::notify::ChannelBridge;
use cdbsh::server::CdbshServer;
use cdbsh::sys::Capabilities;
use rmcp::{ServiceExt, transport::stdio};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{self, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing to stderr (stdout is used for MCP JSON-RPC).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting cdbsh MCP server v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::from_env()?;
    let (bridge, mut notifications) = ChannelBridge::new();
    let engine = DebugEngine::new(config, Capabilities::system(), Arc::new(bridge));

    // Forward engine notifications to the client as JSON-RPC lines. An
    // HTTP/SSE transport would drain this same channel instead.
    tokio::spawn(async move {
        let mut out = tokio::io::stdout();
        while let Some(frame) = notifications.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if out.write_all(json.as_bytes()).await.is_err()
                        || out.write_all(b"\n").await.is_err()
                        || out.flush().await.is_err()
                    {
                        return;
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to serialize notification"),
            }
        }
    });

    let server = CdbshServer::new(engine.clone());
    let service = server.serve(stdio()).await.inspect_err(|e| {
        tracing::error!("serving error: {:?}", e);
    })?;

    service.waiting().await?;
    engine.shutdown().await;
    tracing::info!("cdbsh server shut down");
    Ok(())
}
