//! Standalone entry point for the bluebell-kv test store.

use std::env;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use bbkv_server::{serve, ServerConfig};

const DEFAULT_ADDR: &str = "127.0.0.1:6379";

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();

    let args: Vec<String> = env::args().collect();
    let flag = |name: &str| {
        args.iter()
            .position(|arg| arg == name)
            .and_then(|idx| args.get(idx + 1))
            .cloned()
    };

    let addr = flag("--addr")
        .or_else(|| env::var("BBKV_ADDR").ok())
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let config = ServerConfig {
        password: flag("--requirepass").or_else(|| env::var("BBKV_PASSWORD").ok()),
    };

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    serve(listener, config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
    .context("server loop failed")
}
