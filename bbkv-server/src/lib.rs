//! # bluebell-kv Test Store
//!
//! A small in-memory RESP2 server speaking the subset of Redis the client
//! relies on: strings with TTL, counters, `SCAN`, and `MULTI`/`EXEC` with
//! `WATCH`.
//!
//! `spawn_background` runs a server on its own runtime thread so blocking
//! client tests can talk to a real store.

mod keyspace;
mod protocol;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub use keyspace::{Keyspace, KeyspaceError, TtlStatus};
pub use server::{handle_connection, ServerConfig, SharedKeyspace};

/// Accepts connections on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    config: ServerConfig,
    shutdown: F,
) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()>,
{
    let keyspace: SharedKeyspace = Arc::new(Mutex::new(Keyspace::new()));
    let config = Arc::new(config);
    info!(addr = %listener.local_addr()?, "bbkv-server listening");

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("bbkv-server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                if let Err(err) = stream.set_nodelay(true) {
                    warn!(%peer, error = %err, "failed to set TCP_NODELAY");
                }
                let keyspace = keyspace.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    debug!(%peer, "connection accepted");
                    if let Err(err) = handle_connection(stream, keyspace, config).await {
                        debug!(%peer, error = %err, "connection closed with error");
                    } else {
                        debug!(%peer, "connection closed");
                    }
                });
            }
        }
    }
}

/// Server running on a background thread. Dropping it stops the server.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Bound address, useful when spawned on port 0.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Binds `addr` and serves it from a dedicated runtime thread.
pub fn spawn_background(addr: &str) -> std::io::Result<ServerHandle> {
    spawn_background_with(addr, ServerConfig::default())
}

pub fn spawn_background_with(addr: &str, config: ServerConfig) -> std::io::Result<ServerHandle> {
    let std_listener = std::net::TcpListener::bind(addr)?;
    std_listener.set_nonblocking(true)?;
    let local = std_listener.local_addr()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    let (tx, rx) = oneshot::channel::<()>();

    let thread = std::thread::Builder::new()
        .name("bbkv-server".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let listener = match TcpListener::from_std(std_listener) {
                    Ok(listener) => listener,
                    Err(err) => {
                        warn!(error = %err, "failed to register listener");
                        return;
                    }
                };
                let shutdown = async {
                    let _ = rx.await;
                };
                if let Err(err) = serve(listener, config, shutdown).await {
                    warn!(error = %err, "server stopped");
                }
            });
        })?;

    Ok(ServerHandle {
        addr: local,
        shutdown: Some(tx),
        thread: Some(thread),
    })
}
