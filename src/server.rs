use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{info, warn};

use crate::broadcast::Broadcaster;
use crate::connection;
use crate::registry::Registry;

/// State shared by the accept loop and every connection task.
pub struct ServerState {
    pub registry: Arc<Registry>,
    pub broadcaster: Broadcaster,
    shutdown: AtomicBool,
}

impl ServerState {
    fn new() -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        Arc::new(Self {
            broadcaster: Broadcaster::new(Arc::clone(&registry)),
            registry,
            shutdown: AtomicBool::new(false),
        })
    }

    /// True once shutdown has been requested. Dispatch loops poll this
    /// between frames, so they notice within one poll interval.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

pub struct ChatServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl ChatServer {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: ServerState::new(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` completes. The accept loop only
    /// spawns; per-connection work never blocks it.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ChatServer { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    state.begin_shutdown();
                    break;
                }
                accepted = listener.accept() => {
                    handle_accept_result(accepted, &state);
                }
            }
        }

        // Dispatchers observe the flag within one poll and run their own
        // cleanup; clearing here covers any that never get the chance.
        state.registry.clear();
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
) {
    match result {
        Ok((stream, peer)) => {
            info!(%peer, "new connection");
            let state = Arc::clone(state);
            tokio::spawn(connection::handle_connection(stream, state));
        }
        // Accept errors are transient as far as the server is concerned;
        // log and keep serving.
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}
