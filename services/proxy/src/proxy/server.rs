//! Inbound TCP server.
//!
//! Accepts client connections, binds each one to a backend through the
//! [`Proxy`] and relays one exchange every time the connection becomes
//! readable. Lifecycle hooks fire on open, close and shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::resource::{getrlimit, Resource};
use relayd_hooks::{HookName, HookRunner, Payload};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::engine::Proxy;
use super::inbound::{Inbound, InboundId, TcpInbound};
use super::traffic::connection_payload;
use crate::error::ProxyError;

/// Default maximum concurrent inbound connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for the inbound server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Statistics for the inbound server.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently open.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to the max limit.
    pub connections_rejected: AtomicU64,
    /// Connections closed because no backend could be bound.
    pub connections_refused: AtomicU64,
}

/// The inbound side of the proxy.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    proxy: Arc<Proxy>,
    hooks: Arc<dyn HookRunner>,
    conn_semaphore: Arc<Semaphore>,
    next_id: AtomicU64,
    stats: Arc<ServerStats>,
}

impl Server {
    /// Bind the server.
    pub async fn bind(
        config: ServerConfig,
        proxy: Arc<Proxy>,
        hooks: Arc<dyn HookRunner>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Server bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            proxy,
            hooks,
            next_id: AtomicU64::new(1),
            stats: Arc::new(ServerStats::default()),
        })
    }

    /// Get the local address the server is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    /// Accept connections until `shutdown` turns true or its sender drops,
    /// then shut the proxy down.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        self.log_open_file_limits();
        info!(bind_addr = %local_addr, "Server started");

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.accept(stream, peer_addr),
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        info!(
            active = self.stats.connections_active.load(Ordering::Relaxed),
            "Shutting down server"
        );

        let mut payload = Payload::new();
        payload.insert(
            "connections".to_string(),
            json!(self.stats.connections_active.load(Ordering::Relaxed)),
        );
        self.hooks.notify(HookName::OnShutdown, payload).await;

        self.proxy.shutdown();
        info!("Server stopped");
    }

    fn accept(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let permit = match self.conn_semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.stats
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                return;
            }
        };

        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.stats
            .connections_active
            .fetch_add(1, Ordering::Relaxed);

        let server = Arc::clone(self);
        let stats = Arc::clone(&self.stats);

        tokio::spawn(
            async move {
                if let Err(e) = server.handle_connection(stream).await {
                    debug!(peer_addr = %peer_addr, error = %e, "Connection error");
                }

                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                drop(permit);
            }
            .instrument(tracing::info_span!("connection", peer = %peer_addr)),
        );
    }

    async fn handle_connection(&self, stream: TcpStream) -> io::Result<()> {
        let id = InboundId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let inbound = Arc::new(TcpInbound::new(id, stream)?);
        let conn: Arc<dyn Inbound> = inbound.clone();

        self.hooks
            .notify(HookName::OnOpened, connection_payload(conn.as_ref()))
            .await;

        if let Err(e) = self.proxy.connect(Arc::clone(&conn)).await {
            self.stats
                .connections_refused
                .fetch_add(1, Ordering::Relaxed);
            warn!(inbound = %id, error = %e, "No backend for the connection, closing it");
            inbound.close();
            self.hooks
                .notify(HookName::OnClosed, connection_payload(conn.as_ref()))
                .await;
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = inbound.closed() => break,
                readable = inbound.readable() => match readable {
                    Ok(0) => {
                        self.release(&conn);
                        break;
                    }
                    Ok(_) => match self.proxy.pass_through(&conn).await {
                        Ok(()) => {}
                        Err(ProxyError::ClientNotFound) => break,
                        Err(e) => warn!(inbound = %id, error = %e, "Failed to relay traffic"),
                    },
                    Err(e) => {
                        debug!(inbound = %id, error = %e, "Inbound read failed");
                        self.release(&conn);
                        break;
                    }
                },
            }
        }

        inbound.close();
        self.hooks
            .notify(HookName::OnClosed, connection_payload(conn.as_ref()))
            .await;
        Ok(())
    }

    fn release(&self, conn: &Arc<dyn Inbound>) {
        match self.proxy.disconnect(conn.as_ref()) {
            Ok(()) | Err(ProxyError::ClientNotConnected) => {}
            Err(e) => debug!(inbound = %conn.id(), error = %e, "Failed to release the backend"),
        }
    }

    fn log_open_file_limits(&self) {
        match getrlimit(Resource::RLIMIT_NOFILE) {
            Ok((soft, hard)) => {
                debug!(soft, hard, "Open file limits");
                if usize::try_from(soft).is_ok_and(|soft| soft < self.config.max_connections) {
                    warn!(
                        soft,
                        max_connections = self.config.max_connections,
                        "Open file limit is lower than max connections"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Failed to read open file limits"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }
}
