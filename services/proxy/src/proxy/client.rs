//! Backend client.
//!
//! A [`Client`] owns one physical connection to the backend service. Clients
//! are built from a [`ClientConfig`] template, so the proxy can manufacture
//! replacements (reconnection) and extra clients (elastic mode) on demand.
//!
//! Supported networks: `tcp`, `tcp4`, `tcp6`, `udp`, `udp4`, `udp6`, `unix`.
//! [`resolve`] also accepts `unixgram` and `unixpacket`, but clients can only
//! connect to stream sockets, so [`Client::connect`] rejects them.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream, UdpSocket, UnixStream};
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::ProxyError;

/// Default size of a single receive chunk.
pub const DEFAULT_RECEIVE_CHUNK_SIZE: usize = 8192;

/// Default socket receive buffer size.
pub const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 1024 * 1024;

/// Length of the id prefix used in logs.
const SHORT_ID_LEN: usize = 7;

/// Per-process seed mixed into every client id.
static ID_SEED: AtomicU64 = AtomicU64::new(0);

/// Template for building backend clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Network type (`tcp`, `udp`, `unix`, ...).
    pub network: String,
    /// Backend address (`host:port`, or a socket path for `unix`).
    pub address: String,
    /// Socket receive buffer size in bytes (0 keeps the OS default).
    pub receive_buffer_size: usize,
    /// Size of each read while receiving a response.
    pub receive_chunk_size: usize,
    /// Deadline for each chunk read.
    #[serde(serialize_with = "serialize_millis")]
    pub receive_deadline: Option<Duration>,
    /// Deadline for a send.
    #[serde(serialize_with = "serialize_millis")]
    pub send_deadline: Option<Duration>,
}

impl ClientConfig {
    /// Create a client template with default buffer sizes and no deadlines.
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            receive_chunk_size: DEFAULT_RECEIVE_CHUNK_SIZE,
            receive_deadline: None,
            send_deadline: None,
        }
    }
}

fn serialize_millis<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(value.map_or(0, |d| d.as_millis() as u64))
}

/// Compute the content-addressed id of a client.
pub fn client_id(network: &str, address: &str, seed: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{network}://{address}{seed}").as_bytes());
    hex::encode(hasher.finalize())
}

// =============================================================================
// Address Resolution
// =============================================================================

enum Target {
    Tcp(SocketAddr),
    Udp(SocketAddr),
    Unix(String),
}

async fn resolve_target(network: &str, address: &str) -> Result<Target, ProxyError> {
    match network {
        "tcp" | "tcp4" | "tcp6" => resolve_inet(network, address).await.map(Target::Tcp),
        "udp" | "udp4" | "udp6" => resolve_inet(network, address).await.map(Target::Udp),
        "unix" => Ok(Target::Unix(address.to_string())),
        other => {
            warn!(network = %other, "Network is not supported");
            Err(ProxyError::NetworkNotSupported(other.to_string()))
        }
    }
}

async fn resolve_inet(network: &str, address: &str) -> Result<SocketAddr, ProxyError> {
    let mut addrs = lookup_host(address)
        .await
        .map_err(ProxyError::ResolveFailed)?;

    addrs
        .find(|addr| match network.as_bytes().last() {
            Some(b'4') => addr.is_ipv4(),
            Some(b'6') => addr.is_ipv6(),
            _ => true,
        })
        .ok_or_else(|| {
            ProxyError::ResolveFailed(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {network} address found for {address}"),
            ))
        })
}

/// Resolve a backend address for `network`.
///
/// Internet addresses resolve to `ip:port`; unix socket paths are returned
/// unchanged.
pub async fn resolve(network: &str, address: &str) -> Result<String, ProxyError> {
    if matches!(network, "unixgram" | "unixpacket") {
        return Ok(address.to_string());
    }
    Ok(match resolve_target(network, address).await? {
        Target::Tcp(addr) | Target::Udp(addr) => addr.to_string(),
        Target::Unix(path) => path,
    })
}

// =============================================================================
// Connection
// =============================================================================

#[derive(Debug)]
enum Connection {
    Tcp(TcpStream),
    Udp(UdpSocket),
    Unix(UnixStream),
}

impl Connection {
    async fn open(target: Target, receive_buffer_size: usize) -> io::Result<Self> {
        match target {
            Target::Tcp(addr) => {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                if receive_buffer_size > 0 {
                    let size = u32::try_from(receive_buffer_size).unwrap_or(u32::MAX);
                    socket.set_recv_buffer_size(size)?;
                }
                Ok(Connection::Tcp(socket.connect(addr).await?))
            }
            Target::Udp(addr) => {
                let bind: SocketAddr = if addr.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    ([0u16; 8], 0).into()
                };
                let socket = UdpSocket::bind(bind).await?;
                socket.connect(addr).await?;
                Ok(Connection::Udp(socket))
            }
            Target::Unix(path) => Ok(Connection::Unix(UnixStream::connect(path).await?)),
        }
    }

    fn addrs(&self) -> io::Result<(String, String)> {
        Ok(match self {
            Connection::Tcp(s) => (s.local_addr()?.to_string(), s.peer_addr()?.to_string()),
            Connection::Udp(s) => (s.local_addr()?.to_string(), s.peer_addr()?.to_string()),
            Connection::Unix(s) => (
                unix_path(s.local_addr()?.as_pathname()),
                unix_path(s.peer_addr()?.as_pathname()),
            ),
        })
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.write_all(data).await.map(|()| data.len()),
            Connection::Udp(s) => s.send(data).await,
            Connection::Unix(s) => s.write_all(data).await.map(|()| data.len()),
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(s) => s.read(buf).await,
            Connection::Udp(s) => s.recv(buf).await,
            Connection::Unix(s) => s.read(buf).await,
        }
    }
}

fn unix_path(path: Option<&std::path::Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "@".to_string())
}

async fn with_deadline<T>(
    deadline: Option<Duration>,
    op: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match deadline {
        Some(deadline) => match timeout(deadline, op).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded")),
        },
        None => op.await,
    }
}

// =============================================================================
// Client
// =============================================================================

/// One physical connection to the backend.
#[derive(Debug)]
pub struct Client {
    id: String,
    config: ClientConfig,
    local_addr: String,
    remote_addr: String,
    conn: Mutex<Option<Connection>>,
    connected: AtomicBool,
    closed: watch::Sender<bool>,
}

impl Client {
    /// Connect a new client using `config`.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ProxyError> {
        let target = resolve_target(&config.network, &config.address).await?;
        let conn = Connection::open(target, config.receive_buffer_size)
            .await
            .map_err(ProxyError::ClientConnectFailed)?;
        let (local_addr, remote_addr) = conn.addrs().map_err(ProxyError::ClientConnectFailed)?;

        let seed = ID_SEED.fetch_add(1, Ordering::Relaxed);
        let client = Self {
            id: client_id(&config.network, &config.address, seed),
            config: config.clone(),
            local_addr,
            remote_addr,
            conn: Mutex::new(Some(conn)),
            connected: AtomicBool::new(true),
            closed: watch::channel(false).0,
        };

        debug!(
            client = %client.short_id(),
            network = %config.network,
            address = %config.address,
            "New client created"
        );
        Ok(client)
    }

    /// Unique identifier of this client.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id prefix for logs.
    pub fn short_id(&self) -> &str {
        &self.id[..SHORT_ID_LEN.min(self.id.len())]
    }

    /// Template this client was built from.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Local address of the backend connection.
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Remote (backend) address of the connection.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Whether the connection is still usable.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Send `data` to the backend, bounded by the send deadline.
    pub async fn send(&self, data: &[u8]) -> Result<usize, ProxyError> {
        let mut guard = self.conn.lock().await;
        let result = match guard.as_mut() {
            Some(conn) if self.is_connected() => {
                self.unless_closed(with_deadline(self.config.send_deadline, conn.write(data)))
                    .await
            }
            _ => return Err(ProxyError::ClientNotConnected),
        };
        self.release_if_closed(&mut guard);

        let Some(result) = result else {
            return Err(ProxyError::ClientNotConnected);
        };
        result.map_err(|e| {
            warn!(client = %self.short_id(), error = %e, "Couldn't send data to the server");
            ProxyError::ClientSendFailed(e)
        })
    }

    /// Receive one response from the backend.
    ///
    /// Reads chunks of `receive_chunk_size` until a short read. A zero-length
    /// first read means the backend closed the connection; the error then
    /// satisfies [`ProxyError::is_eof`] and the client is marked disconnected.
    pub async fn receive(&self) -> Result<Vec<u8>, ProxyError> {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut().filter(|_| self.is_connected()) else {
            return Err(ProxyError::ClientNotConnected);
        };

        let chunk_size = self.config.receive_chunk_size.max(1);
        let mut chunk = vec![0u8; chunk_size];
        let mut buffer = Vec::new();

        let result = loop {
            let read = with_deadline(self.config.receive_deadline, conn.read(&mut chunk));
            let Some(read) = self.unless_closed(read).await else {
                break Err(ProxyError::ClientNotConnected);
            };
            match read {
                Ok(0) if buffer.is_empty() => {
                    self.connected.store(false, Ordering::Release);
                    break Err(ProxyError::ClientReceiveFailed(
                        io::ErrorKind::UnexpectedEof.into(),
                    ));
                }
                Ok(0) => break Ok(()),
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if n < chunk_size {
                        break Ok(());
                    }
                }
                Err(e) if buffer.is_empty() => break Err(ProxyError::ClientReceiveFailed(e)),
                Err(e) => {
                    warn!(
                        client = %self.short_id(),
                        received = buffer.len(),
                        error = %e,
                        "Receive stopped early, returning partial response"
                    );
                    break Ok(());
                }
            }
        };
        self.release_if_closed(&mut guard);

        result.map(|()| buffer)
    }

    /// Close the connection. Closing twice is a no-op.
    ///
    /// Never waits for an in-flight send or receive. Such an operation is
    /// interrupted, fails with [`ProxyError::ClientNotConnected`] and drops
    /// the connection on its way out.
    pub fn close(&self) {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        self.closed.send_replace(true);
        if let Ok(mut guard) = self.conn.try_lock() {
            guard.take();
        }
        if was_connected {
            debug!(client = %self.short_id(), "Client closed");
        }
    }

    // `None` means the client was closed before `op` finished.
    async fn unless_closed<T>(
        &self,
        op: impl Future<Output = io::Result<T>>,
    ) -> Option<io::Result<T>> {
        let mut closed = self.closed.subscribe();
        tokio::select! {
            result = op => Some(result),
            _ = closed.wait_for(|closed| *closed) => None,
        }
    }

    fn release_if_closed(&self, guard: &mut MutexGuard<'_, Option<Connection>>) {
        if !self.is_connected() {
            guard.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::{TcpListener, UnixListener};

    async fn echo_listener() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[test]
    fn test_client_id_is_content_addressed() {
        let a = client_id("tcp", "localhost:5432", 1);
        let b = client_id("tcp", "localhost:5432", 1);
        let c = client_id("tcp", "localhost:5432", 2);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_resolve() {
        assert_eq!(
            resolve("tcp", "127.0.0.1:5432").await.unwrap(),
            "127.0.0.1:5432"
        );
        assert_eq!(resolve("udp4", "127.0.0.1:53").await.unwrap(), "127.0.0.1:53");
        assert_eq!(resolve("unix", "/tmp/db.sock").await.unwrap(), "/tmp/db.sock");
        assert!(matches!(
            resolve("tcp6", "127.0.0.1:5432").await,
            Err(ProxyError::ResolveFailed(_))
        ));
        assert!(matches!(
            resolve("sctp", "127.0.0.1:5432").await,
            Err(ProxyError::NetworkNotSupported(_))
        ));
        assert_eq!(resolve("unixgram", "/tmp/db.sock").await.unwrap(), "/tmp/db.sock");
        assert_eq!(resolve("unixpacket", "/tmp/db.sock").await.unwrap(), "/tmp/db.sock");
        assert!(matches!(
            Client::connect(&ClientConfig::new("unixpacket", "/tmp/db.sock")).await,
            Err(ProxyError::NetworkNotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let addr = echo_listener().await;
        let client = Client::connect(&ClientConfig::new("tcp", addr.to_string()))
            .await
            .unwrap();

        assert!(client.is_connected());
        assert_eq!(client.remote_addr(), addr.to_string());
        assert_eq!(client.send(b"hello").await.unwrap(), 5);
        assert_eq!(client.receive().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_clients_have_distinct_ids() {
        let addr = echo_listener().await;
        let config = ClientConfig::new("tcp", addr.to_string());
        let a = Client::connect(&config).await.unwrap();
        let b = Client::connect(&config).await.unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(a.short_id().len(), SHORT_ID_LEN);
    }

    #[tokio::test]
    async fn test_receive_detects_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let client = Client::connect(&ClientConfig::new("tcp", addr.to_string()))
            .await
            .unwrap();
        let err = client.receive().await.unwrap_err();

        assert!(err.is_eof());
        assert!(!client.is_connected());
        assert!(matches!(
            client.receive().await,
            Err(ProxyError::ClientNotConnected)
        ));
    }

    #[tokio::test]
    async fn test_receive_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut config = ClientConfig::new("tcp", addr.to_string());
        config.receive_deadline = Some(Duration::from_millis(50));
        let client = Client::connect(&config).await.unwrap();

        match client.receive().await {
            Err(ProxyError::ClientReceiveFailed(e)) => {
                assert_eq!(e.kind(), io::ErrorKind::TimedOut)
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let addr = echo_listener().await;
        let client = Client::connect(&ClientConfig::new("tcp", addr.to_string()))
            .await
            .unwrap();

        client.close();
        client.close();

        assert!(!client.is_connected());
        assert!(matches!(
            client.send(b"late").await,
            Err(ProxyError::ClientNotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_interrupts_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (eof_tx, eof_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let _ = eof_tx.send(stream.read(&mut buf).await.map_err(|e| e.kind()));
        });

        let client = Arc::new(
            Client::connect(&ClientConfig::new("tcp", addr.to_string()))
                .await
                .unwrap(),
        );
        let pending = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.receive().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.close();

        let result = timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();
        assert!(matches!(result, Err(ProxyError::ClientNotConnected)));

        // The backend sees the connection go away.
        let read = timeout(Duration::from_secs(2), eof_rx).await.unwrap().unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = Client::connect(&ClientConfig::new("tcp", addr.to_string())).await;
        assert!(matches!(result, Err(ProxyError::ClientConnectFailed(_))));
    }

    #[tokio::test]
    async fn test_unix_socket_round_trip() {
        let path = std::env::temp_dir().join(format!("relayd-client-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });

        let client = Client::connect(&ClientConfig::new("unix", path.display().to_string()))
            .await
            .unwrap();
        client.send(b"over unix").await.unwrap();
        assert_eq!(client.receive().await.unwrap(), b"over unix");

        client.close();
        let _ = std::fs::remove_file(&path);
    }
}
