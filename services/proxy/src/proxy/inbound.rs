//! Inbound connections.
//!
//! The proxy engine talks to client connections only through the [`Inbound`]
//! trait; [`TcpInbound`] is the implementation used by the server.

use std::fmt;
use std::io;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Read size used when draining an inbound connection.
const READ_CHUNK_SIZE: usize = 4096;

/// Stable identity of an inbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InboundId(u64);

impl InboundId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InboundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inbound-{}", self.0)
    }
}

/// Invoked once an asynchronous write has completed or failed.
pub type WriteCallback = Box<dyn FnOnce(io::Result<usize>) + Send + 'static>;

/// A client connection as seen by the proxy engine.
pub trait Inbound: Send + Sync {
    /// Identity used as the busy-pool key.
    fn id(&self) -> InboundId;

    fn local_addr(&self) -> String;

    fn remote_addr(&self) -> String;

    /// Drain readable bytes without blocking, up to `max` bytes if given.
    fn next(&self, max: Option<usize>) -> io::Result<Vec<u8>>;

    /// Queue `data` for writing. `on_complete` runs when the write finishes.
    ///
    /// An `Err` means the write could not be submitted at all.
    fn async_write(&self, data: Vec<u8>, on_complete: WriteCallback) -> io::Result<()>;

    /// Close the connection. Closing twice is a no-op.
    fn close(&self);
}

struct PendingWrite {
    data: Vec<u8>,
    on_complete: WriteCallback,
}

/// TCP inbound connection with a background writer task.
pub struct TcpInbound {
    id: InboundId,
    stream: Arc<TcpStream>,
    local_addr: String,
    remote_addr: String,
    writer: mpsc::UnboundedSender<PendingWrite>,
    closed: watch::Sender<bool>,
}

impl TcpInbound {
    /// Wrap an accepted stream. Must be called from within a tokio runtime.
    pub fn new(id: InboundId, stream: TcpStream) -> io::Result<Self> {
        let local_addr = stream.local_addr()?.to_string();
        let remote_addr = stream.peer_addr()?.to_string();
        let stream = Arc::new(stream);

        let (writer, queue) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        tokio::spawn(write_loop(id, Arc::clone(&stream), queue, closed.subscribe()));

        Ok(Self {
            id,
            stream,
            local_addr,
            remote_addr,
            writer,
            closed,
        })
    }

    /// Wait until the connection has bytes to read or has reached EOF.
    ///
    /// Returns the number of bytes peeked; 0 means the peer closed its end.
    pub async fn readable(&self) -> io::Result<usize> {
        let mut byte = [0u8; 1];
        self.stream.peek(&mut byte).await
    }

    /// Resolves once [`Inbound::close`] has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl fmt::Debug for TcpInbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpInbound")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Inbound for TcpInbound {
    fn id(&self) -> InboundId {
        self.id
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    fn next(&self, max: Option<usize>) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            let want = match max {
                Some(max) => (max - data.len()).min(READ_CHUNK_SIZE),
                None => READ_CHUNK_SIZE,
            };
            if want == 0 {
                break;
            }

            match self.stream.try_read(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if data.is_empty() => return Err(e),
                Err(_) => break,
            }
        }
        Ok(data)
    }

    fn async_write(&self, data: Vec<u8>, on_complete: WriteCallback) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "inbound connection is closed",
            ));
        }
        self.writer
            .send(PendingWrite { data, on_complete })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "inbound writer has stopped"))
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!(inbound = %self.id, remote = %self.remote_addr, "Inbound connection closed");
        }
    }
}

// The socket is released once both the connection and this task drop their
// handles. Close stops the task: writes already queued are still attempted,
// but one stuck on a peer that stopped reading fails with `NotConnected`.
async fn write_loop(
    id: InboundId,
    stream: Arc<TcpStream>,
    mut queue: mpsc::UnboundedReceiver<PendingWrite>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let PendingWrite { data, on_complete } = tokio::select! {
            biased;
            next = queue.recv() => match next {
                Some(pending) => pending,
                None => break,
            },
            _ = closed.wait_for(|closed| *closed) => break,
        };

        let result = tokio::select! {
            biased;
            written = write_all(&stream, &data) => written.map(|()| data.len()),
            _ = closed.wait_for(|closed| *closed) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "inbound connection closed during write",
            )),
        };
        let failed = result.is_err();
        on_complete(result);
        if failed {
            debug!(inbound = %id, "Inbound writer stopped after a failed write");
            break;
        }
    }
}

async fn write_all(stream: &TcpStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        stream.writable().await?;
        match stream.try_write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
