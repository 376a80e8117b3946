//! Transport abstraction
//!
//! This module provides byte-stream transports for the call protocol, with
//! an in-process loopback implementation for testing and a TCP
//! implementation for real deployments.

use crate::error::TransportError;
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A bidirectional byte stream carrying one call
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Which transport implementation to use
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    /// In-process only: client and server must share one `Transport`
    Loopback,
}

/// Configuration for the transport
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Largest encoded frame accepted or produced
    pub max_frame_size: usize,
    /// Upper bound on establishing a connection
    pub connect_timeout: Duration,
    /// How long a server waits for the headers of an accepted connection
    pub header_timeout: Duration,
    /// Buffer size of each in-process pipe (loopback only)
    pub loopback_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Tcp,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: Duration::from_secs(5),
            header_timeout: Duration::from_secs(10),
            loopback_buffer_size: 64 * 1024,
        }
    }
}

/// Trait for transport implementations
pub trait TransportTrait: Send + Sync {
    /// Open a stream to a listener at `address`
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<BoxStream, TransportError>>;

    /// Start listening at `address`
    fn bind<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn Listener>, TransportError>>;
}

/// Server side of a transport
pub trait Listener: Send {
    /// Wait for the next inbound stream; yields the stream and the peer address
    fn accept(&mut self) -> BoxFuture<'_, Result<(BoxStream, String), TransportError>>;

    /// Address actually bound (resolves port 0)
    fn local_addr(&self) -> String;
}

/// Transport handle shared by channels and servers
///
/// Cloning is cheap. Loopback endpoints only see each other when they use
/// clones of the same `Transport`.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<dyn TransportTrait>,
    config: TransportConfig,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let inner: Arc<dyn TransportTrait> = match config.kind {
            TransportKind::Tcp => Arc::new(TcpTransport::new(config.clone())),
            TransportKind::Loopback => Arc::new(LoopbackTransport::new(config.clone())),
        };
        Self { inner, config }
    }

    pub fn tcp() -> Self {
        Self::new(TransportConfig::default())
    }

    pub fn loopback() -> Self {
        Self::new(TransportConfig {
            kind: TransportKind::Loopback,
            ..Default::default()
        })
    }

    pub async fn connect(&self, address: &str) -> Result<BoxStream, TransportError> {
        self.inner.connect(address).await
    }

    pub async fn bind(&self, address: &str) -> Result<Box<dyn Listener>, TransportError> {
        self.inner.bind(address).await
    }

    pub fn header_timeout(&self) -> Duration {
        self.config.header_timeout
    }

    pub fn max_frame_size(&self) -> usize {
        self.config.max_frame_size
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::tcp()
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.config)
            .finish()
    }
}

/// TCP transport
struct TcpTransport {
    config: TransportConfig,
}

impl TcpTransport {
    fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl TransportTrait for TcpTransport {
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<BoxStream, TransportError>> {
        Box::pin(async move {
            let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address))
                .await
                .map_err(|_| TransportError::ConnectTimeout(address.to_string()))?
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::ConnectionRefused => {
                        TransportError::Unreachable(address.to_string())
                    }
                    _ => TransportError::Io(e),
                })?;
            stream.set_nodelay(true)?;
            tracing::trace!("TCP connected to {}", address);
            Ok(Box::new(stream) as BoxStream)
        })
    }

    fn bind<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn Listener>, TransportError>> {
        Box::pin(async move {
            let listener = TcpListener::bind(address).await.map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => TransportError::AddressInUse(address.to_string()),
                _ => TransportError::Io(e),
            })?;
            let local_addr = listener.local_addr()?.to_string();
            Ok(Box::new(TcpAcceptor {
                listener,
                local_addr,
            }) as Box<dyn Listener>)
        })
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    local_addr: String,
}

impl Listener for TcpAcceptor {
    fn accept(&mut self) -> BoxFuture<'_, Result<(BoxStream, String), TransportError>> {
        Box::pin(async move {
            let (stream, peer) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            Ok((Box::new(stream) as BoxStream, peer.to_string()))
        })
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }
}

type Registry = Arc<DashMap<String, mpsc::Sender<DuplexStream>>>;

/// In-process transport for testing without sockets
///
/// Listeners register under their address; `connect` hands the server end
/// of a `tokio::io::duplex` pipe to the listener.
struct LoopbackTransport {
    config: TransportConfig,
    listeners: Registry,
    next_port: AtomicU32,
}

impl LoopbackTransport {
    fn new(config: TransportConfig) -> Self {
        Self {
            config,
            listeners: Arc::new(DashMap::new()),
            next_port: AtomicU32::new(40000),
        }
    }

    /// Replace a `:0` port with a fresh one
    fn resolve(&self, address: &str) -> String {
        match address.strip_suffix(":0") {
            Some(host) => {
                let port = self.next_port.fetch_add(1, Ordering::Relaxed);
                format!("{}:{}", host, port)
            }
            None => address.to_string(),
        }
    }
}

impl TransportTrait for LoopbackTransport {
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<BoxStream, TransportError>> {
        Box::pin(async move {
            // Clone the sender so the map guard is released before awaiting
            let tx = self
                .listeners
                .get(address)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| TransportError::Unreachable(address.to_string()))?;

            let (client, server) = tokio::io::duplex(self.config.loopback_buffer_size);
            tx.send(server)
                .await
                .map_err(|_| TransportError::Unreachable(address.to_string()))?;

            tracing::trace!("Loopback connected to {}", address);
            Ok(Box::new(client) as BoxStream)
        })
    }

    fn bind<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn Listener>, TransportError>> {
        Box::pin(async move {
            let address = self.resolve(address);
            let (tx, rx) = mpsc::channel(128);

            match self.listeners.entry(address.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    return Err(TransportError::AddressInUse(address));
                }
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(tx.clone());
                }
            }

            Ok(Box::new(LoopbackListener {
                address,
                rx,
                tx,
                listeners: self.listeners.clone(),
            }) as Box<dyn Listener>)
        })
    }
}

struct LoopbackListener {
    address: String,
    rx: mpsc::Receiver<DuplexStream>,
    // Kept to recognise our own registry entry on drop
    tx: mpsc::Sender<DuplexStream>,
    listeners: Registry,
}

impl Listener for LoopbackListener {
    fn accept(&mut self) -> BoxFuture<'_, Result<(BoxStream, String), TransportError>> {
        Box::pin(async move {
            let stream = self.rx.recv().await.ok_or(TransportError::Closed)?;
            Ok((Box::new(stream) as BoxStream, "loopback".to_string()))
        })
    }

    fn local_addr(&self) -> String {
        self.address.clone()
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.listeners
            .remove_if(&self.address, |_, tx| tx.same_channel(&self.tx));
    }
}
