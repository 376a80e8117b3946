//! RPC server implementation
//!
//! The server accepts one call per inbound stream, hands it to a user
//! handler wrapped in a [`RequestHandler`], and answers the call once the
//! handler returns. Handlers for distinct calls run concurrently.
//!
//! A handler is any `Fn(RequestHandler) -> impl Future<Output = anyhow::Result<()>>`.

use crate::error::{ProtocolError, ReceiveError, SendError, ServerError};
use crate::metadata::Metadata;
use crate::protocol::{self, CallStatus, Frame};
use crate::status;
use crate::transport::{BoxStream, Transport};
use bytes::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

type DynHandler = dyn Fn(RequestHandler) -> HandlerFuture + Send + Sync;

#[derive(Clone, Debug, PartialEq, Eq)]
enum ListenState {
    Pending,
    Listening(String),
    Closed,
}

enum Completion {
    Pending(Vec<Box<dyn FnOnce() + Send>>),
    Done,
}

struct ServerInner {
    address: String,
    transport: Transport,
    /// Set once `run` has been entered
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
    listen_tx: watch::Sender<ListenState>,
    completion: Mutex<Completion>,
    calls_served: Arc<AtomicU64>,
}

/// Unary RPC server
///
/// Cloning yields another handle to the same server, so a handler can
/// capture a clone and call [`Server::stop`].
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a TCP server for `address`. Binds nothing until `run`.
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_transport(address, Transport::default())
    }

    pub fn with_transport(address: impl Into<String>, transport: Transport) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (listen_tx, _) = watch::channel(ListenState::Pending);
        Self {
            inner: Arc::new(ServerInner {
                address: address.into(),
                transport,
                started: AtomicBool::new(false),
                stop_tx,
                listen_tx,
                completion: Mutex::new(Completion::Pending(Vec::new())),
                calls_served: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Number of calls dispatched to the handler so far
    pub fn calls_served(&self) -> u64 {
        self.inner.calls_served.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }

    /// Wait until the listener is bound and return its address
    pub async fn listening(&self) -> Result<String, ServerError> {
        let mut rx = self.inner.listen_tx.subscribe();
        let state = rx
            .wait_for(|state| *state != ListenState::Pending)
            .await
            .map(|state| state.clone())
            .map_err(|_| ServerError::Stopped)?;
        match state {
            ListenState::Listening(addr) => Ok(addr),
            _ => Err(ServerError::Stopped),
        }
    }

    /// Stop accepting new calls. In-flight calls still finish.
    ///
    /// Safe to call repeatedly and from inside a handler.
    pub fn stop(&self) {
        if !self.inner.stop_tx.send_replace(true) {
            tracing::info!("Stop requested for server on {}", self.inner.address);
        }
    }

    /// Register `callback` to run once the accept loop has exited.
    ///
    /// Runs immediately if the loop already exited.
    pub fn on_completion<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut completion = self.inner.completion.lock();
            if let Completion::Pending(callbacks) = &mut *completion {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Serve calls with `handler` until [`Server::stop`] is called.
    ///
    /// Returns after every accepted call has been answered. Completion
    /// callbacks fire on return, including when binding failed.
    pub async fn run<F, Fut>(&self, handler: F) -> Result<(), ServerError>
    where
        F: Fn(RequestHandler) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let handler: Arc<DynHandler> =
            Arc::new(move |request| Box::pin(handler(request)) as HandlerFuture);
        let result = self.serve(handler).await;

        self.inner.listen_tx.send_replace(ListenState::Closed);
        self.finish();
        result
    }

    async fn serve(&self, handler: Arc<DynHandler>) -> Result<(), ServerError> {
        let mut stop_rx = self.inner.stop_tx.subscribe();
        if *stop_rx.borrow_and_update() {
            tracing::info!("Server on {} stopped before it started", self.inner.address);
            return Ok(());
        }

        let mut listener = self
            .inner
            .transport
            .bind(&self.inner.address)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.inner.address.clone(),
                source,
            })?;
        let local_addr = listener.local_addr();
        self.inner
            .listen_tx
            .send_replace(ListenState::Listening(local_addr.clone()));
        tracing::info!("Server listening on {}", local_addr);

        let limits = CallLimits {
            max_frame_size: self.inner.transport.max_frame_size(),
            header_timeout: self.inner.transport.header_timeout(),
        };
        let mut in_flight = JoinSet::new();
        let mut next_id = 0u64;

        loop {
            tokio::select! {
                biased;

                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = next_id;
                        next_id += 1;
                        tracing::debug!("Accepted call {} from {}", id, peer);
                        in_flight.spawn(serve_call(
                            id,
                            stream,
                            handler.clone(),
                            limits,
                            stop_rx.clone(),
                            self.inner.calls_served.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed on {}: {}", local_addr, e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    reap(joined);
                }
            }
        }

        drop(listener);
        tracing::info!(
            "Server on {} draining {} in-flight calls",
            local_addr,
            in_flight.len()
        );
        while let Some(joined) = in_flight.join_next().await {
            reap(joined);
        }
        tracing::info!("Server on {} stopped", local_addr);

        Ok(())
    }

    fn finish(&self) {
        let callbacks = match std::mem::replace(&mut *self.inner.completion.lock(), Completion::Done)
        {
            Completion::Pending(callbacks) => callbacks,
            Completion::Done => Vec::new(),
        };
        for callback in callbacks {
            callback();
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.inner.address)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        tracing::error!("Call task failed: {}", e);
    }
}

#[derive(Clone, Copy)]
struct CallLimits {
    max_frame_size: usize,
    header_timeout: Duration,
}

/// Resolves once stop has been requested
async fn stop_requested(mut stop_rx: watch::Receiver<bool>) {
    loop {
        let stopped = *stop_rx.borrow_and_update();
        if stopped {
            return;
        }
        if stop_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Serve one inbound call end to end
async fn serve_call(
    id: u64,
    stream: BoxStream,
    handler: Arc<DynHandler>,
    limits: CallLimits,
    stop_rx: watch::Receiver<bool>,
    calls_served: Arc<AtomicU64>,
) {
    let max_frame_size = limits.max_frame_size;
    let (mut reader, writer) = tokio::io::split(stream);

    // A connection only becomes a call once its headers arrive
    let headers = tokio::select! {
        biased;

        read = tokio::time::timeout(
            limits.header_timeout,
            protocol::read_frame(&mut reader, max_frame_size),
        ) => read,

        _ = stop_requested(stop_rx) => {
            tracing::debug!("Call {}: dropped before headers, server stopping", id);
            return;
        }
    };

    let (host, method, metadata) = match headers {
        Ok(Ok(Frame::Headers {
            host,
            method,
            metadata,
        })) => (host, method, metadata),
        Ok(Ok(other)) => {
            tracing::warn!("Call {}: expected Headers, got {}", id, other.kind());
            return;
        }
        Ok(Err(e)) => {
            tracing::warn!("Call {}: failed to read headers: {}", id, e);
            return;
        }
        Err(_) => {
            tracing::warn!(
                "Call {}: no headers within {:?}",
                id,
                limits.header_timeout
            );
            return;
        }
    };

    calls_served.fetch_add(1, Ordering::Relaxed);
    tracing::debug!("Call {}: {} for host {}", id, method, host);

    let slot = Arc::new(CallSlot {
        expired: AtomicBool::new(false),
        exchange: tokio::sync::Mutex::new(Exchange {
            reader: Some(reader),
            writer,
            stage: Stage::Created,
            max_frame_size,
        }),
    });
    let request = RequestHandler {
        host,
        method: method.clone(),
        request_metadata: metadata,
        slot: slot.clone(),
    };

    // Own task so a panicking handler only fails this call
    let outcome = tokio::spawn(handler(request)).await;
    slot.expired.store(true, Ordering::SeqCst);

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            tracing::warn!("Call {}: handler for {} failed: {:#}", id, method, e);
            Some((status::UNKNOWN, e.to_string()))
        }
        Err(e) => {
            tracing::warn!("Call {}: handler for {} panicked: {}", id, method, e);
            Some((status::INTERNAL, "handler panicked".to_string()))
        }
    };

    let mut exchange = slot.exchange.lock().await;
    if exchange.stage != Stage::Responded {
        let (code, status_message) = failure.unwrap_or_else(|| {
            (
                status::UNKNOWN,
                "handler returned without sending a response".to_string(),
            )
        });
        let final_status = CallStatus {
            message: None,
            code,
            status_message,
            trailing_metadata: Metadata::new(),
        };
        if let Err(e) = exchange.write(&Frame::Status(final_status)).await {
            tracing::debug!("Call {}: failed to report handler failure: {}", id, e);
        }
    }
    let _ = exchange.writer.shutdown().await;

    tracing::debug!("Call {} finished", id);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Created,
    /// Initial metadata written, request message not yet read
    MetadataSent,
    MessageReceived,
    Responded,
}

/// State of one call shared between the server and its `RequestHandler`
struct CallSlot {
    /// Set as soon as the handler invocation ends
    expired: AtomicBool,
    exchange: tokio::sync::Mutex<Exchange>,
}

impl CallSlot {
    /// Lock the exchange unless the invocation already ended
    async fn lock(&self) -> Option<tokio::sync::MutexGuard<'_, Exchange>> {
        if self.expired.load(Ordering::SeqCst) {
            return None;
        }
        let exchange = self.exchange.lock().await;
        if self.expired.load(Ordering::SeqCst) {
            return None;
        }
        Some(exchange)
    }
}

/// Server side of one call's byte stream
struct Exchange {
    reader: Option<ReadHalf<BoxStream>>,
    writer: WriteHalf<BoxStream>,
    stage: Stage,
    max_frame_size: usize,
}

impl Exchange {
    async fn write(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        protocol::write_frame(&mut self.writer, frame, self.max_frame_size).await
    }

    async fn write_encoded(&mut self, buf: &[u8]) -> Result<(), ProtocolError> {
        self.writer.write_all(buf).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// One inbound call, valid for the duration of a single handler invocation
///
/// `send_response` consumes the handler. Any handle that escapes the
/// invocation is expired by the server once the invocation returns.
pub struct RequestHandler {
    host: String,
    method: String,
    request_metadata: Metadata,
    slot: Arc<CallSlot>,
}

impl RequestHandler {
    /// Virtual host requested by the client
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Metadata the client sent with the call
    pub fn request_metadata(&self) -> &Metadata {
        &self.request_metadata
    }

    /// Send `initial_metadata`, then wait for the request message and pass
    /// it to `on_message`.
    pub async fn receive_message<F>(
        &self,
        initial_metadata: Metadata,
        on_message: F,
    ) -> Result<(), ReceiveError>
    where
        F: FnOnce(Option<Bytes>),
    {
        let mut exchange = self.slot.lock().await.ok_or(ReceiveError::Expired)?;
        if exchange.stage != Stage::Created {
            return Err(ReceiveError::AlreadyReceived);
        }

        exchange.write(&Frame::InitialMetadata(initial_metadata)).await?;
        exchange.stage = Stage::MetadataSent;

        let max_frame_size = exchange.max_frame_size;
        let reader = exchange
            .reader
            .as_mut()
            .ok_or(ReceiveError::AlreadyReceived)?;
        let message = match protocol::read_frame(reader, max_frame_size).await? {
            Frame::Message(message) => message,
            other => {
                return Err(ProtocolError::UnexpectedFrame {
                    expected: "Message",
                    got: other.kind(),
                }
                .into())
            }
        };
        exchange.reader = None;
        exchange.stage = Stage::MessageReceived;
        drop(exchange);

        on_message(message);
        Ok(())
    }

    /// Send the reply message, status and trailing metadata, completing the
    /// call.
    pub async fn send_response(
        self,
        message: Option<Bytes>,
        status_code: i32,
        status_message: impl Into<String>,
        trailing_metadata: Metadata,
    ) -> Result<(), SendError> {
        let mut exchange = self.slot.lock().await.ok_or(SendError::Expired)?;
        match exchange.stage {
            Stage::MetadataSent | Stage::MessageReceived => {}
            Stage::Created => return Err(SendError::MessageNotReceived),
            Stage::Responded => return Err(SendError::AlreadyCompleted),
        }

        let final_status = CallStatus {
            message,
            code: status_code,
            status_message: status_message.into(),
            trailing_metadata,
        };
        // Nothing is on the wire yet if encoding fails, so the call stays open
        let buf = protocol::encode(&Frame::Status(final_status), exchange.max_frame_size)?;

        // A failed write must not be followed by a second status
        exchange.stage = Stage::Responded;
        exchange.write_encoded(&buf).await?;
        Ok(())
    }
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("host", &self.host)
            .field("method", &self.method)
            .field("request_metadata", &self.request_metadata)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Channel;
    use crate::transport::{TransportConfig, TransportKind};
    use tokio::io::AsyncReadExt;

    fn spawn_server<F, Fut>(server: &Server, handler: F) -> tokio::task::JoinHandle<Result<(), ServerError>>
    where
        F: Fn(RequestHandler) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let server = server.clone();
        tokio::spawn(async move { server.run(handler).await })
    }

    #[tokio::test]
    async fn test_echo_call() {
        let transport = Transport::loopback();
        let server = Server::with_transport("echo:0", transport.clone());
        let handle = spawn_server(&server, |request: RequestHandler| async move {
            assert_eq!(request.method(), "/echo");
            assert_eq!(request.request_metadata().get("k"), Some("v"));
            let mut received = None;
            request
                .receive_message(Metadata::from([("a", "Apple")]), |message| received = message)
                .await?;
            request
                .send_response(received, status::OK, "OK", Metadata::from([("0", "zero")]))
                .await?;
            Ok(())
        });

        let addr = server.listening().await.unwrap();
        let channel = Channel::with_transport(addr, transport);
        let response = channel
            .unary("/echo", Metadata::from([("k", "v")]), Some(Bytes::from_static(b"ping")))
            .await
            .unwrap();

        assert!(response.is_ok());
        assert_eq!(response.result_data, Some(Bytes::from_static(b"ping")));
        assert_eq!(response.initial_metadata.unwrap().get("a"), Some("Apple"));
        assert_eq!(response.trailing_metadata.unwrap().get("0"), Some("zero"));

        server.stop();
        handle.await.unwrap().unwrap();
        assert_eq!(server.calls_served(), 1);
    }

    #[tokio::test]
    async fn test_stop_before_run_fires_completion() {
        let server = Server::with_transport("idle:0", Transport::loopback());
        server.stop();
        server.stop();

        let (tx, rx) = tokio::sync::oneshot::channel();
        server.on_completion(move || {
            let _ = tx.send(());
        });

        server
            .run(|_request: RequestHandler| async { Ok(()) })
            .await
            .unwrap();
        rx.await.unwrap();

        // Registered after exit: runs immediately
        let late = Arc::new(AtomicBool::new(false));
        let flag = late.clone();
        server.on_completion(move || flag.store(true, Ordering::SeqCst));
        assert!(late.load(Ordering::SeqCst));
        assert!(server.listening().await.is_err());
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let server = Server::with_transport("twice:0", Transport::loopback());
        let handle = spawn_server(&server, |_request: RequestHandler| async { Ok(()) });
        server.listening().await.unwrap();

        let second = server.run(|_request: RequestHandler| async { Ok(()) }).await;
        assert!(matches!(second, Err(ServerError::AlreadyRunning)));

        server.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let transport = Transport::loopback();
        let first = Server::with_transport("taken:1", transport.clone());
        let handle = spawn_server(&first, |_request: RequestHandler| async { Ok(()) });
        first.listening().await.unwrap();

        let second = Server::with_transport("taken:1", transport);
        let result = second.run(|_request: RequestHandler| async { Ok(()) }).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));

        first.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_before_receive_is_rejected() {
        let transport = Transport::loopback();
        let server = Server::with_transport("order:0", transport.clone());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let handle = spawn_server(&server, move |request: RequestHandler| {
            let tx = tx.clone();
            async move {
                let result = request.send_response(None, status::OK, "OK", Metadata::new()).await;
                let sender = tx.lock().take();
                if let Some(tx) = sender {
                    let _ = tx.send(matches!(result, Err(SendError::MessageNotReceived)));
                }
                Ok(())
            }
        });

        let addr = server.listening().await.unwrap();
        let channel = Channel::with_transport(addr, transport);
        let response = channel.unary("/x", Metadata::new(), None).await.unwrap();

        assert!(rx.await.unwrap());
        assert_eq!(response.status_code, status::UNKNOWN);
        assert_eq!(response.initial_metadata, None);

        server.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_escaped_handler_is_expired() {
        let transport = Transport::loopback();
        let server = Server::with_transport("escape:0", transport.clone());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let handle = spawn_server(&server, move |request: RequestHandler| {
            let tx = tx.lock().take();
            async move {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let result = request.receive_message(Metadata::new(), |_| {}).await;
                    if let Some(tx) = tx {
                        let _ = tx.send(matches!(result, Err(ReceiveError::Expired)));
                    }
                });
                Ok(())
            }
        });

        let addr = server.listening().await.unwrap();
        let channel = Channel::with_transport(addr, transport);
        let response = channel.unary("/escape", Metadata::new(), None).await.unwrap();

        assert_eq!(response.status_code, status::UNKNOWN);
        assert!(rx.await.unwrap());

        server.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let transport = Transport::loopback();
        let server = Server::with_transport("panic:0", transport.clone());
        let handle = spawn_server(&server, |request: RequestHandler| async move {
            if request.method() == "/panic" {
                panic!("handler blew up");
            }
            request.receive_message(Metadata::new(), |_| {}).await?;
            request.send_response(None, status::OK, "OK", Metadata::new()).await?;
            Ok(())
        });

        let addr = server.listening().await.unwrap();
        let channel = Channel::with_transport(addr, transport);

        let failed = channel.unary("/panic", Metadata::new(), None).await.unwrap();
        assert_eq!(failed.status_code, status::INTERNAL);

        let ok = channel.unary("/fine", Metadata::new(), None).await.unwrap();
        assert!(ok.is_ok());

        server.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_idle_connection_does_not_block_stop() {
        let transport = Transport::loopback();
        let server = Server::with_transport("idle-peer:0", transport.clone());
        let (tx, rx) = tokio::sync::oneshot::channel();
        server.on_completion(move || {
            let _ = tx.send(());
        });
        let handle = spawn_server(&server, |_request: RequestHandler| async { Ok(()) });

        let addr = server.listening().await.unwrap();
        let _idle = transport.connect(&addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        server.stop();
        let finished = tokio::time::timeout(Duration::from_secs(3), handle).await;
        finished.expect("run did not return after stop").unwrap().unwrap();
        rx.await.unwrap();
        assert_eq!(server.calls_served(), 0);
    }

    #[tokio::test]
    async fn test_connection_without_headers_times_out() {
        let transport = Transport::new(TransportConfig {
            kind: TransportKind::Loopback,
            header_timeout: Duration::from_millis(50),
            ..TransportConfig::default()
        });
        let server = Server::with_transport("slow-peer:0", transport.clone());
        let handle = spawn_server(&server, |request: RequestHandler| async move {
            request.receive_message(Metadata::new(), |_| {}).await?;
            request.send_response(None, status::OK, "OK", Metadata::new()).await?;
            Ok(())
        });

        let addr = server.listening().await.unwrap();
        let mut idle = transport.connect(&addr).await.unwrap();

        // The server hangs up on the silent peer
        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(3), idle.read_to_end(&mut buf)).await;
        assert_eq!(read.unwrap().unwrap(), 0);

        let channel = Channel::with_transport(addr, transport);
        let response = channel.unary("/after", Metadata::new(), None).await.unwrap();
        assert!(response.is_ok());
        assert_eq!(server.calls_served(), 1);

        server.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_oversized_response_is_reported() {
        let transport = Transport::new(TransportConfig {
            kind: TransportKind::Loopback,
            max_frame_size: 256,
            ..TransportConfig::default()
        });
        let server = Server::with_transport("big:0", transport.clone());
        let handle = spawn_server(&server, |request: RequestHandler| async move {
            request
                .receive_message(Metadata::from([("a", "Apple")]), |_| {})
                .await?;
            request
                .send_response(
                    Some(Bytes::from(vec![b'x'; 1024])),
                    status::OK,
                    "OK",
                    Metadata::new(),
                )
                .await?;
            Ok(())
        });

        let addr = server.listening().await.unwrap();
        let channel = Channel::with_transport(addr, transport);
        let response = channel.unary("/big", Metadata::new(), None).await.unwrap();

        assert_eq!(response.status_code, status::UNKNOWN);
        assert!(response.status_message.contains("exceeds limit"));
        assert_eq!(response.initial_metadata.unwrap().get("a"), Some("Apple"));

        server.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_expiry_applies_before_server_finalizes() {
        let (server_end, mut client_end) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(Box::new(server_end) as BoxStream);
        let slot = Arc::new(CallSlot {
            expired: AtomicBool::new(false),
            exchange: tokio::sync::Mutex::new(Exchange {
                reader: Some(reader),
                writer,
                stage: Stage::MessageReceived,
                max_frame_size: 1024,
            }),
        });
        let request = RequestHandler {
            host: "host".to_string(),
            method: "/late".to_string(),
            request_metadata: Metadata::new(),
            slot: slot.clone(),
        };

        // The escaped handle queues on the lock while the invocation ends
        let guard = slot.exchange.lock().await;
        let late = tokio::spawn(async move {
            request
                .send_response(None, status::OK, "OK", Metadata::new())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        slot.expired.store(true, Ordering::SeqCst);
        drop(guard);

        assert!(matches!(late.await.unwrap(), Err(SendError::Expired)));
        assert_eq!(slot.exchange.lock().await.stage, Stage::MessageReceived);

        drop(slot);
        let mut buf = Vec::new();
        client_end.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }
}
