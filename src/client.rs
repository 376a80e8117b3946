//! RPC client implementation
//!
//! A [`Channel`] names a remote endpoint and creates single-use [`Call`]s.
//! Starting a call writes the request and returns; the response is read on
//! a runtime task which then invokes the completion callback exactly once.

use crate::error::{ProtocolError, StartError};
use crate::metadata::Metadata;
use crate::protocol::{self, CallStatus, Frame};
use crate::status;
use crate::transport::{BoxStream, Transport};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

/// Kind of call. Only unary request/response is supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallType {
    Unary,
}

/// Lifecycle of a [`Call`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    Created,
    Started,
    Completed,
    /// `start` failed before the request was sent
    Failed,
}

/// Outcome of a completed call
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status_code: i32,
    pub status_message: String,
    /// Reply payload, `None` if the server sent none
    pub result_data: Option<Bytes>,
    /// Metadata the server sent before its payload
    pub initial_metadata: Option<Metadata>,
    /// Metadata the server sent with its final status
    pub trailing_metadata: Option<Metadata>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status_code == status::OK
    }

    fn from_status(initial_metadata: Option<Metadata>, status: CallStatus) -> Self {
        Self {
            status_code: status.code,
            status_message: status.status_message,
            result_data: status.message,
            initial_metadata,
            trailing_metadata: Some(status.trailing_metadata),
        }
    }

    fn unavailable(initial_metadata: Option<Metadata>, error: &ProtocolError) -> Self {
        Self {
            status_code: status::UNAVAILABLE,
            status_message: error.to_string(),
            result_data: None,
            initial_metadata,
            trailing_metadata: None,
        }
    }
}

/// Client-side handle to a remote endpoint
#[derive(Clone, Debug)]
pub struct Channel {
    address: String,
    host: Option<String>,
    transport: Transport,
}

impl Channel {
    /// Create a channel over TCP. Does not connect.
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_transport(address, Transport::default())
    }

    pub fn with_transport(address: impl Into<String>, transport: Transport) -> Self {
        Self {
            address: address.into(),
            host: None,
            transport,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Virtual host advertised to the server; defaults to the address
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(&self.address)
    }

    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = Some(host.into());
    }

    /// Create an unstarted call to `method`
    pub fn make_call(&self, method: impl Into<String>) -> Call {
        Call {
            address: self.address.clone(),
            host: self.host().to_string(),
            method: method.into(),
            transport: self.transport.clone(),
            state: Arc::new(Mutex::new(CallState::Created)),
        }
    }

    /// Make, start and await a unary call
    pub async fn unary(
        &self,
        method: impl Into<String>,
        metadata: Metadata,
        message: Option<Bytes>,
    ) -> Result<Response, StartError> {
        let call = self.make_call(method);
        let (tx, rx) = oneshot::channel();
        call.start(CallType::Unary, metadata, message, move |response| {
            let _ = tx.send(response);
        })
        .await?;
        rx.await.map_err(|_| StartError::Dropped)
    }
}

/// One client-initiated unary call
#[derive(Debug)]
pub struct Call {
    address: String,
    host: String,
    method: String,
    transport: Transport,
    state: Arc<Mutex<CallState>>,
}

impl Call {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> CallState {
        *self.state.lock()
    }

    /// Send `metadata` and `message` to the server and return once written.
    ///
    /// `completion` runs exactly once, on a runtime worker thread, after the
    /// full response arrived. If this returns an error, `completion` is
    /// dropped without being called.
    pub async fn start<F>(
        &self,
        call_type: CallType,
        metadata: Metadata,
        message: Option<Bytes>,
        completion: F,
    ) -> Result<(), StartError>
    where
        F: FnOnce(Response) + Send + 'static,
    {
        let CallType::Unary = call_type;

        {
            let mut state = self.state.lock();
            if *state != CallState::Created {
                return Err(StartError::AlreadyStarted);
            }
            *state = CallState::Started;
        }

        let stream = match self.send_request(metadata, message).await {
            Ok(stream) => stream,
            Err(e) => {
                *self.state.lock() = CallState::Failed;
                tracing::debug!("Call {} failed to start: {}", self.method, e);
                return Err(e);
            }
        };

        tracing::debug!("Call {} started on {}", self.method, self.address);

        let method = self.method.clone();
        let state = self.state.clone();
        let max_frame_size = self.transport.max_frame_size();
        tokio::spawn(async move {
            let mut initial_metadata = None;
            let response = match read_response(stream, max_frame_size, &mut initial_metadata).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!("Call {} lost its response: {}", method, e);
                    Response::unavailable(initial_metadata, &e)
                }
            };
            tracing::debug!(
                "Call {} completed: status={} message={}",
                method,
                response.status_code,
                response.status_message
            );
            *state.lock() = CallState::Completed;
            completion(response);
        });

        Ok(())
    }

    async fn send_request(
        &self,
        metadata: Metadata,
        message: Option<Bytes>,
    ) -> Result<BoxStream, StartError> {
        let max_frame_size = self.transport.max_frame_size();

        // Encode before connecting so serialization failures touch no network
        let headers = protocol::encode(
            &Frame::Headers {
                host: self.host.clone(),
                method: self.method.clone(),
                metadata,
            },
            max_frame_size,
        )?;
        let body = protocol::encode(&Frame::Message(message), max_frame_size)?;

        let mut stream = self
            .transport
            .connect(&self.address)
            .await
            .map_err(StartError::Unreachable)?;

        let written: std::io::Result<()> = async {
            stream.write_all(&headers).await?;
            stream.write_all(&body).await?;
            stream.flush().await
        }
        .await;
        written.map_err(|e| StartError::from(ProtocolError::from(e)))?;

        Ok(stream)
    }
}

/// Read the server's reply. Initial metadata is stored in `initial_metadata`
/// as soon as it arrives, so it survives a later failure.
async fn read_response(
    mut stream: BoxStream,
    max_frame_size: usize,
    initial_metadata: &mut Option<Metadata>,
) -> Result<Response, ProtocolError> {
    match protocol::read_frame(&mut stream, max_frame_size).await? {
        Frame::InitialMetadata(initial) => {
            *initial_metadata = Some(initial);
            match protocol::read_frame(&mut stream, max_frame_size).await? {
                Frame::Status(status) => Ok(Response::from_status(initial_metadata.take(), status)),
                other => Err(ProtocolError::UnexpectedFrame {
                    expected: "Status",
                    got: other.kind(),
                }),
            }
        }
        Frame::Status(status) => Ok(Response::from_status(None, status)),
        other => Err(ProtocolError::UnexpectedFrame {
            expected: "InitialMetadata",
            got: other.kind(),
        }),
    }
}
