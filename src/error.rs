//! Error types for the RPC exchange layer

use thiserror::Error;

/// Metadata accessor called with an index outside `[0, count)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("metadata index {index} out of range (count {count})")]
pub struct IndexOutOfRange {
    pub index: usize,
    pub count: usize,
}

/// Errors from the transport layer (connect, bind, read, write)
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no listener at {0}")]
    Unreachable(String),

    #[error("address {0} already in use")]
    AddressInUse(String),

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("connection closed by peer")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors while encoding or decoding wire frames
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("encode failed: {0}")]
    Encode(#[source] bincode::Error),

    #[error("decode failed: {0}")]
    Decode(#[source] bincode::Error),

    #[error("unexpected frame: expected {expected}, got {got}")]
    UnexpectedFrame {
        expected: &'static str,
        got: &'static str,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Transport(TransportError::Closed)
        } else {
            Self::Transport(TransportError::Io(e))
        }
    }
}

/// `Call::start` failures; the completion callback is never invoked
#[derive(Debug, Error)]
pub enum StartError {
    #[error("call already started")]
    AlreadyStarted,

    #[error("target unreachable: {0}")]
    Unreachable(#[source] TransportError),

    #[error("request serialization failed: {0}")]
    Serialization(#[source] ProtocolError),

    #[error("call dropped before completion")]
    Dropped,
}

impl From<ProtocolError> for StartError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Transport(t) => Self::Unreachable(t),
            other => Self::Serialization(other),
        }
    }
}

/// `RequestHandler::receive_message` failures
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("message already received")]
    AlreadyReceived,

    #[error("request handler used after its invocation ended")]
    Expired,

    #[error("receive failed: {0}")]
    Protocol(#[from] ProtocolError),
}

/// `RequestHandler::send_response` failures
#[derive(Debug, Error)]
pub enum SendError {
    #[error("receive_message must be called before send_response")]
    MessageNotReceived,

    #[error("response already sent")]
    AlreadyCompleted,

    #[error("request handler used after its invocation ended")]
    Expired,

    #[error("send failed: {0}")]
    Protocol(#[from] ProtocolError),
}

/// `Server::run` failures
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("bind to {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: TransportError,
    },

    #[error("server stopped before listening")]
    Stopped,
}
