pub mod client;
pub mod error;
pub mod metadata;
pub mod protocol;
pub mod server;
pub mod status;
pub mod sync;
pub mod transport;

pub use client::{Call, CallState, CallType, Channel, Response};
pub use error::{
    IndexOutOfRange, ProtocolError, ReceiveError, SendError, ServerError, StartError, TransportError,
};
pub use metadata::Metadata;
pub use server::{RequestHandler, Server};
pub use sync::Rendezvous;
pub use transport::{Transport, TransportConfig, TransportKind};
