//! Wire protocol for unary calls
//!
//! Every frame is a big-endian `u32` length followed by a bincode-encoded
//! [`Frame`]. A call is exactly four frames:
//!
//! ```text
//! client -> server   Headers, Message
//! server -> client   InitialMetadata, Status
//! ```
//!
//! The server may skip `InitialMetadata` when a call fails before the
//! handler read the request.

use crate::error::ProtocolError;
use crate::metadata::Metadata;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound on a single encoded frame
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// A single protocol frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Start of a call: routing information and request metadata
    Headers {
        host: String,
        method: String,
        metadata: Metadata,
    },
    /// The request payload
    Message(Option<Bytes>),
    /// Server metadata sent before the reply payload
    InitialMetadata(Metadata),
    /// Final reply: payload, status and trailing metadata
    Status(CallStatus),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Headers { .. } => "Headers",
            Frame::Message(_) => "Message",
            Frame::InitialMetadata(_) => "InitialMetadata",
            Frame::Status(_) => "Status",
        }
    }
}

/// Final status of a call as written by the server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallStatus {
    pub message: Option<Bytes>,
    pub code: i32,
    pub status_message: String,
    pub trailing_metadata: Metadata,
}

/// Encode a frame, enforcing the size limit
pub fn encode(frame: &Frame, max_frame_size: usize) -> Result<Vec<u8>, ProtocolError> {
    let body = bincode::serialize(frame).map_err(ProtocolError::Encode)?;
    if body.len() > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            limit: max_frame_size,
        });
    }
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Write one frame
pub async fn write_frame<W>(
    writer: &mut W,
    frame: &Frame,
    max_frame_size: usize,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let buf = encode(frame, max_frame_size)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u32().await? as usize;
    if len > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            limit: max_frame_size,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body).map_err(ProtocolError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_frames_in_order() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let headers = Frame::Headers {
            host: "foo.test.google.fr".to_string(),
            method: "/hello".to_string(),
            metadata: Metadata::from([("x", "xylophone")]),
        };
        let message = Frame::Message(Some(Bytes::from_static(b"hello, server!")));

        write_frame(&mut client, &headers, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        write_frame(&mut client, &message, DEFAULT_MAX_FRAME_SIZE).await.unwrap();

        assert_eq!(read_frame(&mut server, DEFAULT_MAX_FRAME_SIZE).await.unwrap(), headers);
        assert_eq!(read_frame(&mut server, DEFAULT_MAX_FRAME_SIZE).await.unwrap(), message);
    }

    #[test]
    fn test_encode_rejects_oversized_frame() {
        let frame = Frame::Message(Some(Bytes::from(vec![0u8; 128])));
        let err = encode(&frame, 64).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { limit: 64, .. }));
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_length() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(1_000_000u32).to_be_bytes()).await.unwrap();

        let err = read_frame(&mut server, 1024).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size: 1_000_000, .. }));
    }

    #[tokio::test]
    async fn test_read_after_close() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = read_frame(&mut server, 1024).await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Transport(crate::error::TransportError::Closed)
        ));
    }
}
