// Licensed under the MIT license OR Apache 2.0
//! The wire protocol: a tagged union of five frame variants, length-delimited
//! and JSON-encoded onto the underlying RPC stream.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::TunnelError;

/// Nonce minted by the client to correlate a DIAL_REQ with its DIAL_RSP, before
/// a connection id exists.
pub type Nonce = u64;

/// Connection id minted by the server in a DIAL_RSP, identifying a virtual
/// connection for the remainder of its lifetime.
pub type ConnectionId = u64;

/// A single frame exchanged over the tunnel's underlying RPC stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
  DialRequest {
    protocol: String,
    address: String,
    nonce: Nonce,
  },
  DialResponse {
    nonce: Nonce,
    connect_id: ConnectionId,
    error: Option<String>,
  },
  Data {
    connection_id: ConnectionId,
    data: Vec<u8>,
  },
  CloseRequest {
    connection_id: ConnectionId,
  },
  CloseResponse {
    connection_id: ConnectionId,
    error: Option<String>,
  },
}

/// Length-delimits frames on the wire and JSON-encodes their contents.
///
/// Unknown or malformed payloads surface as [`TunnelError::Protocol`], which the
/// serve loop treats as fatal to the tunnel.
pub struct FrameCodec {
  inner: LengthDelimitedCodec,
}

impl FrameCodec {
  pub fn new() -> Self {
    Self {
      inner: LengthDelimitedCodec::new(),
    }
  }
}

impl Default for FrameCodec {
  fn default() -> Self {
    Self::new()
  }
}

impl Decoder for FrameCodec {
  type Item = Frame;
  type Error = TunnelError;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
    match self.inner.decode(src)? {
      None => Ok(None),
      Some(bytes) => {
        let frame = serde_json::from_slice(&bytes)
          .map_err(|e| TunnelError::Protocol(format!("malformed frame: {}", e)))?;
        Ok(Some(frame))
      }
    }
  }
}

impl Encoder<Frame> for FrameCodec {
  type Error = TunnelError;

  fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
    let payload = serde_json::to_vec(&item)
      .map_err(|e| TunnelError::Protocol(format!("failed to encode frame: {}", e)))?;
    self.inner.encode(Bytes::from(payload), dst)?;
    Ok(())
  }
}

/// Type-erased half of the underlying transport stream.
///
/// The transport itself (TLS dialing, credentials, stream establishment) is an
/// external collaborator; boxing it here lets the rest of the crate stay
/// non-generic over the concrete transport type.
pub type BoxedAsyncRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedAsyncWrite = Box<dyn AsyncWrite + Send + Unpin>;

pub type FrameReader = FramedRead<BoxedAsyncRead, FrameCodec>;
pub type FrameWriter = FramedWrite<BoxedAsyncWrite, FrameCodec>;
