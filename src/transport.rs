// Licensed under the MIT license OR Apache 2.0
//! Establishing the underlying byte stream a tunnel runs over.
//!
//! The tunnel itself only needs a split, boxed `AsyncRead + AsyncWrite` pair;
//! how that pair is obtained (TCP dial, TLS handshake, QUIC stream open, a
//! unix socket, an in-process duplex for tests) is the connector's concern.

use futures::future::{BoxFuture, FutureExt};
use tokio::net::TcpStream;

use crate::frame::{BoxedAsyncRead, BoxedAsyncWrite};

/// Produces the transport stream a tunnel will run its frame codec over.
///
/// Implementations report setup failures as an opaque [`anyhow::Error`]; the
/// tunnel wraps it in [`crate::error::TunnelError::TransportSetup`] without
/// needing to know anything about the transport's own error types.
pub trait TransportConnector: Send + Sync {
  fn connect(&self) -> BoxFuture<'_, anyhow::Result<(BoxedAsyncRead, BoxedAsyncWrite)>>;
}

/// Dials a plain TCP connection to a fixed address, disabling Nagle's
/// algorithm so small frames (in particular DATA frames on an interactive
/// connection) aren't delayed waiting to coalesce.
pub struct TcpConnector {
  addr: String,
}

impl TcpConnector {
  pub fn new(addr: impl Into<String>) -> Self {
    Self { addr: addr.into() }
  }
}

impl TransportConnector for TcpConnector {
  fn connect(&self) -> BoxFuture<'_, anyhow::Result<(BoxedAsyncRead, BoxedAsyncWrite)>> {
    async move {
      let stream = TcpStream::connect(&self.addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect to {}: {}", self.addr, e))?;
      stream.set_nodelay(true)?;
      let (read, write) = tokio::io::split(stream);
      let read: BoxedAsyncRead = Box::new(read);
      let write: BoxedAsyncWrite = Box::new(write);
      Ok((read, write))
    }
    .boxed()
  }
}
