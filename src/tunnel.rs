// Licensed under the MIT license OR Apache 2.0
//! The public tunnel facade: establishes the transport, spawns the serve
//! loop, and exposes `dial` as the sole way to open a virtual connection.

use std::sync::Arc;

use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::TunnelError;
use crate::frame::{Frame, FrameCodec};
use crate::registries::Registries;
use crate::serve;
use crate::transport::TransportConnector;

struct TunnelInner {
  write: Arc<AsyncMutex<crate::frame::FrameWriter>>,
  registries: Arc<Registries>,
  done: CancellationToken,
}

/// A single multiplexed connection to a remote tunnel server.
///
/// Cloning a `Tunnel` is cheap; every clone shares the same underlying
/// transport, registries, and lifetime.
#[derive(Clone)]
pub struct Tunnel {
  inner: Arc<TunnelInner>,
}

impl Tunnel {
  /// Dials `protocol`/`address` through the remote, using the tunnel's own
  /// lifetime as the only cancellation source. Equivalent to
  /// [`Tunnel::dial_context`] with a context tied to nothing but the tunnel.
  pub async fn dial(&self, protocol: &str, address: &str) -> Result<Connection, TunnelError> {
    self
      .dial_context(protocol, address, &CancellationToken::new())
      .await
  }

  /// Dials `protocol`/`address`, also resolving early with
  /// [`TunnelError::DialCancelled`] if `cancellation` fires before the remote
  /// answers. May be called any number of times over a tunnel's lifetime,
  /// including concurrently.
  pub async fn dial_context(
    &self,
    protocol: &str,
    address: &str,
    cancellation: &CancellationToken,
  ) -> Result<Connection, TunnelError> {
    if self.inner.done.is_cancelled() {
      return Err(TunnelError::TunnelClosed);
    }

    let (tx, mut rx) = oneshot::channel();
    let nonce = self.inner.registries.insert_pending(tx)?;

    let send_result = crate::connection::send_frame(
      &self.inner.write,
      Frame::DialRequest {
        protocol: protocol.to_string(),
        address: address.to_string(),
        nonce,
      },
    )
    .await;

    if let Err(e) = send_result {
      self.inner.registries.abandon_pending(nonce);
      return Err(e);
    }

    tokio::select! {
      biased;
      outcome = &mut rx => self.resolve_dial(outcome),
      _ = cancellation.cancelled() => self.resolve_cancelled_dial(nonce, rx).await,
    }
  }

  fn resolve_dial(
    &self,
    outcome: Result<crate::registries::DialOutcome, oneshot::error::RecvError>,
  ) -> Result<Connection, TunnelError> {
    match outcome {
      Ok(Ok(shared)) => Ok(Connection::new(shared)),
      Ok(Err(e)) => Err(e),
      Err(_recv_error) => Err(TunnelError::TunnelClosed),
    }
  }

  /// Called when the caller's cancellation fired before `rx` resolved. Races
  /// against the serve loop: if we can still remove the pending slot, nobody
  /// beat us to it and the dial is genuinely cancelled. Otherwise the serve
  /// loop already took it and deposited an outcome, which we must still
  /// collect by awaiting `rx` directly rather than re-entering `select!` (the
  /// cancellation future would just resolve again immediately).
  async fn resolve_cancelled_dial(
    &self,
    nonce: u64,
    rx: oneshot::Receiver<crate::registries::DialOutcome>,
  ) -> Result<Connection, TunnelError> {
    if self.inner.registries.abandon_pending(nonce).is_some() {
      return Err(TunnelError::DialCancelled);
    }
    self.resolve_dial(rx.await)
  }

  /// A [`CancellationToken`] that fires once this tunnel is done: the
  /// transport failed, the remote closed the stream, or an external context
  /// passed to [`create_single_use_tunnel_with_context`] was cancelled.
  pub fn done(&self) -> CancellationToken {
    self.inner.done.clone()
  }

  pub fn is_done(&self) -> bool {
    self.inner.done.is_cancelled()
  }
}

/// Establishes a tunnel whose lifetime is entirely its own: it runs until the
/// transport fails or the remote closes the stream.
pub async fn create_single_use_tunnel(
  connector: &dyn TransportConnector,
) -> Result<Tunnel, TunnelError> {
  create_single_use_tunnel_with_context(connector, CancellationToken::new()).await
}

/// Establishes a tunnel whose lifetime is additionally bound to `context`:
/// cancelling `context` tears the tunnel down just as a transport failure
/// would. The inverse does not hold — the tunnel's own `done()` token is a
/// child of `context`, so the tunnel finishing on its own never cancels the
/// caller's context.
pub async fn create_single_use_tunnel_with_context(
  connector: &dyn TransportConnector,
  context: CancellationToken,
) -> Result<Tunnel, TunnelError> {
  let (read, write) = connector
    .connect()
    .await
    .map_err(TunnelError::TransportSetup)?;

  let reader = FramedRead::new(read, FrameCodec::new());
  let writer = FramedWrite::new(write, FrameCodec::new());
  let write = Arc::new(AsyncMutex::new(writer));
  let registries = Arc::new(Registries::new());
  let done = context.child_token();

  serve::spawn(reader, write.clone(), registries.clone(), done.clone());

  Ok(Tunnel {
    inner: Arc::new(TunnelInner {
      write,
      registries,
      done,
    }),
  })
}
