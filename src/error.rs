// Licensed under the MIT license OR Apache 2.0

/// Errors surfaced by the tunnel facade, virtual connections, and the frame codec.
///
/// A `TunnelError` returned from any operation after the serve loop has exited is
/// always [`TunnelError::TunnelClosed`], regardless of what originally killed the
/// tunnel; the original cause is only logged, not threaded through every waiter.
#[derive(thiserror::Error, Debug)]
pub enum TunnelError {
  #[error("failed to establish the underlying transport")]
  TransportSetup(#[source] anyhow::Error),

  #[error("tunnel is closed")]
  TunnelClosed,

  #[error("dial rejected by remote: {0}")]
  DialRejected(String),

  #[error("dial cancelled by caller before a response arrived")]
  DialCancelled,

  #[error("connection is closed")]
  ConnectionClosed,

  #[error("close timed out waiting for remote acknowledgement")]
  CloseTimeout,

  #[error("protocol violation: {0}")]
  Protocol(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}
