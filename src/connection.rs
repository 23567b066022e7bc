// Licensed under the MIT license OR Apache 2.0
//! Virtual connections: per-dial byte-stream endpoints multiplexed over a tunnel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::error::TunnelError;
use crate::frame::{ConnectionId, Frame, FrameWriter};

/// How long [`Connection::close`] waits for a CLOSE_RSP before giving up.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends a single frame on the shared stream.
///
/// The stream has exactly one sender discipline: every caller acquires this
/// lock for the duration of a single `send`, so frames are never interleaved
/// mid-write. The lock is never held across anything but this call.
pub(crate) async fn send_frame(
  write: &Arc<AsyncMutex<FrameWriter>>,
  frame: Frame,
) -> Result<(), TunnelError> {
  let mut guard = write.lock().await;
  guard.send(frame).await
}

struct ReadState {
  rx: mpsc::UnboundedReceiver<Bytes>,
  leftover: Option<Bytes>,
}

/// Shared state for a virtual connection, reachable both from the public
/// [`Connection`] handle and from the serve loop via the connection registry.
pub(crate) struct ConnectionShared {
  id: ConnectionId,
  write: Arc<AsyncMutex<FrameWriter>>,
  done: CancellationToken,
  data_tx: StdMutex<Option<mpsc::UnboundedSender<Bytes>>>,
  read_state: AsyncMutex<ReadState>,
  close_completion: StdMutex<Option<oneshot::Sender<Result<(), TunnelError>>>>,
  close_started: AtomicBool,
}

impl ConnectionShared {
  pub(crate) fn new(
    id: ConnectionId,
    write: Arc<AsyncMutex<FrameWriter>>,
    done: CancellationToken,
  ) -> Arc<Self> {
    let (tx, rx) = mpsc::unbounded_channel();
    Arc::new(Self {
      id,
      write,
      done,
      data_tx: StdMutex::new(Some(tx)),
      read_state: AsyncMutex::new(ReadState { rx, leftover: None }),
      close_completion: StdMutex::new(None),
      close_started: AtomicBool::new(false),
    })
  }

  pub(crate) fn id(&self) -> ConnectionId {
    self.id
  }

  /// Enqueues bytes from an inbound DATA frame. Silently dropped if nobody is
  /// listening any more (connection closed locally without draining).
  pub(crate) fn push_data(&self, data: Vec<u8>) {
    let guard = self.data_tx.lock().expect("data_tx lock poisoned");
    if let Some(tx) = guard.as_ref() {
      let _ = tx.send(Bytes::from(data));
    }
  }

  /// Called by the serve loop on CLOSE_RSP receipt: delivers the drain-then-EOF
  /// signal to readers and resolves any in-flight `close()` call exactly once.
  pub(crate) fn complete_close(&self, result: Result<(), TunnelError>) {
    *self.data_tx.lock().expect("data_tx lock poisoned") = None;
    if let Some(sender) = self
      .close_completion
      .lock()
      .expect("close_completion lock poisoned")
      .take()
    {
      let _ = sender.send(result);
    }
  }

  /// Called during tunnel teardown: forces every reader to observe end-of-stream
  /// and resolves any outstanding close-completion so nothing leaks.
  pub(crate) fn force_close(&self) {
    self.complete_close(Err(TunnelError::TunnelClosed));
  }

  /// Called when a local `close()` call gives up after [`CLOSE_TIMEOUT`]: readers
  /// unblock with end-of-stream, but the completion slot is cleared without being
  /// resolved again, since the timed-out caller already has its answer.
  fn force_close_for_timeout(&self) {
    *self.data_tx.lock().expect("data_tx lock poisoned") = None;
    *self
      .close_completion
      .lock()
      .expect("close_completion lock poisoned") = None;
  }

  async fn send_close_request(&self) -> Result<(), TunnelError> {
    send_frame(
      &self.write,
      Frame::CloseRequest {
        connection_id: self.id,
      },
    )
    .await
  }
}

/// A logical TCP-like byte stream multiplexed over a tunnel.
///
/// `Connection` is a cheap, cloneable handle: all clones observe the same
/// underlying data queue and closed state.
#[derive(Clone)]
pub struct Connection {
  shared: Arc<ConnectionShared>,
}

impl Connection {
  pub(crate) fn new(shared: Arc<ConnectionShared>) -> Self {
    Self { shared }
  }

  pub(crate) fn shared(&self) -> &Arc<ConnectionShared> {
    &self.shared
  }

  /// The server-assigned id for this connection.
  pub fn id(&self) -> ConnectionId {
    self.shared.id()
  }

  /// Dequeues bytes into `buf`, blocking until bytes are available, the
  /// connection closes (returns `Ok(0)`), or the tunnel is done (`Ok(0)`).
  ///
  /// A read may span multiple previously-enqueued DATA frames; bytes already
  /// queued before a close are always delivered before end-of-stream.
  pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TunnelError> {
    if buf.is_empty() {
      return Ok(0);
    }
    let mut state = self.shared.read_state.lock().await;
    loop {
      if let Some(chunk) = state.leftover.take() {
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
          state.leftover = Some(chunk.slice(n..));
        }
        return Ok(n);
      }
      tokio::select! {
        biased;
        maybe_chunk = state.rx.recv() => {
          match maybe_chunk {
            Some(chunk) => state.leftover = Some(chunk),
            None => return Ok(0),
          }
        }
        _ = self.shared.done.cancelled() => return Ok(0),
      }
    }
  }

  /// Wraps `data` in a single DATA frame and sends it. On success `n` always
  /// equals `data.len()`; a single call never produces more than one frame.
  pub async fn write(&self, data: &[u8]) -> Result<usize, TunnelError> {
    if self.shared.close_started.load(Ordering::Acquire) {
      return Err(TunnelError::ConnectionClosed);
    }
    if self.shared.done.is_cancelled() {
      return Err(TunnelError::TunnelClosed);
    }
    send_frame(
      &self.shared.write,
      Frame::Data {
        connection_id: self.shared.id,
        data: data.to_vec(),
      },
    )
    .await?;
    Ok(data.len())
  }

  /// Idempotent close. The first call sends CLOSE_REQ and waits up to
  /// [`CLOSE_TIMEOUT`] for CLOSE_RSP; later calls return `Ok(())` immediately
  /// without further side effects, regardless of how the first call resolved.
  pub async fn close(&self) -> Result<(), TunnelError> {
    if self.shared.close_started.swap(true, Ordering::AcqRel) {
      return Ok(());
    }

    let (tx, rx) = oneshot::channel();
    *self
      .shared
      .close_completion
      .lock()
      .expect("close_completion lock poisoned") = Some(tx);

    if let Err(e) = self.shared.send_close_request().await {
      self.shared.force_close();
      return Err(e);
    }

    match tokio::time::timeout(CLOSE_TIMEOUT, rx).await {
      Ok(Ok(result)) => result,
      Ok(Err(_recv_error)) => Err(TunnelError::TunnelClosed),
      Err(_elapsed) => {
        self.shared.force_close_for_timeout();
        Err(TunnelError::CloseTimeout)
      }
    }
  }
}

impl std::fmt::Debug for Connection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connection")
      .field("id", &self.shared.id)
      .finish_non_exhaustive()
  }
}
