// Licensed under the MIT license OR Apache 2.0
//! The serve loop: the single reader of the tunnel's inbound frame stream.
//!
//! Exactly one task ever calls `FrameReader::next()`; every other task only
//! ever mutates the registries or sends frames, so the dispatch below is the
//! sole place DIAL_RSP, DATA, and CLOSE_RSP frames are handled.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::connection::ConnectionShared;
use crate::error::TunnelError;
use crate::frame::{Frame, FrameReader, FrameWriter};
use crate::registries::Registries;

pub(crate) struct ServeLoop {
  reader: FrameReader,
  write: Arc<tokio::sync::Mutex<FrameWriter>>,
  registries: Arc<Registries>,
  done: CancellationToken,
}

impl ServeLoop {
  pub(crate) fn new(
    reader: FrameReader,
    write: Arc<tokio::sync::Mutex<FrameWriter>>,
    registries: Arc<Registries>,
    done: CancellationToken,
  ) -> Self {
    Self {
      reader,
      write,
      registries,
      done,
    }
  }

  /// Runs until the stream ends, a protocol violation occurs, or `done` is
  /// cancelled from outside. Always tears down the registries on exit, no
  /// matter which of those three caused it.
  pub(crate) async fn run(mut self) {
    let outcome = self.serve_until_done().await;
    if let Err(ref e) = outcome {
      tracing::warn!(error = %e, "tunnel serve loop exiting on error");
    } else {
      tracing::debug!("tunnel serve loop exiting cleanly");
    }
    self.done.cancel();
    self.teardown();
  }

  async fn serve_until_done(&mut self) -> Result<(), TunnelError> {
    loop {
      tokio::select! {
        biased;
        _ = self.done.cancelled() => return Ok(()),
        frame = self.reader.next() => {
          match frame {
            None => return Ok(()),
            Some(Err(e)) => return Err(e),
            Some(Ok(frame)) => self.dispatch(frame).await?,
          }
        }
      }
    }
  }

  async fn dispatch(&self, frame: Frame) -> Result<(), TunnelError> {
    match frame {
      Frame::DialResponse {
        nonce,
        connect_id,
        error,
      } => self.handle_dial_response(nonce, connect_id, error).await,
      Frame::Data {
        connection_id,
        data,
      } => self.handle_data(connection_id, data),
      Frame::CloseResponse {
        connection_id,
        error,
      } => self.handle_close_response(connection_id, error),
      Frame::CloseRequest { connection_id } => self.handle_close_request(connection_id).await,
      Frame::DialRequest { .. } => Err(TunnelError::Protocol(
        "received a DIAL_REQ on a client-side tunnel".into(),
      )),
    }
  }

  async fn handle_dial_response(
    &self,
    nonce: u64,
    connect_id: u64,
    error: Option<String>,
  ) -> Result<(), TunnelError> {
    let Some(tx) = self.registries.take_pending(nonce) else {
      // Caller abandoned this dial already. If the remote still minted a
      // connection for it, the server would otherwise leak its upstream
      // dial, so close it out on the caller's behalf.
      if error.is_none() {
        let _ = crate::connection::send_frame(
          &self.write,
          Frame::CloseRequest {
            connection_id: connect_id,
          },
        )
        .await;
      }
      return Ok(());
    };
    let outcome = match error {
      Some(reason) => Err(TunnelError::DialRejected(reason)),
      None => {
        let conn = ConnectionShared::new(connect_id, self.write.clone(), self.done.child_token());
        self.registries.register_connection(connect_id, conn.clone())?;
        Ok(conn)
      }
    };
    let _ = tx.send(outcome);
    Ok(())
  }

  fn handle_data(&self, connection_id: u64, data: Vec<u8>) -> Result<(), TunnelError> {
    match self.registries.lookup_connection(connection_id) {
      Some(conn) => {
        conn.push_data(data);
        Ok(())
      }
      None => {
        // Remote may race a CLOSE_RSP against trailing DATA; not a protocol error.
        tracing::trace!(connection_id, "data for unknown or already-closed connection");
        Ok(())
      }
    }
  }

  fn handle_close_response(
    &self,
    connection_id: u64,
    error: Option<String>,
  ) -> Result<(), TunnelError> {
    let Some(conn) = self.registries.remove_connection(connection_id) else {
      return Ok(());
    };
    let result = match error {
      Some(reason) => Err(TunnelError::Protocol(reason)),
      None => Ok(()),
    };
    conn.complete_close(result);
    Ok(())
  }

  /// The remote may also initiate a close on a connection it dialed for us to
  /// serve; reciprocate with our own CLOSE_RSP and tear the connection down.
  async fn handle_close_request(&self, connection_id: u64) -> Result<(), TunnelError> {
    if let Some(conn) = self.registries.remove_connection(connection_id) {
      conn.force_close();
    }
    crate::connection::send_frame(
      &self.write,
      Frame::CloseResponse {
        connection_id,
        error: None,
      },
    )
    .await
  }

  fn teardown(&self) {
    let (pending, connections) = self.registries.drain();
    for tx in pending {
      let _ = tx.send(Err(TunnelError::TunnelClosed));
    }
    for conn in connections {
      conn.force_close();
    }
  }
}

pub(crate) fn spawn(
  reader: FrameReader,
  write: Arc<tokio::sync::Mutex<FrameWriter>>,
  registries: Arc<Registries>,
  done: CancellationToken,
) {
  let loop_ = ServeLoop::new(reader, write, registries, done);
  tokio::spawn(loop_.run().instrument(tracing::debug_span!("tunnel_serve")));
}
