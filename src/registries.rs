// Licensed under the MIT license OR Apache 2.0
//! The two registries the serve loop consults: pending dials awaiting a
//! DIAL_RSP, and live connections awaiting DATA/CLOSE_RSP frames.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;
use tokio::sync::oneshot;

use crate::connection::ConnectionShared;
use crate::error::TunnelError;
use crate::frame::{ConnectionId, Nonce};

/// Resolution of a DIAL_REQ: either the freshly minted connection or the
/// rejection reason the remote sent back in DIAL_RSP.
pub(crate) type DialOutcome = Result<Arc<ConnectionShared>, TunnelError>;

#[derive(Default)]
struct Inner {
  pending: HashMap<Nonce, oneshot::Sender<DialOutcome>>,
  connections: HashMap<ConnectionId, Arc<ConnectionShared>>,
  closed: bool,
}

/// Guards both maps behind a single lock, held only across map operations and
/// never across an `.await` or I/O of any kind.
pub(crate) struct Registries {
  inner: Mutex<Inner>,
}

impl Registries {
  pub(crate) fn new() -> Self {
    Self {
      inner: Mutex::new(Inner::default()),
    }
  }

  /// Mints a fresh nonce with no collision against a currently pending dial
  /// and registers `tx` under it.
  ///
  /// Fails with [`TunnelError::TunnelClosed`] if `drain` has already run —
  /// checked under the same lock as the drain itself, so a dial can never
  /// be inserted into a registry nobody will ever drain again.
  pub(crate) fn insert_pending(
    &self,
    tx: oneshot::Sender<DialOutcome>,
  ) -> Result<Nonce, TunnelError> {
    let mut guard = self.inner.lock().expect("registries lock poisoned");
    if guard.closed {
      return Err(TunnelError::TunnelClosed);
    }
    loop {
      let nonce: Nonce = rand::thread_rng().gen();
      if let Entry::Vacant(slot) = guard.pending.entry(nonce) {
        slot.insert(tx);
        return Ok(nonce);
      }
    }
  }

  /// Removes a pending dial the caller is abandoning (cancellation race).
  /// Returns the sender back to the caller so it can still observe whatever
  /// the serve loop deposited in the same instant, rather than losing it.
  pub(crate) fn abandon_pending(&self, nonce: Nonce) -> Option<oneshot::Sender<DialOutcome>> {
    self
      .inner
      .lock()
      .expect("registries lock poisoned")
      .pending
      .remove(&nonce)
  }

  /// Removes and returns the pending dial's sender, if still present. Used by
  /// the serve loop on DIAL_RSP receipt; absence means the caller already
  /// abandoned it, so the outcome is simply dropped.
  pub(crate) fn take_pending(&self, nonce: Nonce) -> Option<oneshot::Sender<DialOutcome>> {
    self
      .inner
      .lock()
      .expect("registries lock poisoned")
      .pending
      .remove(&nonce)
  }

  /// Registers a newly dialed connection under the server-minted id.
  ///
  /// A duplicate id from the remote is a protocol violation, not a panic: the
  /// caller turns this into a fatal [`TunnelError::Protocol`] for the tunnel.
  pub(crate) fn register_connection(
    &self,
    id: ConnectionId,
    conn: Arc<ConnectionShared>,
  ) -> Result<(), TunnelError> {
    let mut guard = self.inner.lock().expect("registries lock poisoned");
    match guard.connections.entry(id) {
      Entry::Vacant(slot) => {
        slot.insert(conn);
        Ok(())
      }
      Entry::Occupied(_) => Err(TunnelError::Protocol(format!(
        "duplicate connection id {} from remote",
        id
      ))),
    }
  }

  pub(crate) fn lookup_connection(&self, id: ConnectionId) -> Option<Arc<ConnectionShared>> {
    self
      .inner
      .lock()
      .expect("registries lock poisoned")
      .connections
      .get(&id)
      .cloned()
  }

  pub(crate) fn remove_connection(&self, id: ConnectionId) -> Option<Arc<ConnectionShared>> {
    self
      .inner
      .lock()
      .expect("registries lock poisoned")
      .connections
      .remove(&id)
  }

  /// Drains both maps for teardown and marks the registries closed, under the
  /// same lock, so no later `insert_pending` can land an entry nobody will
  /// ever drain again. Pending dial senders are returned so the caller can
  /// fail them with [`TunnelError::TunnelClosed`]; connections are returned
  /// so the caller can force-close each one. Idempotent: draining twice is
  /// harmless and returns empty vectors the second time.
  pub(crate) fn drain(
    &self,
  ) -> (
    Vec<oneshot::Sender<DialOutcome>>,
    Vec<Arc<ConnectionShared>>,
  ) {
    let mut guard = self.inner.lock().expect("registries lock poisoned");
    guard.closed = true;
    let pending = guard.pending.drain().map(|(_, tx)| tx).collect();
    let connections = guard.connections.drain().map(|(_, c)| c).collect();
    (pending, connections)
  }
}
