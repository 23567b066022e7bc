// Licensed under the MIT license OR Apache 2.0
//! A client library for dialing multiplexed virtual connections over a
//! single tunneled RPC stream.
//!
//! A [`Tunnel`] owns one underlying transport stream and a serve loop that
//! demultiplexes it into any number of independent [`Connection`]s, each
//! addressed by a server-minted connection id. Callers open connections with
//! [`Tunnel::dial`] or [`Tunnel::dial_context`] and otherwise treat a
//! [`Connection`] like any other async byte stream.

mod connection;
mod error;
mod frame;
mod registries;
mod serve;
mod transport;
mod tunnel;

pub use connection::{Connection, CLOSE_TIMEOUT};
pub use error::TunnelError;
pub use frame::{BoxedAsyncRead, BoxedAsyncWrite, ConnectionId, Frame, FrameCodec, Nonce};
pub use transport::{TcpConnector, TransportConnector};
pub use tunnel::{create_single_use_tunnel, create_single_use_tunnel_with_context, Tunnel};

pub use tokio_util::sync::CancellationToken;
