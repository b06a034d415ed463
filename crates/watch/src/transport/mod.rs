//! Message channels the protocol engines run over.
//!
//! A transport moves whole [`Message`]s: framing and JSON encoding stay
//! behind this boundary. Methods take `&self` so a liveness probe never waits
//! behind an in-flight `recv`. Callers must not run two `send`s or two
//! `recv`s concurrently on the same connection.

mod unix;

use std::path::Path;

use async_trait::async_trait;
use ibp_protocol::Message;

use crate::error::TransportError;

pub use unix::{UnixSocketServer, UnixSocketTransport};

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &Message) -> Result<(), TransportError>;

    /// Waits for exactly one message. Fails with [`TransportError::Closed`]
    /// once the peer hangs up.
    async fn recv(&self) -> Result<Message, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Server role: binds an address and accepts a single peer.
#[async_trait]
pub trait ServerTransport: Transport {
    /// Binds without waiting for a peer.
    fn serve(&self, address: &Path) -> Result<(), TransportError>;

    /// Waits for one peer. Fails with [`TransportError::NotAccepted`] when the
    /// transport is closed (or was never bound) before anyone connects.
    async fn accept(&self) -> Result<(), TransportError>;

    fn has_connection(&self) -> bool;
}
