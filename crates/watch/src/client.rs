//! The watcher side of the protocol.
//!
//! An [`IncrementalClient`] connects to a server, negotiates, and then
//! consumes cycles through a [`CycleStream`]. The stream acknowledges every
//! cycle twice: `CYCLE_STARTED` before handing it out and `CYCLE_COMPLETED`
//! once the consumer moves on, stops, or drops the stream.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::Stream;
use ibp_protocol::{
    Capabilities, CapabilityRequest, CycleId, Message, MessageBody, ProtocolVersion, SourceInfoMap,
    TraceFields, WatchScope, DEFAULT_SUPPORTED_VERSIONS, PROTOCOL_SOCKET_ENV,
};
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result, TransportError};
use crate::negotiation;
use crate::transport::{Transport, UnixSocketTransport};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Versions this client accepts. Order does not matter: the server's
    /// preference decides.
    pub supported_versions: Vec<ProtocolVersion>,
    /// Sent in `SUBSCRIBE` on protocol versions that have it.
    pub watch_type: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            supported_versions: DEFAULT_SUPPORTED_VERSIONS.to_vec(),
            watch_type: "sources".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Negotiating,
    CapabilityNegotiating,
    Connected(ProtocolVersion),
}

/// One batch of changes as handed to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleEvent {
    pub cycle_id: CycleId,
    /// `None` for legacy servers and for scopes this build does not know.
    pub scope: Option<WatchScope>,
    pub sources: SourceInfoMap,
    pub trace: TraceFields,
}

pub struct IncrementalClient<T: Transport + 'static = UnixSocketTransport> {
    address: PathBuf,
    options: ClientOptions,
    transport: Option<Arc<T>>,
    version: Option<ProtocolVersion>,
    caps: Option<Capabilities>,
    state: ClientState,
    // Set once a `CycleStream` was handed out for the current connection.
    awaiting: bool,
}

impl IncrementalClient<UnixSocketTransport> {
    pub fn new(address: impl Into<PathBuf>) -> Self {
        Self::with_options(address, ClientOptions::default())
    }

    /// Client for the socket advertised in `ABAZEL_WATCH_SOCKET_FILE`.
    pub fn from_env() -> Option<Self> {
        std::env::var_os(PROTOCOL_SOCKET_ENV).map(Self::new)
    }

    /// Connects to the server socket and runs the handshake, requesting
    /// `caps` when the negotiated version supports capabilities.
    pub async fn connect(&mut self, caps: CapabilityRequest) -> Result<()> {
        if self.transport.is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }

        let transport = UnixSocketTransport::connect(&self.address).await?;
        self.attach(transport, caps).await
    }
}

impl<T: Transport + 'static> IncrementalClient<T> {
    pub fn with_options(address: impl Into<PathBuf>, options: ClientOptions) -> Self {
        Self {
            address: address.into(),
            options,
            transport: None,
            version: None,
            caps: None,
            state: ClientState::Disconnected,
            awaiting: false,
        }
    }

    /// Runs the handshake over an already connected transport. On any
    /// failure the transport is closed so the caller can retry from scratch.
    pub async fn attach(&mut self, transport: T, caps: CapabilityRequest) -> Result<()> {
        if self.transport.is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }

        let transport = Arc::new(transport);
        self.transport = Some(Arc::clone(&transport));

        if let Err(e) = self.handshake(transport.as_ref(), &caps).await {
            if let Err(close_err) = self.disconnect().await {
                debug!(error = %close_err, "Failed to close after handshake failure");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn handshake(&mut self, transport: &T, caps: &CapabilityRequest) -> Result<()> {
        self.state = ClientState::Negotiating;
        let version =
            negotiation::choose_version(transport, &self.options.supported_versions).await?;
        self.version = Some(version);

        if version.has_cap_message() {
            self.state = ClientState::CapabilityNegotiating;
            self.caps = Some(negotiation::request_capabilities(transport, caps).await?);
        } else if !caps.is_empty() {
            return Err(ProtocolError::CapabilitiesUnsupported(version));
        }

        self.state = ClientState::Connected(version);
        info!(%version, socket = ?self.address, "Connected to incremental build server");
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        let transport = self.transport.take().ok_or(ProtocolError::NotConnected)?;
        self.version = None;
        self.caps = None;
        self.state = ClientState::Disconnected;
        self.awaiting = false;

        transport.close().await?;
        Ok(())
    }

    /// Starts consuming cycles. Protocol versions with `SUBSCRIBE` subscribe
    /// first. Only one stream is handed out per connection and it cannot be
    /// restarted once it ends.
    pub async fn await_cycles(&mut self) -> Result<CycleStream<T>> {
        let (Some(transport), ClientState::Connected(version)) = (&self.transport, self.state)
        else {
            return Err(ProtocolError::NotConnected);
        };
        if self.awaiting {
            return Err(ProtocolError::AlreadyAwaitingCycles);
        }
        self.awaiting = true;

        if version.has_subscribe_message() {
            negotiation::subscribe(transport.as_ref(), &self.options.watch_type).await?;
        }

        Ok(CycleStream::new(Arc::clone(transport)))
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ClientState::Connected(_))
    }

    pub fn version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    /// The server's canonical answer to our `CAPS`. `None` on legacy servers.
    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.caps.as_ref()
    }
}

/// Pull-based sequence of cycles from the server.
pub struct CycleStream<T: Transport + 'static> {
    transport: Arc<T>,
    pending: Option<CycleId>,
    finished: bool,
}

impl<T: Transport + 'static> CycleStream<T> {
    fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            pending: None,
            finished: false,
        }
    }

    /// Completes the previous cycle, then waits for the next one. Messages
    /// other than `CYCLE` are skipped. Returns `None` after a terminal error
    /// or [`stop`](Self::stop).
    pub async fn next(&mut self) -> Option<Result<CycleEvent>> {
        if self.finished {
            return None;
        }
        self.complete_pending().await;

        loop {
            let message = match self.transport.recv().await {
                Ok(message) => message,
                Err(TransportError::Decode(e)) => {
                    warn!(error = %e, "Ignoring undecodable message");
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "Cycle stream ended");
                    self.finished = true;
                    return Some(Err(e.into()));
                }
            };

            let (trace, cycle) = match message {
                Message {
                    trace,
                    body: MessageBody::Cycle(cycle),
                } => (trace, cycle),
                other => {
                    warn!(kind = %other.kind(), "Expected CYCLE, ignoring message");
                    continue;
                }
            };

            if let Err(e) = self
                .transport
                .send(&Message::cycle_started(cycle.cycle_id))
                .await
            {
                self.finished = true;
                return Some(Err(e.into()));
            }
            self.pending = Some(cycle.cycle_id);

            debug!(
                cycle_id = cycle.cycle_id,
                changes = cycle.sources.len(),
                "Received cycle"
            );
            return Some(Ok(CycleEvent {
                cycle_id: cycle.cycle_id,
                scope: cycle.scope,
                sources: cycle.sources,
                trace,
            }));
        }
    }

    /// Completes the current cycle, if any, and ends the stream.
    pub async fn stop(&mut self) -> Result<()> {
        self.finished = true;
        if let Some(cycle_id) = self.pending.take() {
            self.transport
                .send(&Message::cycle_completed(cycle_id))
                .await?;
        }
        Ok(())
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<CycleEvent>> {
        futures::stream::unfold(self, |mut cycles| async move {
            let item = cycles.next().await?;
            Some((item, cycles))
        })
    }

    async fn complete_pending(&mut self) {
        if let Some(cycle_id) = self.pending.take() {
            if let Err(e) = self
                .transport
                .send(&Message::cycle_completed(cycle_id))
                .await
            {
                warn!(cycle_id, error = %e, "Failed to send CYCLE_COMPLETED");
            }
        }
    }
}

impl<T: Transport + 'static> Drop for CycleStream<T> {
    fn drop(&mut self) {
        let Some(cycle_id) = self.pending.take() else {
            return;
        };

        let transport = Arc::clone(&self.transport);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = transport.send(&Message::cycle_completed(cycle_id)).await {
                        warn!(cycle_id, error = %e, "Failed to send CYCLE_COMPLETED");
                    }
                });
            }
            Err(_) => warn!(cycle_id, "No runtime left to send CYCLE_COMPLETED"),
        }
    }
}
