//! The build side of the protocol.
//!
//! An [`IncrementalServer`] binds a socket, negotiates with the first client
//! that connects (in a background task), then pushes change batches to it one
//! cycle at a time, waiting for the client to finish each before returning.

use std::error::Error as StdError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use ibp_protocol::{
    Capabilities, Message, MessageKind, ProtocolVersion, SourceInfoMap, WatchScope,
    DEFAULT_SUPPORTED_VERSIONS, PROTOCOL_SOCKET_ENV,
};
use opentelemetry::Context;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::error::{ProtocolError, Result, TransportError};
use crate::negotiation;
use crate::trace::trace_fields;
use crate::transport::{ServerTransport, UnixSocketServer};

/// Socket path used when none is configured: `<tmpdir>/aspect-watch-<pid>-socket`.
pub fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("aspect-watch-{}-socket", std::process::id()))
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub socket_path: PathBuf,
    /// Offered to clients in this order, most preferred first.
    pub supported_versions: Vec<ProtocolVersion>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            supported_versions: DEFAULT_SUPPORTED_VERSIONS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Listening,
    Negotiating,
    CapabilityNegotiating,
    Connected(ProtocolVersion),
    Closed,
}

/// What was agreed with the connected client.
#[derive(Debug)]
struct Session {
    version: ProtocolVersion,
    caps: Option<Capabilities>,
    watch_type: Option<String>,
}

struct Shared<T> {
    transport: T,
    options: ServerOptions,
    state: watch::Sender<ConnectionState>,
    session: OnceLock<Session>,
    next_cycle_id: AtomicU32,
    serving: AtomicBool,
    // Held for a whole cycle so responses are never read by two callers.
    exchange: Mutex<()>,
}

impl<T: ServerTransport> Shared<T> {
    async fn negotiate(&self, cx: &Context) -> Result<ProtocolVersion> {
        self.state.send_replace(ConnectionState::Negotiating);

        let version =
            negotiation::offer_versions(&self.transport, &self.options.supported_versions).await?;

        let caps = if version.has_cap_message() {
            self.state.send_replace(ConnectionState::CapabilityNegotiating);
            Some(negotiation::answer_capabilities(&self.transport, cx).await?)
        } else {
            None
        };

        let watch_type = if version.has_subscribe_message() {
            Some(negotiation::accept_subscription(&self.transport).await?)
        } else {
            None
        };

        self.session
            .set(Session {
                version,
                caps,
                watch_type,
            })
            .map_err(|_| ProtocolError::AlreadyConnected)?;
        self.state.send_replace(ConnectionState::Connected(version));

        info!(%version, socket = ?self.options.socket_path, "Client connected");
        Ok(version)
    }
}

pub struct IncrementalServer<T: ServerTransport = UnixSocketServer> {
    shared: Arc<Shared<T>>,
}

impl IncrementalServer<UnixSocketServer> {
    pub fn new() -> Self {
        Self::with_options(ServerOptions::default())
    }

    pub fn with_options(options: ServerOptions) -> Self {
        Self::with_transport(UnixSocketServer::new(), options)
    }
}

impl Default for IncrementalServer<UnixSocketServer> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ServerTransport + 'static> IncrementalServer<T> {
    pub fn with_transport(transport: T, options: ServerOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            shared: Arc::new(Shared {
                transport,
                options,
                state,
                session: OnceLock::new(),
                next_cycle_id: AtomicU32::new(0),
                serving: AtomicBool::new(false),
                exchange: Mutex::new(()),
            }),
        }
    }

    /// Binds the socket and negotiates with the first client in the
    /// background. Returns as soon as the socket is bound.
    ///
    /// Cancelling stops waiting for a client. A handshake already under way
    /// still runs to completion; only its failure is no longer reported as an
    /// error. The trace context current at this call is used for the
    /// handshake.
    pub fn serve(&self, cancel: CancellationToken) -> Result<()> {
        if self.shared.serving.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::AlreadyServing);
        }

        self.shared.transport.serve(&self.shared.options.socket_path)?;
        self.shared.state.send_replace(ConnectionState::Listening);

        let shared = Arc::clone(&self.shared);
        let cx = Context::current();
        tokio::spawn(async move {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                accepted = shared.transport.accept() => Some(accepted),
            };

            match accepted {
                Some(Ok(())) => match shared.negotiate(&cx).await {
                    Ok(_) => return,
                    Err(e) if cancel.is_cancelled() => {
                        debug!(error = %e, "Negotiation failed after cancellation")
                    }
                    Err(e) => error!(
                        socket = ?shared.options.socket_path,
                        error = %e,
                        "Failed to connect to incremental build protocol client"
                    ),
                },
                None => debug!("Cancelled before a client connected"),
                Some(Err(TransportError::NotAccepted)) => debug!("No client connected"),
                Some(Err(e)) => error!(
                    socket = ?shared.options.socket_path,
                    error = %e,
                    "Failed to accept incremental build protocol client"
                ),
            }
            shared.state.send_replace(ConnectionState::Closed);
        });

        Ok(())
    }

    /// Resolves with the negotiated version once a client is connected, or
    /// `None` if negotiation ended without one. Never resolves before
    /// [`serve`](Self::serve) is called.
    pub async fn wait_for_connection(&self) -> Option<ProtocolVersion> {
        let mut state = self.shared.state.subscribe();
        let settled = state
            .wait_for(|s| matches!(s, ConnectionState::Connected(_) | ConnectionState::Closed))
            .await
            .ok()?;

        match *settled {
            ConnectionState::Connected(version) => Some(version),
            _ => None,
        }
    }

    /// Sends the first batch of changes.
    pub async fn init(&self, scope: WatchScope, sources: SourceInfoMap) -> Result<()> {
        self.cycle(scope, sources).await
    }

    pub async fn cycle(&self, scope: WatchScope, changes: SourceInfoMap) -> Result<()> {
        let cx = Context::current();
        self.cycle_with_context(&cx, scope, changes).await
    }

    /// Sends one batch and waits until the client has completed it. A client
    /// reporting the cycle as aborted or failed is logged but still counts as
    /// done.
    pub async fn cycle_with_context(
        &self,
        cx: &Context,
        scope: WatchScope,
        changes: SourceInfoMap,
    ) -> Result<()> {
        let session = self.session()?;
        let _exchange = self.shared.exchange.lock().await;

        let cycle_id = self.shared.next_cycle_id.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            cycle_id,
            changes = changes.len(),
            socket = ?self.shared.options.socket_path,
            "Sending cycle"
        );

        // Legacy clients do not know about scopes.
        let scope = session.version.has_scope_cap().then_some(scope);
        let message = self.traced(cx, session, Message::cycle(cycle_id, scope, changes));
        self.shared.transport.send(&message).await?;

        loop {
            let response = self.shared.transport.recv().await?;
            let kind = response.kind();

            let Some(received) = response.cycle_id() else {
                return Err(ProtocolError::UnexpectedCycleResponse { cycle_id, kind });
            };
            if received != cycle_id {
                return Err(ProtocolError::CycleMismatch {
                    expected: cycle_id,
                    actual: received,
                    kind,
                });
            }

            match kind {
                MessageKind::CycleStarted => {
                    trace!(cycle_id, "Cycle started");
                }
                MessageKind::CycleCompleted => {
                    debug!(cycle_id, "Cycle completed");
                    return Ok(());
                }
                MessageKind::CycleAborted | MessageKind::CycleFailed => {
                    error!(cycle_id, %kind, "Client did not complete cycle");
                    return Ok(());
                }
                _ => return Err(ProtocolError::UnexpectedCycleResponse { cycle_id, kind }),
            }
        }
    }

    /// Tells the client the build is going away. Does not wait for a reply.
    pub async fn exit(&self, error: Option<&(dyn StdError + Send + Sync)>) -> Result<()> {
        let cx = Context::current();
        self.exit_with_context(&cx, error).await
    }

    pub async fn exit_with_context(
        &self,
        cx: &Context,
        error: Option<&(dyn StdError + Send + Sync)>,
    ) -> Result<()> {
        let session = self.session()?;
        let description = error.map(|e| e.to_string()).unwrap_or_default();

        let _exchange = self.shared.exchange.lock().await;
        let message = self.traced(cx, session, Message::exit(description));
        self.shared.transport.send(&message).await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.shared.transport.close().await?;
        self.shared.state.send_replace(ConnectionState::Closed);
        Ok(())
    }

    pub fn has_connection(&self) -> bool {
        self.shared.transport.has_connection()
    }

    /// Whether the connected client asked for `scope`. Without negotiated
    /// capabilities only runfiles are watched.
    pub fn watching_scope(&self, scope: WatchScope) -> bool {
        match self.shared.session.get().and_then(|s| s.caps.as_ref()) {
            Some(caps) => caps.watches(scope),
            None => scope == WatchScope::Runfiles,
        }
    }

    pub fn address(&self) -> &Path {
        &self.shared.options.socket_path
    }

    /// Environment to hand to client processes so they can find the socket.
    pub fn env(&self) -> Vec<(String, String)> {
        vec![(
            PROTOCOL_SOCKET_ENV.to_string(),
            self.address().display().to_string(),
        )]
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn version(&self) -> Option<ProtocolVersion> {
        self.shared.session.get().map(|s| s.version)
    }

    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.shared.session.get().and_then(|s| s.caps.as_ref())
    }

    /// Watch type the client subscribed to, on versions with `SUBSCRIBE`.
    pub fn watch_type(&self) -> Option<&str> {
        self.shared
            .session
            .get()
            .and_then(|s| s.watch_type.as_deref())
    }

    fn session(&self) -> Result<&Session> {
        self.shared
            .session
            .get()
            .ok_or(ProtocolError::NotConnected)
    }

    fn traced(&self, cx: &Context, session: &Session, message: Message) -> Message {
        let otel = session.caps.as_ref().is_some_and(|c| c.otel_enabled());
        if otel {
            message.with_trace(trace_fields(cx))
        } else {
            message
        }
    }
}
