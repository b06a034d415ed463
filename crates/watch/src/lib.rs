//! Incremental build protocol engines.
//!
//! A build tool runs an [`IncrementalServer`] and exports its socket through
//! [`PROTOCOL_SOCKET_ENV`]; a watcher process connects with an
//! [`IncrementalClient`]. After a version (and, from v1, capability)
//! handshake the server pushes change batches as cycles and waits for the
//! client to acknowledge each one.

mod client;
mod error;
mod negotiation;
mod server;
#[cfg(test)]
mod testing;
mod trace;
pub mod transport;

pub use client::{ClientOptions, ClientState, CycleEvent, CycleStream, IncrementalClient};
pub use error::{ProtocolError, Result, TransportError};
pub use server::{default_socket_path, ConnectionState, IncrementalServer, ServerOptions};
pub use trace::{current_trace_fields, trace_fields};
pub use transport::{ServerTransport, Transport, UnixSocketServer, UnixSocketTransport};

pub use ibp_protocol::{
    Capabilities, CapabilityError, CapabilityRequest, CycleId, DecodeError, Message, MessageKind,
    ProtocolVersion, SourceInfo, SourceInfoMap, TraceFields, WatchScope,
    DEFAULT_SUPPORTED_VERSIONS, PROTOCOL_SOCKET_ENV,
};
