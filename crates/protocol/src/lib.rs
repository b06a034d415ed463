mod caps;
mod message;
mod types;
mod version;

pub use caps::{Capabilities, CapabilityError, CapabilityRequest, CAP_OTEL, CAP_SCOPE};
pub use message::{
    CapsMessage, CycleAck, CycleSources, DecodeError, DecodeReason, Exit, Message, MessageBody,
    MessageKind, Negotiate, NegotiateResponse, Subscribe, TraceFields,
};
pub use types::{CycleId, SourceInfo, SourceInfoMap, UnknownScope, WatchScope};
pub use version::{select_version, ProtocolVersion, DEFAULT_SUPPORTED_VERSIONS};

/// Environment variable carrying the server's socket path to spawned clients.
pub const PROTOCOL_SOCKET_ENV: &str = "ABAZEL_WATCH_SOCKET_FILE";
