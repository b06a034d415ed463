//! Protocol versioning for the watch socket.
//!
//! # Version History
//!
//! | Version | Changes |
//! |---------|---------|
//! | 0 | Legacy: `NEGOTIATE` handshake and cycles only, no `scope` on `CYCLE` |
//! | 1 | `CAPS`/`CAPS_RESPONSE` handshake, `scope` and `otel` capabilities |
//! | 2 | `SUBSCRIBE`/`SUBSCRIBE_RESPONSE` before the first cycle |
//!
//! Version 2 is not offered by default. Engines only negotiate it when a caller
//! puts it in their supported-version lists.
//!
//! # Negotiation
//!
//! The server announces its versions in priority order, most preferred first.
//! The client answers with the first entry of that list it also supports. The
//! chosen version is fixed for the lifetime of the connection.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ProtocolVersion(pub u32);

impl ProtocolVersion {
    pub const LEGACY: ProtocolVersion = ProtocolVersion(0);
    pub const V1: ProtocolVersion = ProtocolVersion(1);
    pub const V2: ProtocolVersion = ProtocolVersion(2);
    pub const LATEST: ProtocolVersion = ProtocolVersion::V1;

    /// Only the legacy version lacks the `CAPS` message.
    pub fn has_cap_message(self) -> bool {
        self.0 > 0
    }

    /// Only the legacy version lacks `scope`, both as a capability and on `CYCLE`.
    pub fn has_scope_cap(self) -> bool {
        self.0 > 0
    }

    pub fn has_subscribe_message(self) -> bool {
        self.0 >= 2
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u32> for ProtocolVersion {
    fn from(v: u32) -> Self {
        ProtocolVersion(v)
    }
}

/// Versions this build speaks, in priority order.
pub const DEFAULT_SUPPORTED_VERSIONS: &[ProtocolVersion] =
    &[ProtocolVersion::V1, ProtocolVersion::LEGACY];

/// Picks the first version in `offered` (the server's priority order) that
/// `supported` also contains.
pub fn select_version(
    offered: &[ProtocolVersion],
    supported: &[ProtocolVersion],
) -> Option<ProtocolVersion> {
    offered.iter().copied().find(|v| supported.contains(v))
}
