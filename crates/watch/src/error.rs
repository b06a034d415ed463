use ibp_protocol::{CapabilityError, CycleId, DecodeError, MessageKind, ProtocolVersion};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("No connection was accepted")]
    NotAccepted,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(TransportError),

    #[error("Malformed message: {0}")]
    Decode(#[from] DecodeError),

    #[error("Server is already serving")]
    AlreadyServing,

    #[error("Client already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Cycles are already being awaited on this connection")]
    AlreadyAwaitingCycles,

    #[error("Expected {expected}, got {actual}")]
    UnexpectedMessage {
        expected: MessageKind,
        actual: MessageKind,
    },

    #[error(
        "Peer selected unsupported version {version}, expected one of {}",
        version_list(.supported)
    )]
    UnsupportedVersion {
        version: ProtocolVersion,
        supported: Vec<ProtocolVersion>,
    },

    #[error(
        "No common protocol version: offered {}, supported {}",
        version_list(.offered),
        version_list(.supported)
    )]
    NoCommonVersion {
        offered: Vec<ProtocolVersion>,
        supported: Vec<ProtocolVersion>,
    },

    #[error("Server negotiated version {0} which does not support capabilities negotiation")]
    CapabilitiesUnsupported(ProtocolVersion),

    #[error("Invalid capabilities: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Received {kind} for cycle_id={actual}, expected cycle_id={expected}")]
    CycleMismatch {
        expected: CycleId,
        actual: CycleId,
        kind: MessageKind,
    },

    #[error("Received unexpected {kind} while waiting on cycle_id={cycle_id}")]
    UnexpectedCycleResponse { cycle_id: CycleId, kind: MessageKind },
}

impl From<TransportError> for ProtocolError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Decode(e) => ProtocolError::Decode(e),
            other => ProtocolError::Transport(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

fn version_list(versions: &[ProtocolVersion]) -> String {
    let items: Vec<String> = versions.iter().map(|v| v.to_string()).collect();
    format!("[{}]", items.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibp_protocol::Message;

    #[test]
    fn test_decode_errors_are_lifted_out_of_transport() {
        let decode = Message::decode("{}").unwrap_err();
        let err: ProtocolError = TransportError::Decode(decode).into();
        assert!(matches!(err, ProtocolError::Decode(_)));

        let err: ProtocolError = TransportError::Closed.into();
        assert!(matches!(err, ProtocolError::Transport(TransportError::Closed)));
    }

    #[test]
    fn test_version_errors_list_versions() {
        let err = ProtocolError::NoCommonVersion {
            offered: vec![ProtocolVersion(2), ProtocolVersion(1)],
            supported: vec![ProtocolVersion(0)],
        };
        assert_eq!(
            err.to_string(),
            "No common protocol version: offered [v2, v1], supported [v0]"
        );
    }

    #[test]
    fn test_cycle_mismatch_message() {
        let err = ProtocolError::CycleMismatch {
            expected: 3,
            actual: 2,
            kind: MessageKind::CycleCompleted,
        };
        assert_eq!(
            err.to_string(),
            "Received CYCLE_COMPLETED for cycle_id=2, expected cycle_id=3"
        );
    }
}
