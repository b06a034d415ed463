use std::fs;
use std::path::{Path, PathBuf};

use ibp_protocol::*;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_TARGET_TMPDIR"))
        .join("fixtures")
        .join("messages")
}

fn write_fixture(dir: &Path, name: &str, json: &str) -> PathBuf {
    let path = dir.join(format!("{}.json", name));
    fs::write(&path, json).unwrap_or_else(|_| panic!("Failed to write fixture: {:?}", path));
    path
}

fn sample_sources() -> SourceInfoMap {
    let mut sources = SourceInfoMap::new();
    sources.insert(
        "pkg/lib.ts".to_string(),
        Some(SourceInfo {
            is_symlink: Some(false),
            is_source: Some(true),
        }),
    );
    sources.insert("pkg/link.ts".to_string(), Some(SourceInfo {
        is_symlink: Some(true),
        is_source: None,
    }));
    sources.insert("pkg/removed.ts".to_string(), None);
    sources
}

fn sample_trace() -> TraceFields {
    TraceFields {
        trace_id: Some("4bf92f3577b34da6a3ce929d0e0e4736".to_string()),
        span_id: Some("00f067aa0ba902b7".to_string()),
    }
}

fn sample_messages() -> Vec<(&'static str, Message, Value)> {
    let caps = Capabilities::from_wire(Some(&json!({ "scope": ["sources"], "otel": true })))
        .unwrap()
        .to_wire();

    vec![
        (
            "negotiate",
            Message::negotiate(DEFAULT_SUPPORTED_VERSIONS.to_vec()),
            json!({ "kind": "NEGOTIATE", "versions": [1, 0] }),
        ),
        (
            "negotiate_response",
            Message::negotiate_response(ProtocolVersion::V1),
            json!({ "kind": "NEGOTIATE_RESPONSE", "version": 1 }),
        ),
        (
            "caps",
            Message::caps(
                CapabilityRequest::new()
                    .with_scope([WatchScope::Sources])
                    .with_otel(true)
                    .to_wire(),
            ),
            json!({ "kind": "CAPS", "caps": { "scope": ["sources"], "otel": true } }),
        ),
        (
            "caps_response",
            Message::caps_response(caps),
            json!({ "kind": "CAPS_RESPONSE", "caps": { "scope": ["sources"], "otel": true } }),
        ),
        (
            "subscribe",
            Message::subscribe("sources"),
            json!({ "kind": "SUBSCRIBE", "watch_type": "sources" }),
        ),
        (
            "subscribe_response",
            Message::subscribe_response(),
            json!({ "kind": "SUBSCRIBE_RESPONSE" }),
        ),
        (
            "cycle",
            Message::cycle(12, Some(WatchScope::Sources), sample_sources())
                .with_trace(sample_trace()),
            json!({
                "kind": "CYCLE",
                "cycle_id": 12,
                "scope": "sources",
                "sources": {
                    "pkg/lib.ts": { "is_symlink": false, "is_source": true },
                    "pkg/link.ts": { "is_symlink": true },
                    "pkg/removed.ts": null,
                },
                "trace_id": "4bf92f3577b34da6a3ce929d0e0e4736",
                "span_id": "00f067aa0ba902b7",
            }),
        ),
        (
            "cycle_legacy",
            Message::cycle(1, None, SourceInfoMap::new()),
            json!({ "kind": "CYCLE", "cycle_id": 1, "sources": {} }),
        ),
        (
            "cycle_started",
            Message::cycle_started(12),
            json!({ "kind": "CYCLE_STARTED", "cycle_id": 12 }),
        ),
        (
            "cycle_completed",
            Message::cycle_completed(12),
            json!({ "kind": "CYCLE_COMPLETED", "cycle_id": 12 }),
        ),
        (
            "cycle_aborted",
            Message::cycle_aborted(12),
            json!({ "kind": "CYCLE_ABORTED", "cycle_id": 12 }),
        ),
        (
            "cycle_failed",
            Message::cycle_failed(12),
            json!({ "kind": "CYCLE_FAILED", "cycle_id": 12 }),
        ),
        (
            "exit",
            Message::exit("build interrupted"),
            json!({ "kind": "EXIT", "description": "build interrupted" }),
        ),
    ]
}

#[test]
fn message_fixtures_match_wire_shape() {
    let dir = fixtures_dir();
    fs::create_dir_all(&dir).unwrap();

    for (name, message, expected) in sample_messages() {
        let encoded = message.encode().unwrap();
        let path = write_fixture(&dir, name, &encoded);

        let on_disk: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, expected, "wire shape of {}", name);

        let decoded = Message::decode(&encoded)
            .unwrap_or_else(|e| panic!("Failed to decode {:?}: {}", path, e));
        assert_eq!(decoded, message, "decoded {}", name);
    }
}

#[test]
fn every_kind_has_a_fixture() {
    let kinds: Vec<MessageKind> = sample_messages().iter().map(|(_, m, _)| m.kind()).collect();
    for kind in MessageKind::ALL {
        assert!(kinds.contains(&kind), "no fixture for {}", kind);
    }
}

#[test]
fn sources_with_deletion_decode_to_marker() {
    let raw = r#"{"kind":"CYCLE","cycle_id":3,"sources":{"a.go":{"is_source":true},"b.go":null}}"#;
    let message = Message::decode(raw).unwrap();
    let MessageBody::Cycle(cycle) = message.body else {
        panic!("expected CYCLE");
    };

    assert_eq!(cycle.sources.len(), 2);
    assert_eq!(
        cycle.sources["a.go"],
        Some(SourceInfo {
            is_symlink: None,
            is_source: Some(true),
        })
    );
    assert_eq!(cycle.sources["b.go"], None);
}
