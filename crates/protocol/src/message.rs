//! Wire messages.
//!
//! Every message is a JSON object with a `kind` discriminator plus
//! kind-specific fields, and may carry `trace_id`/`span_id`. Decoding is done
//! in two steps: the `kind` is read first, then the rest of the object is
//! decoded into the record for that kind. Any failure is reported as a single
//! [`DecodeError`] that keeps the raw payload around for diagnostics.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::caps::json_type_name;
use crate::types::{CycleId, SourceInfoMap, WatchScope};
use crate::version::ProtocolVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Negotiate,
    NegotiateResponse,
    Caps,
    CapsResponse,
    Subscribe,
    SubscribeResponse,
    Cycle,
    CycleStarted,
    CycleCompleted,
    CycleAborted,
    CycleFailed,
    Exit,
}

impl MessageKind {
    pub const ALL: [MessageKind; 12] = [
        MessageKind::Negotiate,
        MessageKind::NegotiateResponse,
        MessageKind::Caps,
        MessageKind::CapsResponse,
        MessageKind::Subscribe,
        MessageKind::SubscribeResponse,
        MessageKind::Cycle,
        MessageKind::CycleStarted,
        MessageKind::CycleCompleted,
        MessageKind::CycleAborted,
        MessageKind::CycleFailed,
        MessageKind::Exit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Negotiate => "NEGOTIATE",
            MessageKind::NegotiateResponse => "NEGOTIATE_RESPONSE",
            MessageKind::Caps => "CAPS",
            MessageKind::CapsResponse => "CAPS_RESPONSE",
            MessageKind::Subscribe => "SUBSCRIBE",
            MessageKind::SubscribeResponse => "SUBSCRIBE_RESPONSE",
            MessageKind::Cycle => "CYCLE",
            MessageKind::CycleStarted => "CYCLE_STARTED",
            MessageKind::CycleCompleted => "CYCLE_COMPLETED",
            MessageKind::CycleAborted => "CYCLE_ABORTED",
            MessageKind::CycleFailed => "CYCLE_FAILED",
            MessageKind::Exit => "EXIT",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = DecodeReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DecodeReason::UnknownKind(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeReason {
    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("missing or non-string kind")]
    MissingKind,

    #[error("unknown kind {0:?}")]
    UnknownKind(String),

    #[error("invalid {kind} message: {detail}")]
    Shape { kind: MessageKind, detail: String },
}

/// A payload that could not be turned into a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason} (payload: {raw})")]
pub struct DecodeError {
    raw: String,
    reason: DecodeReason,
}

impl DecodeError {
    pub fn new(raw: impl Into<String>, reason: DecodeReason) -> Self {
        Self {
            raw: raw.into(),
            reason,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn reason(&self) -> &DecodeReason {
        &self.reason
    }

    /// The kind of the offending message, when it got that far.
    pub fn kind(&self) -> Option<MessageKind> {
        match &self.reason {
            DecodeReason::Shape { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// OpenTelemetry identifiers attached when the `otel` capability is on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceFields {
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl TraceFields {
    pub fn is_empty(&self) -> bool {
        self.trace_id.is_none() && self.span_id.is_none()
    }

    fn read(object: &Map<String, Value>) -> Self {
        let field = |name: &str| {
            object
                .get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            trace_id: field("trace_id"),
            span_id: field("span_id"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Negotiate {
    pub versions: Vec<ProtocolVersion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiateResponse {
    pub version: ProtocolVersion,
}

/// Body of both `CAPS` and `CAPS_RESPONSE`. The map stays raw until the
/// receiving side validates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsMessage {
    #[serde(default)]
    pub caps: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscribe {
    pub watch_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSources {
    pub cycle_id: CycleId,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_scope"
    )]
    pub scope: Option<WatchScope>,
    #[serde(default)]
    pub sources: SourceInfoMap,
}

/// Body shared by `CYCLE_STARTED`, `CYCLE_COMPLETED`, `CYCLE_ABORTED` and
/// `CYCLE_FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleAck {
    pub cycle_id: CycleId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exit {
    #[serde(default)]
    pub description: String,
}

fn lenient_scope<'de, D>(deserializer: D) -> Result<Option<WatchScope>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_str().and_then(|s| s.parse().ok()))
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Negotiate(Negotiate),
    NegotiateResponse(NegotiateResponse),
    Caps(CapsMessage),
    CapsResponse(CapsMessage),
    Subscribe(Subscribe),
    SubscribeResponse,
    Cycle(CycleSources),
    CycleStarted(CycleAck),
    CycleCompleted(CycleAck),
    CycleAborted(CycleAck),
    CycleFailed(CycleAck),
    Exit(Exit),
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Negotiate(_) => MessageKind::Negotiate,
            MessageBody::NegotiateResponse(_) => MessageKind::NegotiateResponse,
            MessageBody::Caps(_) => MessageKind::Caps,
            MessageBody::CapsResponse(_) => MessageKind::CapsResponse,
            MessageBody::Subscribe(_) => MessageKind::Subscribe,
            MessageBody::SubscribeResponse => MessageKind::SubscribeResponse,
            MessageBody::Cycle(_) => MessageKind::Cycle,
            MessageBody::CycleStarted(_) => MessageKind::CycleStarted,
            MessageBody::CycleCompleted(_) => MessageKind::CycleCompleted,
            MessageBody::CycleAborted(_) => MessageKind::CycleAborted,
            MessageBody::CycleFailed(_) => MessageKind::CycleFailed,
            MessageBody::Exit(_) => MessageKind::Exit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub trace: TraceFields,
    pub body: MessageBody,
}

impl From<MessageBody> for Message {
    fn from(body: MessageBody) -> Self {
        Message {
            trace: TraceFields::default(),
            body,
        }
    }
}

impl Message {
    pub fn negotiate(versions: Vec<ProtocolVersion>) -> Self {
        MessageBody::Negotiate(Negotiate { versions }).into()
    }

    pub fn negotiate_response(version: ProtocolVersion) -> Self {
        MessageBody::NegotiateResponse(NegotiateResponse { version }).into()
    }

    pub fn caps(caps: Map<String, Value>) -> Self {
        MessageBody::Caps(CapsMessage {
            caps: Value::Object(caps),
        })
        .into()
    }

    pub fn caps_response(caps: Map<String, Value>) -> Self {
        MessageBody::CapsResponse(CapsMessage {
            caps: Value::Object(caps),
        })
        .into()
    }

    pub fn subscribe(watch_type: impl Into<String>) -> Self {
        MessageBody::Subscribe(Subscribe {
            watch_type: watch_type.into(),
        })
        .into()
    }

    pub fn subscribe_response() -> Self {
        MessageBody::SubscribeResponse.into()
    }

    pub fn cycle(cycle_id: CycleId, scope: Option<WatchScope>, sources: SourceInfoMap) -> Self {
        MessageBody::Cycle(CycleSources {
            cycle_id,
            scope,
            sources,
        })
        .into()
    }

    pub fn cycle_started(cycle_id: CycleId) -> Self {
        MessageBody::CycleStarted(CycleAck { cycle_id }).into()
    }

    pub fn cycle_completed(cycle_id: CycleId) -> Self {
        MessageBody::CycleCompleted(CycleAck { cycle_id }).into()
    }

    pub fn cycle_aborted(cycle_id: CycleId) -> Self {
        MessageBody::CycleAborted(CycleAck { cycle_id }).into()
    }

    pub fn cycle_failed(cycle_id: CycleId) -> Self {
        MessageBody::CycleFailed(CycleAck { cycle_id }).into()
    }

    pub fn exit(description: impl Into<String>) -> Self {
        MessageBody::Exit(Exit {
            description: description.into(),
        })
        .into()
    }

    pub fn with_trace(mut self, trace: TraceFields) -> Self {
        self.trace = trace;
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// The cycle a `CYCLE` or cycle acknowledgment refers to.
    pub fn cycle_id(&self) -> Option<CycleId> {
        match &self.body {
            MessageBody::Cycle(c) => Some(c.cycle_id),
            MessageBody::CycleStarted(a)
            | MessageBody::CycleCompleted(a)
            | MessageBody::CycleAborted(a)
            | MessageBody::CycleFailed(a) => Some(a.cycle_id),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        let mut object = match &self.body {
            MessageBody::Negotiate(m) => to_object(m)?,
            MessageBody::NegotiateResponse(m) => to_object(m)?,
            MessageBody::Caps(m) | MessageBody::CapsResponse(m) => to_object(m)?,
            MessageBody::Subscribe(m) => to_object(m)?,
            MessageBody::SubscribeResponse => Map::new(),
            MessageBody::Cycle(m) => to_object(m)?,
            MessageBody::CycleStarted(m)
            | MessageBody::CycleCompleted(m)
            | MessageBody::CycleAborted(m)
            | MessageBody::CycleFailed(m) => to_object(m)?,
            MessageBody::Exit(m) => to_object(m)?,
        };

        object.insert(
            "kind".to_string(),
            Value::String(self.kind().as_str().to_string()),
        );
        if let Some(trace_id) = &self.trace.trace_id {
            object.insert("trace_id".to_string(), Value::String(trace_id.clone()));
        }
        if let Some(span_id) = &self.trace.span_id {
            object.insert("span_id".to_string(), Value::String(span_id.clone()));
        }

        Ok(Value::Object(object))
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_value()?)
    }

    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| DecodeError::new(raw, DecodeReason::Json(e.to_string())))?;
        Self::decode_value(raw, value)
    }

    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let raw = value.to_string();
        Self::decode_value(&raw, value)
    }

    fn decode_value(raw: &str, value: Value) -> Result<Self, DecodeError> {
        let object = match &value {
            Value::Object(object) => object,
            other => {
                return Err(DecodeError::new(
                    raw,
                    DecodeReason::NotAnObject(json_type_name(other)),
                ))
            }
        };

        let kind: MessageKind = object
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| DecodeError::new(raw, DecodeReason::MissingKind))?
            .parse()
            .map_err(|reason| DecodeError::new(raw, reason))?;

        let trace = TraceFields::read(object);

        let body = match kind {
            MessageKind::Negotiate => MessageBody::Negotiate(body_of(raw, kind, value)?),
            MessageKind::NegotiateResponse => {
                MessageBody::NegotiateResponse(body_of(raw, kind, value)?)
            }
            MessageKind::Caps => MessageBody::Caps(body_of(raw, kind, value)?),
            MessageKind::CapsResponse => MessageBody::CapsResponse(body_of(raw, kind, value)?),
            MessageKind::Subscribe => MessageBody::Subscribe(body_of(raw, kind, value)?),
            MessageKind::SubscribeResponse => MessageBody::SubscribeResponse,
            MessageKind::Cycle => MessageBody::Cycle(body_of(raw, kind, value)?),
            MessageKind::CycleStarted => MessageBody::CycleStarted(body_of(raw, kind, value)?),
            MessageKind::CycleCompleted => MessageBody::CycleCompleted(body_of(raw, kind, value)?),
            MessageKind::CycleAborted => MessageBody::CycleAborted(body_of(raw, kind, value)?),
            MessageKind::CycleFailed => MessageBody::CycleFailed(body_of(raw, kind, value)?),
            MessageKind::Exit => MessageBody::Exit(body_of(raw, kind, value)?),
        };

        Ok(Message { trace, body })
    }
}

fn to_object<T: Serialize>(body: &T) -> Result<Map<String, Value>, serde_json::Error> {
    match serde_json::to_value(body)? {
        Value::Object(object) => Ok(object),
        _ => Err(<serde_json::Error as serde::ser::Error>::custom(
            "message body must serialize to an object",
        )),
    }
}

fn body_of<T: DeserializeOwned>(
    raw: &str,
    kind: MessageKind,
    value: Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| {
        DecodeError::new(
            raw,
            DecodeReason::Shape {
                kind,
                detail: e.to_string(),
            },
        )
    })
}
