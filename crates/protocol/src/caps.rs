//! Capability maps exchanged in `CAPS` and `CAPS_RESPONSE`.
//!
//! Known capabilities are validated: `scope` must be a non-empty list of
//! watch scopes, `otel` is read as a boolean (anything else counts as
//! `false`). Unknown keys are kept verbatim so newer clients can pass
//! extensions through an older server.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::types::{UnknownScope, WatchScope};

pub const CAP_SCOPE: &str = "scope";
pub const CAP_OTEL: &str = "otel";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityError {
    #[error("invalid caps, expected an object, received {0}")]
    NotAnObject(&'static str),

    #[error("invalid value for scope capability: {0}, expected a list")]
    ScopeNotAList(&'static str),

    #[error("invalid entry in scope capability: {0}, expected a string")]
    ScopeEntryNotAString(&'static str),

    #[error(transparent)]
    UnknownScope(#[from] UnknownScope),

    #[error("scope capability must have at least one scope, got an empty list")]
    EmptyScope,
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Capabilities a client asks for when connecting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityRequest {
    pub scope: Option<Vec<WatchScope>>,
    pub otel: Option<bool>,
    pub extensions: BTreeMap<String, Value>,
}

impl CapabilityRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(mut self, scopes: impl IntoIterator<Item = WatchScope>) -> Self {
        self.scope = Some(scopes.into_iter().collect());
        self
    }

    pub fn with_otel(mut self, enabled: bool) -> Self {
        self.otel = Some(enabled);
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.scope.is_none() && self.otel.is_none() && self.extensions.is_empty()
    }

    pub fn to_wire(&self) -> Map<String, Value> {
        let mut map: Map<String, Value> = self
            .extensions
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(scopes) = &self.scope {
            map.insert(CAP_SCOPE.to_string(), scopes_to_wire(scopes));
        }
        if let Some(otel) = self.otel {
            map.insert(CAP_OTEL.to_string(), Value::Bool(otel));
        }
        map
    }
}

/// The canonical capability set of a connection, as both sides store it.
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    scopes: Vec<WatchScope>,
    otel: Option<bool>,
    extensions: BTreeMap<String, Value>,
}

impl Default for Capabilities {
    /// Runfiles only, matching what servers did before capabilities existed.
    fn default() -> Self {
        Self {
            scopes: vec![WatchScope::Runfiles],
            otel: None,
            extensions: BTreeMap::new(),
        }
    }
}

impl Capabilities {
    /// Reads a raw `caps` value. A missing or `null` value yields the defaults.
    pub fn from_wire(raw: Option<&Value>) -> Result<Self, CapabilityError> {
        let mut caps = Capabilities::default();

        let entries = match raw {
            None | Some(Value::Null) => return Ok(caps),
            Some(Value::Object(entries)) => entries,
            Some(other) => return Err(CapabilityError::NotAnObject(json_type_name(other))),
        };

        for (key, value) in entries {
            match key.as_str() {
                CAP_SCOPE => caps.scopes = read_scope_list(value)?,
                CAP_OTEL => caps.otel = Some(value.as_bool().unwrap_or(false)),
                _ => {
                    caps.extensions.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(caps)
    }

    pub fn to_wire(&self) -> Map<String, Value> {
        let mut map: Map<String, Value> = self
            .extensions
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        map.insert(CAP_SCOPE.to_string(), scopes_to_wire(&self.scopes));
        if let Some(otel) = self.otel {
            map.insert(CAP_OTEL.to_string(), Value::Bool(otel));
        }
        map
    }

    pub fn scopes(&self) -> &[WatchScope] {
        &self.scopes
    }

    pub fn watches(&self, scope: WatchScope) -> bool {
        self.scopes.contains(&scope)
    }

    pub fn otel_enabled(&self) -> bool {
        self.otel == Some(true)
    }

    pub fn extension(&self, key: &str) -> Option<&Value> {
        self.extensions.get(key)
    }

    pub fn extensions(&self) -> &BTreeMap<String, Value> {
        &self.extensions
    }
}

fn scopes_to_wire(scopes: &[WatchScope]) -> Value {
    Value::Array(
        scopes
            .iter()
            .map(|s| Value::String(s.as_str().to_string()))
            .collect(),
    )
}

fn read_scope_list(value: &Value) -> Result<Vec<WatchScope>, CapabilityError> {
    let list = value
        .as_array()
        .ok_or_else(|| CapabilityError::ScopeNotAList(json_type_name(value)))?;

    let mut scopes = Vec::with_capacity(list.len());
    for entry in list {
        let name = entry
            .as_str()
            .ok_or_else(|| CapabilityError::ScopeEntryNotAString(json_type_name(entry)))?;
        let scope: WatchScope = name.parse()?;
        if !scopes.contains(&scope) {
            scopes.push(scope);
        }
    }

    if scopes.is_empty() {
        return Err(CapabilityError::EmptyScope);
    }

    Ok(scopes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_caps_default_to_runfiles() {
        let caps = Capabilities::from_wire(None).unwrap();
        assert_eq!(caps.scopes(), &[WatchScope::Runfiles]);
        assert!(!caps.otel_enabled());

        let caps = Capabilities::from_wire(Some(&Value::Null)).unwrap();
        assert_eq!(caps.scopes(), &[WatchScope::Runfiles]);
    }

    #[test]
    fn test_empty_object_defaults_to_runfiles() {
        let caps = Capabilities::from_wire(Some(&json!({}))).unwrap();
        assert!(caps.watches(WatchScope::Runfiles));
        assert!(!caps.watches(WatchScope::Sources));
    }

    #[test]
    fn test_parses_known_and_unknown_caps() {
        let raw = json!({
            "scope": ["sources", "runfiles"],
            "otel": true,
            "x": "value",
        });
        let caps = Capabilities::from_wire(Some(&raw)).unwrap();
        assert_eq!(caps.scopes(), &[WatchScope::Sources, WatchScope::Runfiles]);
        assert!(caps.otel_enabled());
        assert_eq!(caps.extension("x"), Some(&json!("value")));
    }

    #[test]
    fn test_non_bool_otel_is_false() {
        let caps = Capabilities::from_wire(Some(&json!({ "otel": "yes" }))).unwrap();
        assert!(!caps.otel_enabled());
        assert_eq!(caps.to_wire().get(CAP_OTEL), Some(&json!(false)));
    }

    #[test]
    fn test_rejects_empty_scope() {
        let err = Capabilities::from_wire(Some(&json!({ "scope": [] }))).unwrap_err();
        assert_eq!(err, CapabilityError::EmptyScope);
    }

    #[test]
    fn test_rejects_unknown_scope() {
        let err = Capabilities::from_wire(Some(&json!({ "scope": ["everything"] }))).unwrap_err();
        assert_eq!(
            err,
            CapabilityError::UnknownScope(UnknownScope("everything".to_string()))
        );
    }

    #[test]
    fn test_rejects_non_list_scope() {
        let err = Capabilities::from_wire(Some(&json!({ "scope": "sources" }))).unwrap_err();
        assert_eq!(err, CapabilityError::ScopeNotAList("string"));

        let err = Capabilities::from_wire(Some(&json!({ "scope": [1] }))).unwrap_err();
        assert_eq!(err, CapabilityError::ScopeEntryNotAString("number"));
    }

    #[test]
    fn test_rejects_non_object_caps() {
        let err = Capabilities::from_wire(Some(&json!(["scope"]))).unwrap_err();
        assert_eq!(err, CapabilityError::NotAnObject("array"));
    }

    #[test]
    fn test_duplicate_scopes_collapse() {
        let raw = json!({ "scope": ["sources", "sources"] });
        let caps = Capabilities::from_wire(Some(&raw)).unwrap();
        assert_eq!(caps.scopes(), &[WatchScope::Sources]);
    }

    #[test]
    fn test_canonical_map_includes_default_scope() {
        let caps = Capabilities::from_wire(Some(&json!({ "x": 1 }))).unwrap();
        let wire = Value::Object(caps.to_wire());
        assert_eq!(wire, json!({ "scope": ["runfiles"], "x": 1 }));
    }

    #[test]
    fn test_response_reparses_to_same_caps() {
        let raw = json!({ "scope": ["sources"], "otel": true, "future": { "a": 1 } });
        let caps = Capabilities::from_wire(Some(&raw)).unwrap();
        let echoed = Value::Object(caps.to_wire());
        assert_eq!(Capabilities::from_wire(Some(&echoed)).unwrap(), caps);
    }

    #[test]
    fn test_request_builder() {
        let request = CapabilityRequest::new()
            .with_scope([WatchScope::Sources])
            .with_otel(true)
            .with_extension("x", json!(1));
        assert!(!request.is_empty());
        assert_eq!(
            Value::Object(request.to_wire()),
            json!({ "scope": ["sources"], "otel": true, "x": 1 })
        );
        assert!(CapabilityRequest::new().is_empty());
    }
}
