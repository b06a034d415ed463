use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

pub type CycleId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchScope {
    Sources,
    Runfiles,
}

impl WatchScope {
    pub const ALL: [WatchScope; 2] = [WatchScope::Sources, WatchScope::Runfiles];

    pub fn as_str(&self) -> &'static str {
        match self {
            WatchScope::Sources => "sources",
            WatchScope::Runfiles => "runfiles",
        }
    }
}

impl fmt::Display for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown watch scope {0:?}, expected \"sources\" or \"runfiles\"")]
pub struct UnknownScope(pub String);

impl FromStr for WatchScope {
    type Err = UnknownScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sources" => Ok(WatchScope::Sources),
            "runfiles" => Ok(WatchScope::Runfiles),
            other => Err(UnknownScope(other.to_string())),
        }
    }
}

/// Flags that are not booleans on the wire decode as unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_bool"
    )]
    pub is_symlink: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_bool"
    )]
    pub is_source: Option<bool>,
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value.as_bool())
}

impl SourceInfo {
    pub fn source() -> Self {
        Self {
            is_symlink: None,
            is_source: Some(true),
        }
    }
}

/// Changed paths for one cycle. `None` marks a deleted path.
pub type SourceInfoMap = HashMap<String, Option<SourceInfo>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_parse() {
        assert_eq!("sources".parse::<WatchScope>(), Ok(WatchScope::Sources));
        assert_eq!("runfiles".parse::<WatchScope>(), Ok(WatchScope::Runfiles));
        assert!("Sources".parse::<WatchScope>().is_err());
    }

    #[test]
    fn test_scope_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&WatchScope::Runfiles).unwrap(),
            "\"runfiles\""
        );
    }

    #[test]
    fn test_source_info_omits_unknown_fields() {
        let json = serde_json::to_string(&SourceInfo::source()).unwrap();
        assert_eq!(json, r#"{"is_source":true}"#);
    }

    #[test]
    fn test_non_bool_flags_decode_as_unknown() {
        let info: SourceInfo =
            serde_json::from_str(r#"{"is_source":"yes","is_symlink":1}"#).unwrap();
        assert_eq!(info, SourceInfo::default());

        let info: SourceInfo =
            serde_json::from_str(r#"{"is_source":true,"is_symlink":null}"#).unwrap();
        assert_eq!(info, SourceInfo::source());
    }

    #[test]
    fn test_deleted_path_serializes_null() {
        let mut map = SourceInfoMap::new();
        map.insert("gone.txt".to_string(), None);
        assert_eq!(
            serde_json::to_string(&map).unwrap(),
            r#"{"gone.txt":null}"#
        );
    }
}
