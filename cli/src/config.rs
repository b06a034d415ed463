use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use ibp::{default_socket_path, CapabilityRequest, ProtocolVersion, WatchScope};
use serde::{Deserialize, Serialize};
use tracing::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_tracing_level(&self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub log_level: LogLevel,
    pub log_to_file: bool,
    /// Directory for the server socket instead of the system temp dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_dir: Option<PathBuf>,
    /// Most preferred first.
    pub supported_versions: Vec<ProtocolVersion>,
    pub requested_scopes: Vec<WatchScope>,
    pub otel: bool,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_to_file: false,
            socket_dir: None,
            supported_versions: ibp::DEFAULT_SUPPORTED_VERSIONS.to_vec(),
            requested_scopes: Vec::new(),
            otel: false,
        }
    }
}

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("ibp")
}

pub fn runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("ibp")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

impl UserConfig {
    pub fn load() -> Self {
        Self::load_from(&config_path())
    }

    /// Missing or unparsable files give the defaults.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        match &self.socket_dir {
            Some(dir) => dir.join(format!("aspect-watch-{}-socket", std::process::id())),
            None => default_socket_path(),
        }
    }

    /// An empty list in the file means "use the built-in defaults".
    pub fn supported_versions(&self) -> Vec<ProtocolVersion> {
        if self.supported_versions.is_empty() {
            ibp::DEFAULT_SUPPORTED_VERSIONS.to_vec()
        } else {
            self.supported_versions.clone()
        }
    }

    /// Command-line scopes replace the configured ones; `otel` is on if
    /// either side asks for it. Nothing requested yields an empty request so
    /// legacy servers still accept the connection.
    pub fn capability_request(&self, scopes: &[WatchScope], otel: bool) -> CapabilityRequest {
        let scopes = if scopes.is_empty() {
            &self.requested_scopes
        } else {
            scopes
        };

        let mut request = CapabilityRequest::new();
        if !scopes.is_empty() {
            request = request.with_scope(scopes.iter().copied());
        }
        if otel || self.otel {
            request = request.with_otel(true);
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = UserConfig::load_from(&dir.path().join("config.toml"));
        assert_eq!(config, UserConfig::default());
        assert_eq!(
            config.supported_versions(),
            vec![ProtocolVersion::V1, ProtocolVersion::LEGACY]
        );
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "log_level = \"debug\"\nrequested_scopes = [\"sources\"]\nsupported_versions = [0]\n",
        )
        .unwrap();

        let config = UserConfig::load_from(&path);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.requested_scopes, vec![WatchScope::Sources]);
        assert_eq!(config.supported_versions(), vec![ProtocolVersion::LEGACY]);
        assert!(!config.otel);
    }

    #[test]
    fn test_invalid_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "requested_scopes = [\"everything\"]\n").unwrap();

        assert_eq!(UserConfig::load_from(&path), UserConfig::default());
    }

    #[test]
    fn test_socket_dir_override() {
        let config = UserConfig {
            socket_dir: Some(PathBuf::from("/run/ibp")),
            ..UserConfig::default()
        };
        assert_eq!(
            config.socket_path(),
            PathBuf::from(format!("/run/ibp/aspect-watch-{}-socket", std::process::id()))
        );
        assert_eq!(UserConfig::default().socket_path(), default_socket_path());
    }

    #[test]
    fn test_capability_request_merging() {
        let config = UserConfig {
            requested_scopes: vec![WatchScope::Runfiles],
            ..UserConfig::default()
        };

        assert!(UserConfig::default().capability_request(&[], false).is_empty());

        let request = config.capability_request(&[], false);
        assert_eq!(request.scope, Some(vec![WatchScope::Runfiles]));
        assert_eq!(request.otel, None);

        let request = config.capability_request(&[WatchScope::Sources], true);
        assert_eq!(request.scope, Some(vec![WatchScope::Sources]));
        assert_eq!(request.otel, Some(true));
    }

    #[test]
    fn test_log_levels() {
        assert_eq!(LogLevel::Off.as_tracing_level(), None);
        assert_eq!(LogLevel::default().as_tracing_level(), Some(Level::WARN));
    }
}
