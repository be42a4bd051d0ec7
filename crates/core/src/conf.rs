use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::Level;
use turtle_process::DrainTimeout;

use crate::error::{Error, Result};

const DEFAULT_WORKER_CLOSE_TIMEOUT_MS: i64 = 30_000;

/// Instance id, numeric or textual.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum InstanceId {
    /// Numeric id.
    Number(u64),
    /// Textual id.
    Text(String),
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// A single API port or an allow-list of them.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PortSpec {
    /// Exactly this port.
    Single(u16),
    /// The first free port of this list.
    List(Vec<u16>),
}

impl PortSpec {
    /// The port allow-list.
    #[must_use]
    pub fn ports(&self) -> Vec<u16> {
        match self {
            Self::Single(port) => vec![*port],
            Self::List(ports) => ports.clone(),
        }
    }
}

/// Maximum level of the installed log subscriber.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `trace`
    Trace,
    /// `debug`
    Debug,
    /// `info`
    #[default]
    Info,
    /// `warn`
    Warn,
    /// `error`
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Process-wide settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Setting {
    /// Worker drain bound: negative waits forever, zero does not wait.
    #[serde(default = "default_worker_close_timeout_ms")]
    pub worker_close_timeout_ms: i64,

    /// Log level of the binary.
    #[serde(default)]
    pub log_level: LogLevel,
}

const fn default_worker_close_timeout_ms() -> i64 {
    DEFAULT_WORKER_CLOSE_TIMEOUT_MS
}

impl Default for Setting {
    fn default() -> Self {
        Self {
            worker_close_timeout_ms: DEFAULT_WORKER_CLOSE_TIMEOUT_MS,
            log_level: LogLevel::default(),
        }
    }
}

impl Setting {
    /// The drain bound for worker shutdowns.
    #[must_use]
    pub const fn drain_timeout(&self) -> DrainTimeout {
        DrainTimeout::from_millis(self.worker_close_timeout_ms)
    }
}

/// Configuration of one service instance.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Conf {
    /// Service name, shared by all instances.
    pub name: String,

    /// Instance id, unique per service.
    pub id: InstanceId,

    /// API port or port allow-list; any free port when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortSpec>,

    /// Driver configuration blocks keyed by logical driver name.
    #[serde(default)]
    pub drivers: Map<String, Value>,

    /// Free-form application rules.
    #[serde(default)]
    pub rules: Value,

    /// Process-wide settings.
    #[serde(default)]
    pub setting: Setting,
}

impl Conf {
    /// Loads a configuration file. Relative paths are resolved against the
    /// working directory.
    ///
    /// # Errors
    ///
    /// Fails if the file is missing or not a valid configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, PathBuf)> {
        let path = path.as_ref();
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };

        if !path.exists() {
            return Err(Error::ConfNotFound(path));
        }

        let content = fs::read_to_string(&path)?;
        let conf = serde_json::from_str(&content).map_err(|source| Error::ConfParse {
            path: path.clone(),
            source,
        })?;

        Ok((conf, path))
    }

    /// `<name>:<id>`
    #[must_use]
    pub fn service_id(&self) -> String {
        format!("{}:{}", self.name, self.id)
    }

    /// The API port allow-list; empty means any free port.
    #[must_use]
    pub fn ports(&self) -> Vec<u16> {
        self.port.as_ref().map(PortSpec::ports).unwrap_or_default()
    }

    /// The application rules as `T`.
    ///
    /// # Errors
    ///
    /// Fails if the rules do not deserialize into `T`.
    pub fn rules<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.rules.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn test_minimal_conf_uses_defaults() {
        let conf: Conf = serde_json::from_value(json!({"name": "svc", "id": 3})).unwrap();

        assert_eq!(conf.service_id(), "svc:3");
        assert!(conf.ports().is_empty());
        assert!(conf.drivers.is_empty());
        assert_eq!(conf.setting.worker_close_timeout_ms, 30_000);
        assert_eq!(conf.setting.log_level, LogLevel::Info);
        assert_eq!(
            conf.setting.drain_timeout(),
            DrainTimeout::from_millis(30_000)
        );
    }

    #[test]
    fn test_port_forms() {
        let single: Conf =
            serde_json::from_value(json!({"name": "svc", "id": "a", "port": 8080})).unwrap();
        let list: Conf =
            serde_json::from_value(json!({"name": "svc", "id": "a", "port": [8080, 8081]}))
                .unwrap();

        assert_eq!(single.ports(), [8080]);
        assert_eq!(list.ports(), [8080, 8081]);
        assert_eq!(single.id, InstanceId::Text("a".to_string()));
    }

    #[test]
    fn test_setting_and_rules() {
        #[derive(Deserialize)]
        struct Rules {
            limit: u32,
        }

        let conf: Conf = serde_json::from_value(json!({
            "name": "svc",
            "id": 1,
            "rules": {"limit": 7},
            "setting": {"worker_close_timeout_ms": -1, "log_level": "debug"}
        }))
        .unwrap();

        assert_eq!(conf.setting.drain_timeout(), DrainTimeout::Unbounded);
        assert_eq!(Level::from(conf.setting.log_level), Level::DEBUG);
        assert_eq!(conf.rules::<Rules>().unwrap().limit, 7);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.json");
        fs::write(&path, r#"{"name": "svc", "id": 1, "drivers": {"A": {}}}"#).unwrap();

        let (conf, loaded_from) = Conf::load(&path).unwrap();

        assert_eq!(loaded_from, path);
        assert!(conf.drivers.contains_key("A"));
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert_matches!(Conf::load(&missing), Err(Error::ConfNotFound(path)) if path == missing);

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{not json").unwrap();
        assert_matches!(Conf::load(&broken), Err(Error::ConfParse { .. }));

        let nameless = dir.path().join("nameless.json");
        fs::write(&nameless, r#"{"id": 1}"#).unwrap();
        assert_matches!(Conf::load(&nameless), Err(Error::ConfParse { .. }));
    }
}
