use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const LOG_LEVEL_ENV: &str = "GPUSTATD_LOG_LEVEL";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_api_listen")]
    pub api_listen: SocketAddr,
    #[serde(default)]
    pub http_listen: Option<SocketAddr>,
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            api_listen: default_api_listen(),
            http_listen: None,
            socket_path: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms < 50 {
            return Err(ConfigError::Validation(
                "interval_ms must be >= 50".to_string(),
            ));
        }
        if !self.api_listen.ip().is_loopback() {
            return Err(ConfigError::Validation(format!(
                "api_listen {} must be a loopback address",
                self.api_listen
            )));
        }
        if let Some(addr) = self.http_listen {
            if !addr.ip().is_loopback() {
                return Err(ConfigError::Validation(format!(
                    "http_listen {addr} must be a loopback address"
                )));
            }
            if addr == self.api_listen {
                return Err(ConfigError::Validation(
                    "http_listen and api_listen must differ".to_string(),
                ));
            }
        }
        if let Some(path) = &self.socket_path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::Validation(
                    "socket_path must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

/// Verbosity picked by `GPUSTATD_LOG_LEVEL` when `RUST_LOG` is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Unset or unrecognized values select the most verbose level.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("off") => Self::Off,
            Some("error") => Self::Error,
            Some("warn") => Self::Warn,
            Some("info") => Self::Info,
            Some("debug") => Self::Debug,
            _ => Self::Trace,
        }
    }

    pub fn from_env() -> Self {
        Self::parse(std::env::var(LOG_LEVEL_ENV).ok().as_deref())
    }

    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

const fn default_interval_ms() -> u64 {
    500
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 45050))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.interval(), Duration::from_millis(500));
        assert_eq!(cfg.api_listen.to_string(), "127.0.0.1:45050");
    }

    #[test]
    fn bundled_example_parses() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.api_listen, Config::default().api_listen);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpustatd.yaml");
        std::fs::write(&path, "interval_ms: 1000\nhttp_listen: \"127.0.0.1:9108\"\n").unwrap();

        let cfg = Config::load_from_file(&path).unwrap();
        assert_eq!(cfg.interval_ms, 1000);
        assert_eq!(cfg.http_listen, Some("127.0.0.1:9108".parse().unwrap()));
        assert!(cfg.socket_path.is_none());
    }

    #[test]
    fn rejects_non_loopback_and_short_interval() {
        let mut cfg = Config {
            api_listen: "0.0.0.0:45050".parse().unwrap(),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        cfg = Config {
            http_listen: Some("10.0.0.1:9108".parse().unwrap()),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        cfg = Config {
            interval_ms: 10,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_fields_fail_to_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpustatd.yaml");
        std::fs::write(&path, "listen: 127.0.0.1:1\n").unwrap();
        assert!(matches!(
            Config::load_from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn log_level_fallback_is_trace() {
        assert_eq!(LogLevel::parse(Some("warn")), LogLevel::Warn);
        assert_eq!(LogLevel::parse(Some(" Info ")), LogLevel::Info);
        assert_eq!(LogLevel::parse(Some("off")), LogLevel::Off);
        assert_eq!(LogLevel::parse(Some("loud")), LogLevel::Trace);
        assert_eq!(LogLevel::parse(None), LogLevel::Trace);
    }
}
