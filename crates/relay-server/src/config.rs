//! Relay configuration.
//!
//! Loading flow:
//! 1. Compiled [`RelayConfig::default()`]
//! 2. `relay.json` (or the file named by `RELAY_CONFIG`) if it exists
//! 3. `RELAY_*` environment variables, `__` separating nested keys
//!    (`RELAY_SERVER__PORT`, `RELAY_AUTH__SECRET`, ...)

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use relay_auth::AuthConfig;
use relay_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};
use tracing::Level;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "RELAY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "relay.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// `0` picks a free port.
    pub port: u16,
    /// Per-connection outbound queue depth.
    pub outbound_queue_capacity: usize,
    /// Depth of the hub's command channel.
    pub hub_queue_capacity: usize,
    /// Idle-read budget; the peer must send something within this window.
    pub pong_wait_secs: u64,
    pub write_wait_secs: u64,
    /// Max inbound frame size in bytes.
    pub max_message_size: usize,
    /// Rows returned by `GET /messages`.
    pub history_limit: usize,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            outbound_queue_capacity: 256,
            hub_queue_capacity: 1024,
            pong_wait_secs: 60,
            write_wait_secs: 10,
            max_message_size: 64 * 1024,
            history_limit: 100,
            shutdown_timeout_secs: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/relay.db"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let telemetry = TelemetryConfig::default();
        Self {
            level: "info".into(),
            json: telemetry.json,
            log_to_sqlite: telemetry.log_to_sqlite,
            log_db_path: telemetry.log_db_path,
        }
    }
}

impl LoggingConfig {
    pub fn to_telemetry(&self) -> Result<TelemetryConfig, ConfigError> {
        let log_level = Level::from_str(&self.level)
            .map_err(|_| ConfigError::Invalid(format!("unknown log level {:?}", self.level)))?;
        Ok(TelemetryConfig {
            log_level,
            module_levels: Vec::new(),
            json: self.json,
            log_to_sqlite: self.log_to_sqlite,
            log_db_path: self.log_db_path.clone(),
        })
    }
}

/// Liveness deadlines for one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LivenessTimings {
    /// Max silence from the peer before the read side gives up.
    pub pong_wait: Duration,
    /// Ping cadence; always shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Bound on a single outbound write.
    pub write_wait: Duration,
}

impl LivenessTimings {
    pub fn new(pong_wait: Duration, write_wait: Duration) -> Self {
        Self {
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait,
        }
    }
}

impl From<&ServerConfig> for LivenessTimings {
    fn from(cfg: &ServerConfig) -> Self {
        Self::new(
            Duration::from_secs(cfg.pong_wait_secs),
            Duration::from_secs(cfg.write_wait_secs),
        )
    }
}

impl RelayConfig {
    pub fn liveness(&self) -> LivenessTimings {
        LivenessTimings::from(&self.server)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.server;
        if s.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid("server.outbound_queue_capacity must be at least 1".into()));
        }
        if s.hub_queue_capacity == 0 {
            return Err(ConfigError::Invalid("server.hub_queue_capacity must be at least 1".into()));
        }
        if s.pong_wait_secs == 0 {
            return Err(ConfigError::Invalid("server.pong_wait_secs must be at least 1".into()));
        }
        if s.write_wait_secs == 0 {
            return Err(ConfigError::Invalid("server.write_wait_secs must be at least 1".into()));
        }
        if self.auth.secret.is_empty() {
            return Err(ConfigError::Invalid("auth.secret must be set".into()));
        }
        self.logging.to_telemetry()?;
        Ok(())
    }
}

/// Layered provider chain for a given config file path.
pub fn figment(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(RelayConfig::default()))
        .merge(Json::file(path))
        .merge(Env::prefixed("RELAY_").split("__"))
}

/// Load and validate configuration from the default locations.
pub fn load() -> Result<RelayConfig, ConfigError> {
    let path = std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    load_from(&path)
}

pub fn load_from(path: &Path) -> Result<RelayConfig, ConfigError> {
    let config: RelayConfig = figment(path).extract()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn valid() -> RelayConfig {
        RelayConfig {
            auth: AuthConfig {
                secret: "s".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn server_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.outbound_queue_capacity, 256);
        assert_eq!(cfg.pong_wait_secs, 60);
        assert_eq!(cfg.write_wait_secs, 10);
        assert_eq!(cfg.history_limit, 100);
    }

    #[test]
    fn ping_period_is_nine_tenths_of_pong_wait() {
        let timings = LivenessTimings::from(&ServerConfig::default());
        assert_eq!(timings.pong_wait, Duration::from_secs(60));
        assert_eq!(timings.ping_period, Duration::from_secs(54));
        assert_eq!(timings.write_wait, Duration::from_secs(10));
    }

    #[test]
    fn validate_accepts_defaults_with_secret() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_requires_secret() {
        let err = RelayConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("auth.secret"));
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut cfg = valid();
        cfg.server.outbound_queue_capacity = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = valid();
        cfg.server.hub_queue_capacity = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_zero_timeouts() {
        let mut cfg = valid();
        cfg.server.pong_wait_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.server.write_wait_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_log_level() {
        let mut cfg = valid();
        cfg.logging.level = "loud".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn logging_maps_to_telemetry() {
        let logging = LoggingConfig {
            level: "debug".into(),
            json: false,
            ..Default::default()
        };
        let telemetry = logging.to_telemetry().unwrap();
        assert_eq!(telemetry.log_level, Level::DEBUG);
        assert!(!telemetry.json);
    }

    #[test]
    fn missing_file_uses_defaults() {
        Jail::expect_with(|jail| {
            jail.set_env("RELAY_AUTH__SECRET", "from-env");
            let cfg = load_from(Path::new("does-not-exist.json")).unwrap();
            assert_eq!(cfg.server.port, 8080);
            assert_eq!(cfg.auth.secret, "from-env");
            Ok(())
        });
    }

    #[test]
    fn file_then_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "relay.json",
                r#"{"server": {"port": 9000, "history_limit": 5}, "auth": {"secret": "file"}}"#,
            )?;
            jail.set_env("RELAY_SERVER__PORT", "9100");

            let cfg = load_from(Path::new("relay.json")).unwrap();
            assert_eq!(cfg.server.port, 9100);
            assert_eq!(cfg.server.history_limit, 5);
            assert_eq!(cfg.server.pong_wait_secs, 60);
            assert_eq!(cfg.auth.secret, "file");
            Ok(())
        });
    }

    #[test]
    fn invalid_file_is_load_error() {
        Jail::expect_with(|jail| {
            jail.create_file("relay.json", r#"{"server": {"port": "not-a-port"}}"#)?;
            jail.set_env("RELAY_AUTH__SECRET", "s");
            let err = load_from(Path::new("relay.json")).unwrap_err();
            assert!(matches!(err, ConfigError::Load(_)));
            Ok(())
        });
    }
}
