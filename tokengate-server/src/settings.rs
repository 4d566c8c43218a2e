//! Server settings
//!
//! Settings are read from an optional JSON file named by `TOKENGATE_CONFIG`,
//! then individual values are overridden by environment variables:
//!
//! | variable                 | setting                                   |
//! |--------------------------|-------------------------------------------|
//! | `TOKENGATE_ADDR`         | listen address, e.g. `0.0.0.0:8080`       |
//! | `TOKENGATE_REDIS_URL`    | switches the backend to Redis at this URL |
//! | `TOKENGATE_CAPACITY`     | default bucket capacity                   |
//! | `TOKENGATE_REFILL_RATE`  | default refill rate                       |
//! | `TOKENGATE_CORS_ORIGIN`  | allowed cross-origin caller               |

use std::{net::SocketAddr, path::Path, str::FromStr, time::Duration};
use serde::{Deserialize, Serialize};
use tokengate::config::{BackendConfig, LimiterConfig, RedisConfig};
use crate::{
    driver::DEFAULT_DRIVER_CLIENT,
    error::ServerError,
    events::DEFAULT_EVENT_CAPACITY,
};

const CONFIG_VAR: &str = "TOKENGATE_CONFIG";
const ADDR_VAR: &str = "TOKENGATE_ADDR";
const REDIS_URL_VAR: &str = "TOKENGATE_REDIS_URL";
const CAPACITY_VAR: &str = "TOKENGATE_CAPACITY";
const REFILL_RATE_VAR: &str = "TOKENGATE_REFILL_RATE";
const CORS_ORIGIN_VAR: &str = "TOKENGATE_CORS_ORIGIN";

/// Settings of a server instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Listen address
    ///
    /// Default: `127.0.0.1:8080`
    pub addr: SocketAddr,

    /// Rate limiter settings
    pub limiter: LimiterConfig,

    /// Origin allowed to call the API from a browser
    ///
    /// Default: `None`
    pub cors_origin: Option<String>,

    /// Client the load driver checks when a start request names none
    ///
    /// Default: `test-client`
    pub driver_client_id: String,

    /// Events buffered per live feed subscriber
    ///
    /// Default: `1024`
    pub event_capacity: usize,

    /// Maximum size of a request body in bytes
    ///
    /// Default: `64 KiB`
    pub max_body_size: usize,

    /// Time given to open connections to finish on shutdown, in milliseconds
    ///
    /// Default: `5000`
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            limiter: LimiterConfig::default(),
            cors_origin: None,
            driver_client_id: DEFAULT_DRIVER_CLIENT.to_owned(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_body_size: 64 * 1024,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl ServerSettings {
    /// Loads settings from the process environment.
    pub fn load() -> Result<Self, ServerError> {
        Self::load_with(|name| std::env::var(name).ok())
    }

    /// Loads settings, reading variables through `var`.
    pub fn load_with(var: impl Fn(&str) -> Option<String>) -> Result<Self, ServerError> {
        let settings = match var(CONFIG_VAR) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.with_overrides(var)
    }

    /// Reads settings from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|err| ServerError::Config(format!("failed to read {}: {err}", path.display())))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Applies environment overrides and validates the result.
    pub fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, ServerError> {
        if let Some(addr) = var(ADDR_VAR) {
            self.addr = parse(ADDR_VAR, &addr)?;
        }
        if let Some(url) = var(REDIS_URL_VAR) {
            match &mut self.limiter.backend {
                BackendConfig::Redis(redis) => redis.url = url,
                backend => *backend = BackendConfig::Redis(RedisConfig::new(url)),
            }
        }
        if let Some(capacity) = var(CAPACITY_VAR) {
            self.limiter.capacity = parse(CAPACITY_VAR, &capacity)?;
        }
        if let Some(refill_rate) = var(REFILL_RATE_VAR) {
            self.limiter.refill_rate = parse(REFILL_RATE_VAR, &refill_rate)?;
        }
        if let Some(origin) = var(CORS_ORIGIN_VAR) {
            self.cors_origin = Some(origin);
        }

        self.validate()?;
        Ok(self)
    }

    /// Checks that the server can start with these settings.
    pub fn validate(&self) -> Result<(), ServerError> {
        self.limiter.validate()?;
        if self.driver_client_id.is_empty() {
            return Err(ServerError::Config("driver client id must not be empty".into()));
        }
        if self.max_body_size == 0 {
            return Err(ServerError::Config("max body size must be positive".into()));
        }
        Ok(())
    }

    /// Time given to open connections to finish on shutdown.
    #[inline]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T, ServerError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err| ServerError::Config(format!("invalid {name} value {value:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn it_defaults_without_environment() {
        let settings = ServerSettings::load_with(env(&[])).unwrap();

        assert_eq!(settings, ServerSettings::default());
        assert_eq!(settings.addr.port(), 8080);
        assert_eq!(settings.driver_client_id, "test-client");
    }

    #[test]
    fn it_applies_environment_overrides() {
        let settings = ServerSettings::load_with(env(&[
            ("TOKENGATE_ADDR", "0.0.0.0:9000"),
            ("TOKENGATE_REDIS_URL", "redis://cache:6379"),
            ("TOKENGATE_CAPACITY", "5"),
            ("TOKENGATE_REFILL_RATE", " 1 "),
            ("TOKENGATE_CORS_ORIGIN", "http://localhost:3000"),
        ])).unwrap();

        assert_eq!(settings.addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(settings.limiter.capacity, 5);
        assert_eq!(settings.limiter.refill_rate, 1);
        assert_eq!(settings.cors_origin.as_deref(), Some("http://localhost:3000"));
        assert_eq!(settings.limiter.backend, BackendConfig::Redis(RedisConfig::new("redis://cache:6379")));
    }

    #[test]
    fn it_rejects_malformed_values() {
        let err = ServerSettings::load_with(env(&[("TOKENGATE_CAPACITY", "ten")])).unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));

        let err = ServerSettings::load_with(env(&[("TOKENGATE_REFILL_RATE", "0")])).unwrap_err();
        assert!(matches!(err, ServerError::Limiter(_)));
    }

    #[test]
    fn it_reads_json_file() {
        let path = std::env::temp_dir().join(format!("tokengate-settings-{}.json", std::process::id()));
        std::fs::write(&path, r#"{
            "addr": "127.0.0.1:7070",
            "limiter": { "capacity": 3, "refillRate": 1, "refillMode": "carry" },
            "eventCapacity": 16
        }"#).unwrap();

        let settings = ServerSettings::load_with(env(&[
            ("TOKENGATE_CONFIG", path.to_str().unwrap()),
            ("TOKENGATE_CAPACITY", "4"),
        ]));
        std::fs::remove_file(&path).unwrap();
        let settings = settings.unwrap();

        assert_eq!(settings.addr.port(), 7070);
        assert_eq!(settings.limiter.capacity, 4);
        assert_eq!(settings.limiter.refill_rate, 1);
        assert_eq!(settings.limiter.refill_mode, tokengate::RefillMode::Carry);
        assert_eq!(settings.event_capacity, 16);
        assert_eq!(settings.max_body_size, 64 * 1024);
    }

    #[test]
    fn missing_file_is_reported() {
        let err = ServerSettings::load_with(env(&[("TOKENGATE_CONFIG", "/nonexistent/tokengate.json")])).unwrap_err();

        assert!(err.to_string().contains("failed to read"));
    }
}
