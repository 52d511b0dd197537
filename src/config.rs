// src/config.rs
use chrono::Duration;
use std::net::SocketAddr;
use thiserror::Error;

const MAX_TOKEN_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub bind_addr: SocketAddr,
    pub alphavantage_api_key: String,
    pub alphavantage_url: Option<String>,
    pub jwt_secret: String,
    pub token_ttl: Duration,
}

impl Config {
    /// Reads the process environment, after loading `.env` if one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(name))
        };
        let parsed = |name: &'static str, default: &str| {
            let value = lookup(name).unwrap_or_else(|| default.to_string());
            value
                .parse::<u64>()
                .map_err(|_| ConfigError::Invalid { name, value })
        };

        let bind = lookup("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:3030".to_string());
        let bind_addr = bind.parse::<SocketAddr>().map_err(|_| ConfigError::Invalid {
            name: "BIND_ADDR",
            value: bind,
        })?;

        let max_connections = parsed("DB_MAX_CONNECTIONS", "5")?;
        let ttl_secs = parsed("TOKEN_TTL_SECS", "86400")?;
        if ttl_secs == 0 || ttl_secs > MAX_TOKEN_TTL_SECS {
            return Err(ConfigError::Invalid {
                name: "TOKEN_TTL_SECS",
                value: ttl_secs.to_string(),
            });
        }

        Ok(Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| "sqlite://finance.db".to_string()),
            max_connections: u32::try_from(max_connections).unwrap_or(u32::MAX).max(1),
            bind_addr,
            alphavantage_api_key: required("ALPHAVANTAGE_API_KEY")?,
            alphavantage_url: lookup("ALPHAVANTAGE_URL").filter(|v| !v.is_empty()),
            jwt_secret: required("JWT_SECRET")?,
            token_ttl: Duration::seconds(ttl_secs as i64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = load(&[("ALPHAVANTAGE_API_KEY", "key"), ("JWT_SECRET", "secret")]).unwrap();
        assert_eq!(config.database_url, "sqlite://finance.db");
        assert_eq!(config.bind_addr, "127.0.0.1:3030".parse().unwrap());
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.token_ttl, Duration::seconds(86400));
        assert!(config.alphavantage_url.is_none());
    }

    #[test]
    fn secrets_are_required() {
        let err = load(&[("ALPHAVANTAGE_API_KEY", "key")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("JWT_SECRET")));
    }

    #[test]
    fn bad_numbers_are_reported() {
        let err = load(&[
            ("ALPHAVANTAGE_API_KEY", "key"),
            ("JWT_SECRET", "secret"),
            ("TOKEN_TTL_SECS", "soon"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "TOKEN_TTL_SECS", .. }));
    }
}
