use std::env;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} is not a valid {expected}: {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("{0} must be set when MONGODB_URI is used")]
    Missing(&'static str),
    #[error("{name} must be at most {max}, got {value}")]
    TooLarge {
        name: &'static str,
        max: u64,
        value: u64,
    },
}

/// Upper bound for `SESSION_TTL_SECS`: one year.
pub const MAX_SESSION_TTL_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Clone, Debug, PartialEq)]
pub enum StoreConfig {
    Mongo { uri: String, database: String },
    Memory,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    pub store: StoreConfig,
    pub session_secret: String,
    pub session_ttl: Duration,
    pub cors_origin: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let store = match lookup("MONGODB_URI") {
            Some(uri) => StoreConfig::Mongo {
                uri,
                database: lookup("OPENSPLIT_DB").unwrap_or_else(|| "OpenSplit".to_string()),
            },
            None => StoreConfig::Memory,
        };

        let session_secret = match (lookup("SESSION_SECRET"), &store) {
            (Some(secret), _) => secret,
            (None, StoreConfig::Mongo { .. }) => return Err(ConfigError::Missing("SESSION_SECRET")),
            // Sessions of the in-memory store die with the process anyway.
            (None, StoreConfig::Memory) => Uuid::new_v4().to_string(),
        };

        let port = parse_or(&lookup, "PORT", "port number", 8080)?;
        let ttl_secs = parse_or(&lookup, "SESSION_TTL_SECS", "number of seconds", 3600)?;
        if ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(ConfigError::TooLarge {
                name: "SESSION_TTL_SECS",
                max: MAX_SESSION_TTL_SECS,
                value: ttl_secs,
            });
        }

        Ok(Config {
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            store,
            session_secret,
            session_ttl: Duration::from_secs(ttl_secs),
            cors_origin: lookup("CORS_ORIGIN"),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            expected,
            value,
        }),
        None => Ok(default),
    }
}
