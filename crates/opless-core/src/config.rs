//! Environment-variable configuration for the two opless processes.
//!
//! Every variable is mandatory; a missing or unparsable value fails startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

fn str_var(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn int_var(name: &'static str) -> Result<u64, ConfigError> {
    let value = str_var(name)?;
    value
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value })
}

/// Configuration for the manager process.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub port: u16,
    /// Redis `host:port`.
    pub redis_endpoint: String,
    /// MinIO/S3 `host:port`.
    pub minio_endpoint: String,
    pub minio_access_key: String,
    pub minio_secret_key: String,
    /// Name of the container network lambdas attach to.
    pub internal_network: String,
    /// Lifetime of staged uploads, in seconds.
    pub tmp_ttl_secs: u64,
}

impl ManagerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: int_var("PORT")? as u16,
            redis_endpoint: str_var("REDIS_ENDPOINT")?,
            minio_endpoint: str_var("MINIO_ENDPOINT")?,
            minio_access_key: str_var("MINIO_ACCESS_KEY")?,
            minio_secret_key: str_var("MINIO_SECRET_KEY")?,
            internal_network: str_var("INTERNAL_NETWORK")?,
            tmp_ttl_secs: int_var("TMP_TTL")?,
        })
    }
}

/// Configuration for the router process.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub port: u16,
    pub redis_endpoint: String,
}

impl RouterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: int_var("PORT")? as u16,
            redis_endpoint: str_var("REDIS_ENDPOINT")?,
        })
    }
}
