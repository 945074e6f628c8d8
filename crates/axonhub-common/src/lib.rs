use serde::{Deserialize, Serialize};

pub mod error;

pub use error::{GatewayError, GatewayResult, TransportErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigError {
    #[error("missing required gateway config field: {0}")]
    MissingField(&'static str),
}

/// Cache topology for hot read caches (API keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Process-local cache, in-process invalidation only.
    Memory,
    /// Process-local cache invalidated across nodes over Redis pub/sub.
    Redis,
}

impl Default for CacheMode {
    fn default() -> Self {
        CacheMode::Memory
    }
}

/// Final, merged gateway configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN used by this process.
    pub dsn: String,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    pub cache_mode: CacheMode,
    /// Required when `cache_mode` is `redis`.
    pub redis_url: Option<String>,
}

/// Optional layer used for merging gateway config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub proxy: Option<String>,
    pub cache_mode: Option<CacheMode>,
    pub redis_url: Option<String>,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.cache_mode.is_some() {
            self.cache_mode = other.cache_mode;
        }
        if other.redis_url.is_some() {
            self.redis_url = other.redis_url;
        }
    }

    pub fn into_config(self) -> Result<GatewayConfig, GatewayConfigError> {
        let cache_mode = self.cache_mode.unwrap_or_default();
        let redis_url = self.redis_url;
        if cache_mode == CacheMode::Redis && redis_url.is_none() {
            return Err(GatewayConfigError::MissingField("redis_url"));
        }
        Ok(GatewayConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8090),
            dsn: self.dsn.ok_or(GatewayConfigError::MissingField("dsn"))?,
            proxy: self.proxy,
            cache_mode,
            redis_url,
        })
    }
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            dsn: Some(value.dsn),
            proxy: value.proxy,
            cache_mode: Some(value.cache_mode),
            redis_url: value.redis_url,
        }
    }
}

/// Correlation id attached to uncategorized internal errors.
pub fn correlation_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_incoming_fields() {
        let mut base = GatewayConfigPatch {
            host: Some("127.0.0.1".to_string()),
            port: Some(8090),
            dsn: Some("sqlite::memory:".to_string()),
            ..Default::default()
        };
        base.overlay(GatewayConfigPatch {
            port: Some(9100),
            ..Default::default()
        });
        let config = base.into_config().unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9100);
    }

    #[test]
    fn redis_mode_requires_url() {
        let patch = GatewayConfigPatch {
            dsn: Some("sqlite::memory:".to_string()),
            cache_mode: Some(CacheMode::Redis),
            ..Default::default()
        };
        assert!(patch.into_config().is_err());
    }
}
