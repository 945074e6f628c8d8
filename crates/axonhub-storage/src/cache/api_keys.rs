use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use axonhub_common::{GatewayError, GatewayResult};

use crate::cache::{CacheLoader, LiveCache, LoadContext};
use crate::entities;
use crate::store::GatewayStorage;

pub const KEY_PREFIX: &str = "ah-";
const KEY_HEX_LEN: usize = 64;

/// Cache key derivation: the raw secret never appears in the cache, only
/// its 64-bit hash.
pub fn api_key_cache_key(raw: &str) -> String {
    format!("api_key:{}", xxhash_rust::xxh64::xxh64(raw.as_bytes(), 0))
}

/// Opaque key shape: literal `ah-` prefix + 64 lowercase hex characters.
pub fn is_valid_key_shape(raw: &str) -> bool {
    let Some(hex) = raw.strip_prefix(KEY_PREFIX) else {
        return false;
    };
    hex.len() == KEY_HEX_LEN
        && hex
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Authentication view of an API key. The raw secret is not part of it.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedApiKey {
    pub id: i64,
    pub user_id: i64,
    pub project_id: i64,
    pub key_type: String,
    pub status: String,
    pub scopes: Vec<String>,
    pub quota: Option<serde_json::Value>,
    pub deleted_at: i64,
}

impl CachedApiKey {
    pub fn from_row(row: entities::api_keys::Model) -> Self {
        let scopes = serde_json::from_value(row.scopes).unwrap_or_default();
        Self {
            id: row.id,
            user_id: row.user_id,
            project_id: row.project_id,
            key_type: row.key_type,
            status: row.status,
            scopes,
            quota: row.quota,
            deleted_at: row.deleted_at,
        }
    }

    /// Entries self-validate: a cached row is only usable while not
    /// soft-deleted and still enabled.
    pub fn is_live(&self) -> bool {
        self.deleted_at == 0 && self.status == "enabled"
    }

    pub fn is_service_account(&self) -> bool {
        self.key_type == "service_account"
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.is_empty() || self.scopes.iter().any(|s| s == scope)
    }
}

pub type ApiKeyCache = LiveCache<CachedApiKey>;

pub struct ApiKeyLoader {
    storage: GatewayStorage,
}

impl ApiKeyLoader {
    pub fn new(storage: GatewayStorage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl CacheLoader<CachedApiKey> for ApiKeyLoader {
    async fn load_one(
        &self,
        cache_key: &str,
        ctx: &LoadContext,
    ) -> GatewayResult<Option<CachedApiKey>> {
        // The cache key is one-way; the raw secret must ride on the context.
        let raw = ctx
            .raw_secret
            .as_deref()
            .ok_or(GatewayError::InvalidApiKey)?;
        if api_key_cache_key(raw) != cache_key {
            return Err(GatewayError::InvalidApiKey);
        }
        let row = self
            .storage
            .find_api_key_by_value(raw)
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        Ok(row
            .map(CachedApiKey::from_row)
            .filter(|key| key.deleted_at == 0))
    }

    async fn load_since(
        &self,
        since: OffsetDateTime,
    ) -> GatewayResult<(Vec<(String, Option<CachedApiKey>)>, OffsetDateTime)> {
        let rows = self
            .storage
            .list_api_keys_since(since)
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        let mut high_water = since;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            high_water = high_water.max(row.updated_at);
            let cache_key = api_key_cache_key(&row.key_value);
            let cached = CachedApiKey::from_row(row);
            if cached.deleted_at == 0 {
                entries.push((cache_key, Some(cached)));
            } else {
                entries.push((cache_key, None));
            }
        }
        Ok((entries, high_water))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shape_is_strict() {
        let valid = format!("ah-{}", "a1".repeat(32));
        assert!(is_valid_key_shape(&valid));
        assert!(!is_valid_key_shape("sk-abc"));
        assert!(!is_valid_key_shape(&format!("ah-{}", "A1".repeat(32))));
        assert!(!is_valid_key_shape("ah-abc"));
    }

    #[test]
    fn cache_key_hides_the_secret() {
        let raw = format!("ah-{}", "0f".repeat(32));
        let key = api_key_cache_key(&raw);
        assert!(key.starts_with("api_key:"));
        assert!(!key.contains(&raw));
        // Deterministic across calls.
        assert_eq!(key, api_key_cache_key(&raw));
    }
}
