use std::sync::Arc;

use rand::RngCore;

use axonhub_common::{GatewayError, GatewayResult};
use axonhub_storage::cache::api_keys::{KEY_PREFIX, is_valid_key_shape};
use axonhub_storage::entities::projects;
use axonhub_storage::{ApiKeyCache, CachedApiKey, GatewayStorage, LoadContext, api_key_cache_key};

/// Authenticated caller identity attached to a request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub api_key: CachedApiKey,
    pub project: projects::Model,
}

/// API-key authentication backed by the live cache. Projects are always
/// re-fetched so authorization never runs on stale rows.
pub struct AuthService {
    cache: Arc<ApiKeyCache>,
    storage: GatewayStorage,
}

impl AuthService {
    pub fn new(cache: Arc<ApiKeyCache>, storage: GatewayStorage) -> Self {
        Self { cache, storage }
    }

    pub async fn authenticate(&self, raw_key: &str) -> GatewayResult<AuthContext> {
        if !is_valid_key_shape(raw_key) {
            return Err(GatewayError::InvalidApiKey);
        }
        let cache_key = api_key_cache_key(raw_key);
        let ctx = LoadContext {
            raw_secret: Some(raw_key.to_string()),
        };
        let api_key = self
            .cache
            .get(&cache_key, &ctx)
            .await?
            .filter(CachedApiKey::is_live)
            .ok_or(GatewayError::InvalidApiKey)?;

        let project = self
            .storage
            .find_project(api_key.project_id)
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?
            .filter(|project| project.enabled)
            .ok_or(GatewayError::InvalidApiKey)?;

        Ok(AuthContext { api_key, project })
    }
}

/// Mint a new opaque key: `ah-` + 64 lowercase hex chars (32 random bytes).
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(KEY_PREFIX.len() + bytes.len() * 2);
    out.push_str(KEY_PREFIX);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_have_the_opaque_shape() {
        let key = generate_api_key();
        assert!(is_valid_key_shape(&key));
        assert_ne!(key, generate_api_key());
    }
}
