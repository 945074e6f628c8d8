use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use axonhub_common::{GatewayError, GatewayResult};

use crate::object::BlobStore;

const STORAGE_BASE: &str = "https://storage.googleapis.com";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const TOKEN_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const TOKEN_LIFETIME_SECS: i64 = 3600;
const TOKEN_SLACK_SECS: i64 = 60;
const READ_CACHE_TTL: Duration = Duration::from_secs(300);
const READ_CACHE_CAPACITY: u64 = 1024;

#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct JwtClaims {
    iss: String,
    sub: String,
    aud: String,
    scope: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Default)]
struct CachedToken {
    access_token: String,
    expires_at: i64,
}

/// GCS backend authenticated by a service-account key: sign a JWT, exchange
/// it for an access token, talk to the JSON API. Objects are jailed under
/// the configured base path.
pub struct GcsStore {
    client: wreq::Client,
    bucket: String,
    base_path: String,
    key: ServiceAccountKey,
    token: Mutex<CachedToken>,
    read_cache: moka::future::Cache<String, Arc<Vec<u8>>>,
}

impl GcsStore {
    pub fn from_settings(settings: &serde_json::Value) -> GatewayResult<Self> {
        let bucket = settings
            .get("bucket")
            .and_then(|value| value.as_str())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                GatewayError::InternalStorage("gcs storage requires a bucket".to_string())
            })?;
        let credentials_json = settings
            .get("credentials_json")
            .and_then(|value| value.as_str())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                GatewayError::InternalStorage("gcs storage requires credentials_json".to_string())
            })?;
        let key: ServiceAccountKey = serde_json::from_str(credentials_json)
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        let base_path = settings
            .get("base_path")
            .and_then(|value| value.as_str())
            .unwrap_or("")
            .trim_matches('/')
            .to_string();

        Ok(Self {
            client: wreq::Client::new(),
            bucket: bucket.to_string(),
            base_path,
            key,
            token: Mutex::new(CachedToken::default()),
            read_cache: moka::future::Cache::builder()
                .max_capacity(READ_CACHE_CAPACITY)
                .time_to_live(READ_CACHE_TTL)
                .build(),
        })
    }

    fn object_name(&self, key: &str) -> GatewayResult<String> {
        let trimmed = key.trim_start_matches('/');
        if trimmed.split('/').any(|segment| segment == "..") {
            return Err(GatewayError::InternalStorage(format!(
                "storage key escapes the gcs base path: {key}"
            )));
        }
        if self.base_path.is_empty() {
            Ok(trimmed.to_string())
        } else {
            Ok(format!("{}/{trimmed}", self.base_path))
        }
    }

    async fn access_token(&self) -> GatewayResult<String> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let mut cached = self.token.lock().await;
        if now + TOKEN_SLACK_SECS < cached.expires_at {
            return Ok(cached.access_token.clone());
        }

        let token_uri = self.key.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
        let claims = JwtClaims {
            iss: self.key.client_email.clone(),
            sub: self.key.client_email.clone(),
            aud: token_uri.to_string(),
            scope: TOKEN_SCOPE.to_string(),
            iat: now,
            exp: now + TOKEN_LIFETIME_SECS,
        };
        let header = Header {
            alg: Algorithm::RS256,
            ..Header::default()
        };
        let encoding_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        let assertion = jsonwebtoken::encode(&header, &claims, &encoding_key)
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;

        let response = self
            .client
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        if !status.is_success() {
            return Err(GatewayError::InternalStorage(format!(
                "gcs token exchange failed: {}",
                String::from_utf8_lossy(&body)
            )));
        }
        let token: TokenResponse = serde_json::from_slice(&body)
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        cached.access_token = token.access_token.clone();
        cached.expires_at = now + TOKEN_LIFETIME_SECS;
        Ok(token.access_token)
    }
}

#[async_trait]
impl BlobStore for GcsStore {
    async fn save(&self, key: &str, data: &[u8]) -> GatewayResult<String> {
        let object = self.object_name(key)?;
        let token = self.access_token().await?;
        let url = format!(
            "{STORAGE_BASE}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.bucket,
            urlencoding::encode(&object)
        );
        let response = self
            .client
            .post(&url)
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        if !response.status().is_success() {
            return Err(GatewayError::InternalStorage(format!(
                "gcs upload failed with status {}",
                response.status().as_u16()
            )));
        }
        self.read_cache
            .insert(object, Arc::new(data.to_vec()))
            .await;
        Ok(key.to_string())
    }

    async fn load(&self, key: &str) -> GatewayResult<Vec<u8>> {
        let object = self.object_name(key)?;
        if let Some(cached) = self.read_cache.get(&object).await {
            return Ok(cached.as_ref().clone());
        }
        let token = self.access_token().await?;
        let url = format!(
            "{STORAGE_BASE}/storage/v1/b/{}/o/{}?alt=media",
            self.bucket,
            urlencoding::encode(&object)
        );
        let response = self
            .client
            .get(&url)
            .header("authorization", format!("Bearer {token}"))
            .send()
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        if !response.status().is_success() {
            return Err(GatewayError::InternalStorage(format!(
                "gcs download failed with status {}",
                response.status().as_u16()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?
            .to_vec();
        self.read_cache
            .insert(object, Arc::new(bytes.clone()))
            .await;
        Ok(bytes)
    }

    async fn delete(&self, key: &str) -> GatewayResult<()> {
        let object = self.object_name(key)?;
        let token = self.access_token().await?;
        let url = format!(
            "{STORAGE_BASE}/storage/v1/b/{}/o/{}",
            self.bucket,
            urlencoding::encode(&object)
        );
        let response = self
            .client
            .delete(&url)
            .header("authorization", format!("Bearer {token}"))
            .send()
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
            self.read_cache.invalidate(&object).await;
            return Ok(());
        }
        Err(GatewayError::InternalStorage(format!(
            "gcs delete failed with status {}",
            status.as_u16()
        )))
    }
}
