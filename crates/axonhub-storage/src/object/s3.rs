use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;

use axonhub_common::{GatewayError, GatewayResult};

use crate::object::BlobStore;

const READ_CACHE_TTL: Duration = Duration::from_secs(300);
const READ_CACHE_CAPACITY: u64 = 1024;

/// S3 backend with static credentials and a read-through memory cache.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    read_cache: moka::future::Cache<String, Arc<Vec<u8>>>,
}

impl S3Store {
    pub fn from_settings(settings: &serde_json::Value) -> GatewayResult<Self> {
        let field = |name: &str| -> GatewayResult<String> {
            settings
                .get(name)
                .and_then(|value| value.as_str())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    GatewayError::InternalStorage(format!("s3 storage requires {name}"))
                })
        };
        let region = field("region")?;
        let bucket = field("bucket")?;
        let access_key_id = field("access_key_id")?;
        let secret_access_key = field("secret_access_key")?;
        let endpoint = settings
            .get("endpoint")
            .and_then(|value| value.as_str())
            .filter(|value| !value.is_empty());

        let credentials = Credentials::from_keys(access_key_id, secret_access_key, None);
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());

        Ok(Self {
            client,
            bucket,
            read_cache: moka::future::Cache::builder()
                .max_capacity(READ_CACHE_CAPACITY)
                .time_to_live(READ_CACHE_TTL)
                .build(),
        })
    }

    fn object_name(key: &str) -> String {
        key.trim_start_matches('/').to_string()
    }
}

#[async_trait]
impl BlobStore for S3Store {
    async fn save(&self, key: &str, data: &[u8]) -> GatewayResult<String> {
        let object = Self::object_name(key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        self.read_cache
            .insert(object, Arc::new(data.to_vec()))
            .await;
        Ok(key.to_string())
    }

    async fn load(&self, key: &str) -> GatewayResult<Vec<u8>> {
        let object = Self::object_name(key);
        if let Some(cached) = self.read_cache.get(&object).await {
            return Ok(cached.as_ref().clone());
        }
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object)
            .send()
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?
            .into_bytes()
            .to_vec();
        self.read_cache
            .insert(object, Arc::new(bytes.clone()))
            .await;
        Ok(bytes)
    }

    async fn delete(&self, key: &str) -> GatewayResult<()> {
        let object = Self::object_name(key);
        // S3 DeleteObject is already idempotent for missing keys.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&object)
            .send()
            .await
            .map_err(|err| GatewayError::InternalStorage(err.to_string()))?;
        self.read_cache.invalidate(&object).await;
        Ok(())
    }
}
