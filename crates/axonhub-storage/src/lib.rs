pub mod cache;
pub mod db;
pub mod entities;
pub mod object;
pub mod request_service;
pub mod segment;
pub mod store;

pub use cache::{
    API_KEY_CHANNEL, ApiKeyCache, ApiKeyLoader, CacheEvent, CacheLoader, CacheNotifier,
    CachedApiKey, LiveCache, LiveCacheConfig, LoadContext, ProcessNotifier, RedisNotifier,
    api_key_cache_key,
};
pub use object::{BlobStore, DataStorageManager, FsStore, GcsStore, S3Store, merge_storage_settings};
pub use request_service::{
    CompletionMetrics, NewRequest, RequestService, StoragePolicy, StoredChunk,
};
pub use segment::{Segment, SegmentBuilder, Span, SpanKind};
pub use store::GatewayStorage;
