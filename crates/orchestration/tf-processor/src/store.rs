//! Blob store capability and its object_store-backed implementation.
//!
//! The pipeline consumes two read capabilities and one write capability:
//! a single-shot streaming read, a multipart ranged read into a buffer, and
//! a streaming multipart write. Which read variant runs is a runtime flag;
//! the rest of the pipeline never knows which produced the bytes.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, ClientOptions, ObjectStore, PutMultipartOpts, WriteMultipart};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tf_error::{FilterError, Result, SourceError};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio_util::io::StreamReader;
use tracing::{debug, trace};

/// Size of each ranged GET issued by the multipart read.
const MULTIPART_PART_SIZE: usize = 8 * 1024 * 1024;

/// How many ranged GETs run concurrently.
const MULTIPART_CONCURRENCY: usize = 4;

/// Upload buffer size handed to the multipart writer per chunk.
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Compression applied to a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    /// Detect compression from the object key.
    pub fn from_key(key: &str) -> Self {
        let key = key.to_lowercase();
        if key.ends_with(".gz") || key.ends_with(".gzip") {
            Compression::Gzip
        } else {
            Compression::None
        }
    }

    /// Detect compression from a content type, falling back to the key.
    /// Ranged downloads carry no content type, so the key is the only
    /// signal on that path.
    pub fn detect(content_type: Option<&str>, key: &str) -> Self {
        match content_type {
            Some("application/x-gzip") | Some("application/gzip") => Compression::Gzip,
            Some(_) => Compression::from_key(key),
            None => Compression::from_key(key),
        }
    }
}

/// A streamed object body, still in its stored encoding.
pub struct BlobBody {
    /// The raw object bytes as an async reader
    pub reader: Pin<Box<dyn AsyncRead + Send>>,

    /// Stored size in bytes
    pub size: u64,

    /// Compression the caller must undo before parsing
    pub compression: Compression,
}

impl std::fmt::Debug for BlobBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobBody")
            .field("reader", &"<dyn AsyncRead>")
            .field("size", &self.size)
            .field("compression", &self.compression)
            .finish()
    }
}

/// Blob read/write capability consumed by the pipeline.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Single-shot streaming read of an object.
    async fn get_stream(&self, bucket: &str, key: &str) -> Result<BlobBody>;

    /// Ranged read of a whole object into memory. `limit` bounds the stored
    /// size; larger objects fail before any data is fetched.
    async fn get_buffered(&self, bucket: &str, key: &str, limit: u64) -> Result<(Bytes, Compression)>;

    /// Streaming multipart write. Drives `body` to EOF and returns the
    /// number of bytes written.
    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        body: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<u64>;
}

/// Connection settings for [`ObjectStoreBlobStore`].
#[derive(Debug, Clone)]
pub struct BlobStoreConfig {
    /// AWS region for bucket access
    pub region: String,

    /// Optional endpoint override (for LocalStack)
    pub endpoint: Option<String>,

    /// Optional static credentials; falls back to anonymous access
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
}

impl BlobStoreConfig {
    /// Create a configuration for the given region.
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            endpoint: None,
            access_key: None,
            secret_key: None,
            session_token: None,
        }
    }

    /// Set the endpoint URL.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set static credentials.
    pub fn with_credentials(
        mut self,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        self.access_key = Some(access_key.into());
        self.secret_key = Some(secret_key.into());
        self.session_token = session_token;
        self
    }
}

/// HTTP client options tuned for bulk object transfer.
fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_pool_max_idle_per_host(100)
        .with_pool_idle_timeout(Duration::from_secs(90))
        // Attempt timeout for a whole download
        .with_timeout(Duration::from_secs(300))
        .with_connect_timeout(Duration::from_secs(10))
}

/// Blob store backed by `object_store`, one client per bucket.
///
/// Clients are cached by bucket name behind a double-checked RwLock so
/// repeated objects from the same bucket share one connection pool.
pub struct ObjectStoreBlobStore {
    config: BlobStoreConfig,
    store_cache: RwLock<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl ObjectStoreBlobStore {
    /// Create a blob store with the given connection settings.
    pub fn new(config: BlobStoreConfig) -> Self {
        Self {
            config,
            store_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Pre-seed the cache with a store for one bucket. Tests use this to
    /// wire in-memory stores; production code never needs it.
    pub fn with_store(self, bucket: &str, store: Arc<dyn ObjectStore>) -> Self {
        self.store_cache
            .write()
            .unwrap()
            .insert(bucket.to_string(), store);
        self
    }

    fn get_or_create_store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        // Fast path: bucket already has a client (read lock)
        {
            let cache = self.store_cache.read().unwrap();
            if let Some(store) = cache.get(bucket) {
                trace!(bucket = bucket, "using cached object store");
                return Ok(Arc::clone(store));
            }
        }

        // Slow path: create a new client (write lock)
        let mut cache = self.store_cache.write().unwrap();

        // Double-check in case another task created it while we waited
        if let Some(store) = cache.get(bucket) {
            return Ok(Arc::clone(store));
        }

        debug!(bucket = bucket, "creating object store client");
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(bucket)
            .with_region(&self.config.region)
            .with_client_options(create_client_options());

        if let (Some(access_key), Some(secret_key)) =
            (&self.config.access_key, &self.config.secret_key)
        {
            builder = builder
                .with_access_key_id(access_key)
                .with_secret_access_key(secret_key);

            if let Some(token) = &self.config.session_token {
                builder = builder.with_token(token);
            }
        } else {
            builder = builder.with_skip_signature(true);
        }

        if let Some(endpoint) = &self.config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(true)
                .with_virtual_hosted_style_request(false);
        }

        let store: Arc<dyn ObjectStore> = Arc::new(builder.build().map_err(|e| {
            FilterError::Source(SourceError::Read(format!(
                "failed to create object store client: {e}"
            )))
        })?);

        cache.insert(bucket.to_string(), Arc::clone(&store));
        Ok(store)
    }
}

fn map_store_error(bucket: &str, key: &str, e: object_store::Error) -> FilterError {
    let location = format!("{bucket}/{key}");
    match e {
        object_store::Error::NotFound { .. } => {
            FilterError::Source(SourceError::NotFound(location))
        }
        other => {
            let message = other.to_string();
            if message.to_lowercase().contains("access denied")
                || message.contains("403")
            {
                FilterError::Source(SourceError::AccessDenied(location))
            } else {
                FilterError::Source(SourceError::Read(format!("{location}: {message}")))
            }
        }
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlobStore {
    async fn get_stream(&self, bucket: &str, key: &str) -> Result<BlobBody> {
        let store = self.get_or_create_store(bucket)?;
        let path = ObjectPath::from(key);

        let result = store
            .get(&path)
            .await
            .map_err(|e| map_store_error(bucket, key, e))?;

        let size = result.meta.size as u64;
        let content_type = result
            .attributes
            .get(&Attribute::ContentType)
            .map(|v| v.as_ref().to_string());
        let compression = Compression::detect(content_type.as_deref(), key);

        debug!(
            bucket = bucket,
            key = key,
            size = size,
            compression = ?compression,
            "opened object stream"
        );

        let stream = result
            .into_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));

        Ok(BlobBody {
            reader: Box::pin(StreamReader::new(stream)),
            size,
            compression,
        })
    }

    async fn get_buffered(&self, bucket: &str, key: &str, limit: u64) -> Result<(Bytes, Compression)> {
        let store = self.get_or_create_store(bucket)?;
        let path = ObjectPath::from(key);

        let meta = store
            .head(&path)
            .await
            .map_err(|e| map_store_error(bucket, key, e))?;

        let size = meta.size;
        if size as u64 > limit {
            return Err(FilterError::Decode(tf_error::DecodeError::SizeLimit {
                actual: size as u64,
                limit,
            }));
        }

        let ranges: Vec<std::ops::Range<usize>> = (0..size)
            .step_by(MULTIPART_PART_SIZE)
            .map(|start| start..(start + MULTIPART_PART_SIZE).min(size))
            .collect();

        debug!(
            bucket = bucket,
            key = key,
            size = size,
            parts = ranges.len(),
            "downloading object in ranged parts"
        );

        let parts: Vec<Bytes> = futures::stream::iter(ranges.into_iter().map(|range| {
            let store = Arc::clone(&store);
            let path = path.clone();
            async move { store.get_range(&path, range).await }
        }))
        .buffered(MULTIPART_CONCURRENCY)
        .try_collect()
        .await
        .map_err(|e| map_store_error(bucket, key, e))?;

        let mut data = BytesMut::with_capacity(size);
        for part in parts {
            data.extend_from_slice(&part);
        }

        Ok((data.freeze(), Compression::from_key(key)))
    }

    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        mut body: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<u64> {
        let store = self.get_or_create_store(bucket)?;
        let path = ObjectPath::from(key);

        let mut opts = PutMultipartOpts::default();
        opts.attributes
            .insert(Attribute::ContentType, "application/x-gzip".into());

        let upload = store.put_multipart_opts(&path, opts).await.map_err(|e| {
            FilterError::Sink(tf_error::SinkError::Upload(format!("{bucket}/{key}: {e}")))
        })?;

        let mut writer = WriteMultipart::new(upload);
        let mut written: u64 = 0;
        let mut chunk = vec![0u8; UPLOAD_CHUNK_SIZE];

        loop {
            let n = body.read(&mut chunk).await.map_err(|e| {
                FilterError::Sink(tf_error::SinkError::Pipe(format!(
                    "reading upload body failed: {e}"
                )))
            })?;
            if n == 0 {
                break;
            }
            writer.write(&chunk[..n]);
            written += n as u64;
        }

        writer.finish().await.map_err(|e| {
            FilterError::Sink(tf_error::SinkError::Upload(format!("{bucket}/{key}: {e}")))
        })?;

        debug!(bucket = bucket, key = key, bytes = written, "upload complete");
        Ok(written)
    }
}

/// Wrap a raw blob body with the decompression it declares.
pub fn decompressed_reader(body: BlobBody) -> Pin<Box<dyn AsyncRead + Send>> {
    match body.compression {
        Compression::None => body.reader,
        Compression::Gzip => Box::pin(async_compression::tokio::bufread::GzipDecoder::new(
            BufReader::with_capacity(8192, body.reader),
        )),
    }
}
