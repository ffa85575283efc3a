//! Blob storage used for archives and edit overlays.
//!
//! [`HttpBlobStore`] talks to a Supabase-compatible storage REST API;
//! [`MemoryBlobStore`] keeps objects in process and backs tests and offline use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::util::{join_key, trim_base};

#[derive(Clone, Debug, Default)]
pub struct UploadOptions {
    /// Overwrite an existing object instead of failing.
    pub upsert: bool,
    pub content_type: Option<String>,
}

impl UploadOptions {
    pub fn upsert_text() -> Self {
        Self {
            upsert: true,
            content_type: Some("text/plain".into()),
        }
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn upload(&self, key: &str, bytes: Vec<u8>, options: UploadOptions) -> Result<(), StorageError>;

    /// Returns an absolute URL granting read access for `ttl_secs`.
    async fn create_signed_url(&self, key: &str, ttl_secs: u64) -> Result<String, StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.download(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Turns a signed URL that is relative to the storage host into an absolute one.
    fn absolute_url(&self, url: &str) -> String {
        url.to_string()
    }
}

// ── HTTP ────────────────────────────────────────────────────────────────────

pub struct HttpBlobStore {
    http: reqwest::Client,
    base: String,
    api_key: String,
    bucket: String,
}

#[derive(Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL", alias = "signedUrl")]
    signed_url: String,
}

impl HttpBlobStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(http: reqwest::Client, config: &StorageConfig) -> Self {
        Self {
            http,
            base: format!("{}/storage/v1", trim_base(&config.url)),
            api_key: config.api_key.clone(),
            bucket: config.bucket.clone(),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/object/{}", self.base, join_key(&[&self.bucket, key]))
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.api_key).header("apikey", &self.api_key)
    }

    async fn check(key: &str, response: reqwest::Response) -> Result<reqwest::Response, StorageError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        // The storage API reports missing objects as 404, or 400 with a not_found body.
        let missing = status == reqwest::StatusCode::NOT_FOUND
            || (status == reqwest::StatusCode::BAD_REQUEST
                && (body.contains("not_found") || body.contains("not found")));
        if missing {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Err(StorageError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        debug!(key, "storage download");
        let response = self.authorized(self.http.get(self.object_url(key))).send().await?;
        let response = Self::check(key, response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn upload(&self, key: &str, bytes: Vec<u8>, options: UploadOptions) -> Result<(), StorageError> {
        debug!(key, size = bytes.len(), upsert = options.upsert, "storage upload");
        let content_type = options
            .content_type
            .unwrap_or_else(|| "application/octet-stream".into());
        let request = self
            .authorized(self.http.post(self.object_url(key)))
            .header("x-upsert", if options.upsert { "true" } else { "false" })
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        let response = request.send().await?;
        Self::check(key, response).await?;
        Ok(())
    }

    async fn create_signed_url(&self, key: &str, ttl_secs: u64) -> Result<String, StorageError> {
        let url = format!("{}/object/sign/{}", self.base, join_key(&[&self.bucket, key]));
        let response = self
            .authorized(self.http.post(url))
            .json(&serde_json::json!({ "expiresIn": ttl_secs }))
            .send()
            .await?;
        let response = Self::check(key, response).await?;
        let signed: SignedUrlResponse = response.json().await?;
        Ok(self.absolute_url(&signed.signed_url))
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let url = format!("{}/object/{}", self.base, self.bucket);
        let response = self
            .authorized(self.http.delete(url))
            .json(&serde_json::json!({ "prefixes": [key] }))
            .send()
            .await?;
        Self::check(key, response).await?;
        Ok(())
    }

    fn absolute_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base, url.trim_start_matches('/'))
        }
    }
}

// ── Memory ──────────────────────────────────────────────────────────────────

/// In-process object store. Signed URLs point at `signed_base`, so a test
/// server can serve them.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    signed_base: Option<String>,
    read_only: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signed_base(base: impl Into<String>) -> Self {
        Self {
            signed_base: Some(base.into()),
            ..Self::default()
        }
    }

    /// Makes every later upload fail, simulating a rejected write.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub async fn insert(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        self.objects.write().await.insert(join_key(&[key]), bytes.into());
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .await
            .get(&join_key(&[key]))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn upload(&self, key: &str, bytes: Vec<u8>, options: UploadOptions) -> Result<(), StorageError> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StorageError::Status {
                status: 403,
                body: "bucket is read-only".into(),
            });
        }
        let key = join_key(&[key]);
        let mut objects = self.objects.write().await;
        if !options.upsert && objects.contains_key(&key) {
            return Err(StorageError::Status {
                status: 409,
                body: format!("{key} already exists"),
            });
        }
        objects.insert(key, bytes);
        Ok(())
    }

    async fn create_signed_url(&self, key: &str, ttl_secs: u64) -> Result<String, StorageError> {
        if !self.objects.read().await.contains_key(&join_key(&[key])) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let base = self.signed_base.as_deref().ok_or(StorageError::Unconfigured)?;
        Ok(format!(
            "{}/object/sign/{}?token=memory&expires={ttl_secs}",
            trim_base(base),
            join_key(&[key])
        ))
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.objects.write().await.remove(&join_key(&[key]));
        Ok(())
    }
}
