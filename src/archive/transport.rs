use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::archive::locator::{Locator, DOWNLOAD_MARKER};
use crate::config::Config;
use crate::error::{ArchiveError, StorageError};
use crate::storage::BlobStore;
use crate::util::{is_valid_job_id, join_key, trim_base};

/// One way of obtaining archive bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Strategy {
    /// Ask the proxy for the job's download URL, then fetch it.
    ProxyResolved,
    /// Fetch `{buildServiceUrl}/download/{jobId}` without the proxy.
    BuildService,
    /// Plain GET of an absolute or signed URL, or of a job URL's own origin.
    Direct,
    /// Download through the storage API.
    Storage,
    /// Sign the storage key and GET the signed URL.
    SignedStorage,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Strategy::ProxyResolved => "proxy",
            Strategy::BuildService => "build-service",
            Strategy::Direct => "direct",
            Strategy::Storage => "storage",
            Strategy::SignedStorage => "signed-storage",
        })
    }
}

/// Raw archive bytes plus the strategy that produced them.
#[derive(Clone, Debug)]
pub struct ArchivePayload {
    pub bytes: Vec<u8>,
    pub strategy: Strategy,
}

impl ArchivePayload {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Deserialize)]
struct DownloadUrlResponse {
    download: Option<String>,
    error: Option<String>,
}

/// Turns locators into archive bytes. Performs network calls only; nothing is cached.
pub struct TransportResolver {
    http: reqwest::Client,
    storage: Option<Arc<dyn BlobStore>>,
    proxy_url: Option<String>,
    build_service_url: Option<String>,
    signed_url_ttl_secs: u64,
    max_archive_bytes: u64,
}

impl TransportResolver {
    pub fn new(config: &Config, storage: Option<Arc<dyn BlobStore>>) -> Self {
        Self {
            http: reqwest::Client::new(),
            storage,
            proxy_url: config.proxy_url.clone(),
            build_service_url: config.build_service_url.clone(),
            signed_url_ttl_secs: config.signed_url_ttl_secs,
            max_archive_bytes: config.max_archive_bytes,
        }
    }

    /// Ordered strategies for a locator, skipping ones that are not configured.
    /// When nothing applies the preferred strategy is kept so its error surfaces.
    pub fn strategies(&self, locator: &Locator) -> Vec<Strategy> {
        let candidates: &[Strategy] = match locator {
            Locator::Proxy { .. } => &[Strategy::ProxyResolved, Strategy::Direct, Strategy::BuildService],
            Locator::DirectUrl { .. } | Locator::SignedUrl { .. } => &[Strategy::Direct],
            Locator::StorageKey { .. } => &[Strategy::Storage, Strategy::SignedStorage],
        };
        let usable: Vec<Strategy> = candidates
            .iter()
            .copied()
            .filter(|s| self.is_configured(*s, locator))
            .collect();
        if usable.is_empty() {
            candidates[..1].to_vec()
        } else {
            usable
        }
    }

    fn is_configured(&self, strategy: Strategy, locator: &Locator) -> bool {
        let has_base = matches!(locator, Locator::Proxy { base: Some(_), .. });
        match strategy {
            Strategy::ProxyResolved => self.proxy_url.is_some() || has_base,
            Strategy::BuildService => self.build_service_url.is_some(),
            Strategy::Direct => !matches!(locator, Locator::Proxy { .. }) || has_base,
            Strategy::Storage | Strategy::SignedStorage => self.storage.is_some(),
        }
    }

    /// Tries every strategy for the locator, starting at `attempt` positions
    /// into the list so repeated attempts lead with a different transport.
    /// Returns the first payload fetched; otherwise the last failure.
    pub async fn resolve(&self, locator: &Locator, attempt: u32) -> Result<ArchivePayload, ArchiveError> {
        let mut strategies = self.strategies(locator);
        let shift = attempt as usize % strategies.len();
        strategies.rotate_left(shift);

        let mut last_err = None;
        for strategy in strategies {
            match self.fetch_with(strategy, locator).await {
                Ok(bytes) => {
                    info!(%locator, %strategy, size = bytes.len(), "archive fetched");
                    return Ok(ArchivePayload { bytes, strategy });
                }
                Err(e) => {
                    warn!(%locator, %strategy, kind = e.kind(), error = %e, "transport strategy failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ArchiveError::transport(Strategy::Direct, "no transport available")))
    }

    async fn fetch_with(&self, strategy: Strategy, locator: &Locator) -> Result<Vec<u8>, ArchiveError> {
        if let Locator::Proxy { job_id, .. } = locator {
            if !is_valid_job_id(job_id) {
                return Err(ArchiveError::transport(strategy, format!("invalid job ID: {job_id:?}")));
            }
        }

        match (strategy, locator) {
            (Strategy::ProxyResolved, Locator::Proxy { job_id, base }) => {
                // A configured proxy wins over the origin the locator came from.
                let proxy = self.proxy_url.as_deref().or(base.as_deref());
                let url = self.resolve_via_proxy(proxy, job_id).await?;
                self.fetch_url(strategy, &url).await
            }
            (Strategy::Direct, Locator::Proxy { job_id, base: Some(base) }) => {
                let url = format!("{}{DOWNLOAD_MARKER}{job_id}", trim_base(base));
                self.fetch_url(strategy, &url).await
            }
            (Strategy::BuildService, Locator::Proxy { job_id, .. }) => {
                let base = self
                    .build_service_url
                    .as_deref()
                    .ok_or_else(|| ArchiveError::transport(strategy, "build service URL is not configured"))?;
                let url = format!("{}/download/{job_id}", trim_base(base));
                self.fetch_url(strategy, &url).await
            }
            (Strategy::Direct, Locator::DirectUrl { url }) => self.fetch_url(strategy, url).await,
            (Strategy::Direct, Locator::SignedUrl { url }) => {
                let url = match &self.storage {
                    Some(storage) => storage.absolute_url(url),
                    None => url.clone(),
                };
                self.fetch_url(strategy, &url).await
            }
            (Strategy::Storage, Locator::StorageKey { key }) => {
                let storage = self.storage_for(strategy)?;
                let bytes = storage
                    .download(key)
                    .await
                    .map_err(|e| ArchiveError::transport(strategy, e.to_string()))?;
                let limit = self.max_archive_bytes;
                if bytes.len() as u64 > limit {
                    return Err(ArchiveError::transport(
                        strategy,
                        format!("archive exceeds {limit} bytes"),
                    ));
                }
                Ok(bytes)
            }
            (Strategy::SignedStorage, Locator::StorageKey { key }) => {
                let storage = self.storage_for(strategy)?;
                let url = storage
                    .create_signed_url(key, self.signed_url_ttl_secs)
                    .await
                    .map_err(|e| ArchiveError::transport(strategy, e.to_string()))?;
                self.fetch_url(strategy, &url).await
            }
            (strategy, locator) => Err(ArchiveError::transport(
                strategy,
                format!("strategy does not apply to {locator}"),
            )),
        }
    }

    fn storage_for(&self, strategy: Strategy) -> Result<&Arc<dyn BlobStore>, ArchiveError> {
        self.storage
            .as_ref()
            .ok_or_else(|| ArchiveError::transport(strategy, StorageError::Unconfigured.to_string()))
    }

    /// Asks the proxy layer for the real download URL of a job.
    pub async fn proxy_download_url(&self, job_id: &str) -> Result<String, ArchiveError> {
        self.resolve_via_proxy(self.proxy_url.as_deref(), job_id).await
    }

    async fn resolve_via_proxy(&self, base: Option<&str>, job_id: &str) -> Result<String, ArchiveError> {
        let strategy = Strategy::ProxyResolved;
        let base = base.ok_or_else(|| ArchiveError::transport(strategy, "proxy URL is not configured"))?;
        let base = trim_base(base);

        let response = self
            .http
            .get(format!("{base}{DOWNLOAD_MARKER}{job_id}"))
            .send()
            .await
            .map_err(|e| ArchiveError::transport(strategy, e.to_string()))?;
        let status = response.status();
        let body: DownloadUrlResponse = response
            .json()
            .await
            .map_err(|e| ArchiveError::transport(strategy, format!("HTTP {status}: {e}")))?;

        match (status.is_success(), body.download, body.error) {
            (true, Some(url), _) if !url.is_empty() => {
                debug!(job_id, %url, "proxy resolved download URL");
                if url.starts_with('/') {
                    Ok(format!("{base}{url}"))
                } else {
                    Ok(url)
                }
            }
            (_, _, Some(error)) => Err(ArchiveError::transport(strategy, format!("HTTP {status}: {error}"))),
            _ => Err(ArchiveError::transport(
                strategy,
                format!("HTTP {status}: response has no download URL"),
            )),
        }
    }

    /// GETs a URL, treating any non-success status as a transport failure
    /// and enforcing the archive size limit while streaming.
    async fn fetch_url(&self, strategy: Strategy, url: &str) -> Result<Vec<u8>, ArchiveError> {
        debug!(%strategy, url, "fetching archive");
        let response = self
            .http
            .get(url)
            .header(reqwest::header::ACCEPT, "application/zip, application/octet-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()
            .await
            .map_err(|e| ArchiveError::transport(strategy, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ArchiveError::transport(
                strategy,
                format!("Failed to fetch ZIP file: HTTP {status} from {url}"),
            ));
        }

        let limit = self.max_archive_bytes;
        if response.content_length().is_some_and(|len| len > limit) {
            return Err(ArchiveError::transport(
                strategy,
                format!("archive exceeds {limit} bytes"),
            ));
        }

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ArchiveError::transport(strategy, e.to_string()))?;
            if bytes.len() as u64 + chunk.len() as u64 > limit {
                return Err(ArchiveError::transport(
                    strategy,
                    format!("archive exceeds {limit} bytes"),
                ));
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }

    /// Finds a locator for a job: a signed URL for `{jobId}.zip` in storage,
    /// then the proxy's download URL, then the bare proxy job locator.
    pub async fn discover_locator(&self, job_id: &str) -> Locator {
        if let Some(storage) = &self.storage {
            let key = join_key(&[&format!("{job_id}.zip")]);
            match storage.create_signed_url(&key, self.signed_url_ttl_secs).await {
                Ok(url) => {
                    info!(job_id, "using signed storage URL");
                    return Locator::SignedUrl { url };
                }
                Err(e) => debug!(job_id, error = %e, "no signed URL for job archive"),
            }
        }

        if self.proxy_url.is_some() {
            match self.proxy_download_url(job_id).await {
                Ok(url) => {
                    info!(job_id, %url, "using proxy download URL");
                    return Locator::DirectUrl { url };
                }
                Err(e) => debug!(job_id, error = %e, "proxy could not resolve download URL"),
            }
        }

        Locator::proxy(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlobStore;

    #[test]
    fn test_strategy_order() {
        let mut config = Config::default();
        config.proxy_url = Some("http://proxy".into());
        config.build_service_url = Some("http://builds".into());
        let storage: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let resolver = TransportResolver::new(&config, Some(storage));

        assert_eq!(
            resolver.strategies(&Locator::proxy("j")),
            vec![Strategy::ProxyResolved, Strategy::BuildService]
        );
        assert_eq!(
            resolver.strategies(&Locator::proxy_at("http://origin", "j")),
            vec![Strategy::ProxyResolved, Strategy::Direct, Strategy::BuildService]
        );
        assert_eq!(
            resolver.strategies(&Locator::storage_key("j.zip")),
            vec![Strategy::Storage, Strategy::SignedStorage]
        );
    }

    #[test]
    fn test_unconfigured_strategies_are_skipped() {
        let mut config = Config::default();
        config.build_service_url = Some("http://builds".into());
        let resolver = TransportResolver::new(&config, None);
        assert_eq!(resolver.strategies(&Locator::proxy("j")), vec![Strategy::BuildService]);
        assert_eq!(resolver.strategies(&Locator::storage_key("k")), vec![Strategy::Storage]);

        let bare = TransportResolver::new(&Config::default(), None);
        assert_eq!(
            bare.strategies(&Locator::proxy_at("http://origin", "j")),
            vec![Strategy::ProxyResolved, Strategy::Direct]
        );
    }

    #[tokio::test]
    async fn test_oversized_storage_object_is_transport_error() {
        let store = Arc::new(MemoryBlobStore::new());
        let mut archive = b"PK\x03\x04".to_vec();
        archive.resize(138, 0);
        store.insert("jobs/big.zip", archive).await;
        let storage: Arc<dyn BlobStore> = store;
        let mut config = Config::default();
        config.max_archive_bytes = 64;
        let resolver = TransportResolver::new(&config, Some(storage));

        let err = resolver.resolve(&Locator::storage_key("jobs/big.zip"), 0).await.unwrap_err();
        assert_eq!(err.kind(), "transport");
        assert!(err.to_string().contains("archive exceeds 64 bytes"), "{err}");
    }

    #[tokio::test]
    async fn test_unsafe_job_id_is_refused_before_any_request() {
        let mut config = Config::default();
        config.build_service_url = Some("http://127.0.0.1:9".into());
        let resolver = TransportResolver::new(&config, None);
        let err = resolver.resolve(&Locator::proxy("../run"), 0).await.unwrap_err();
        assert!(err.to_string().contains("invalid job ID"), "{err}");
    }

    #[tokio::test]
    async fn test_storage_key_resolves_from_store() {
        let store = Arc::new(MemoryBlobStore::new());
        store.insert("jobs/j1.zip", b"PK\x03\x04".to_vec()).await;
        let storage: Arc<dyn BlobStore> = store;
        let resolver = TransportResolver::new(&Config::default(), Some(storage));
        let payload = resolver.resolve(&Locator::storage_key("jobs/j1.zip"), 0).await.unwrap();
        assert_eq!(payload.strategy, Strategy::Storage);
        assert_eq!(payload.len(), 4);
    }

    #[tokio::test]
    async fn test_missing_storage_key_is_transport_error() {
        let storage: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let resolver = TransportResolver::new(&Config::default(), Some(storage));
        let err = resolver.resolve(&Locator::storage_key("nope.zip"), 0).await.unwrap_err();
        assert_eq!(err.kind(), "transport");
    }

    #[tokio::test]
    async fn test_discover_falls_back_to_job_locator() {
        let resolver = TransportResolver::new(&Config::default(), None);
        assert_eq!(resolver.discover_locator("j9").await, Locator::proxy("j9"));
    }
}
