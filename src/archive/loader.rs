//! Retry/fallback orchestration for archive loads.
//!
//! [`ArchiveLoader`] owns one locator at a time. Every locator change bumps a
//! generation counter and aborts the in-flight task; results are only
//! published while their generation is still current, so a slow load for an
//! old locator can never overwrite the state of a newer one.
//!
//! State is published through a `watch` channel (what a UI renders) and
//! notable transitions are also sent as [`LoadEvent`]s (what a UI toasts).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::archive::decode::{decode_async, DecodeLimits, DecodedArchive, FileContentMap};
use crate::archive::locator::Locator;
use crate::archive::transport::{Strategy, TransportResolver};
use crate::archive::tree::{build_tree, FileTreeNode};
use crate::archive::validate::validate;
use crate::config::{Config, RetryPolicy};
use crate::error::{ArchiveError, EntryDecodeError};
use crate::templates;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadPhase {
    Idle,
    Loading,
    Retrying,
    Success,
    Failed,
    MockFallback,
}

/// Attempts made for the current locator. Reset whenever the locator changes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryState {
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

/// Everything a view needs to render the project.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadState {
    pub generation: u64,
    pub locator: Option<Locator>,
    pub phase: LoadPhase,
    pub tree: Vec<FileTreeNode>,
    pub files: FileContentMap,
    pub loading: bool,
    pub error: Option<String>,
    pub retry: RetryState,
    pub entry_errors: Vec<EntryDecodeError>,
    pub strategy: Option<Strategy>,
}

impl LoadState {
    fn idle(generation: u64) -> Self {
        Self {
            generation,
            locator: None,
            phase: LoadPhase::Idle,
            tree: Vec::new(),
            files: FileContentMap::new(),
            loading: false,
            error: None,
            retry: RetryState::default(),
            entry_errors: Vec::new(),
            strategy: None,
        }
    }

    fn loading(generation: u64, locator: Locator) -> Self {
        Self {
            locator: Some(locator),
            phase: LoadPhase::Loading,
            loading: true,
            ..Self::idle(generation)
        }
    }

    /// True once the load for this generation has reached a terminal phase.
    pub fn is_settled(&self) -> bool {
        !self.loading
    }
}

/// User-facing notifications emitted during a load.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "event", content = "data")]
pub enum LoadEvent {
    #[serde(rename_all = "camelCase")]
    Started { locator: String },
    #[serde(rename_all = "camelCase")]
    AttemptFailed {
        attempt: u32,
        kind: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Retrying { attempt: u32, delay_ms: u64 },
    #[serde(rename_all = "camelCase")]
    Loaded { file_count: usize, strategy: Strategy },
    Failed { message: String },
    FallbackUsed { message: String },
}

struct LoaderInner {
    resolver: TransportResolver,
    limits: DecodeLimits,
    retry: RetryPolicy,
    fallback_to_mock: bool,
    generation: AtomicU64,
    state: watch::Sender<LoadState>,
    events: Option<mpsc::UnboundedSender<LoadEvent>>,
}

impl LoaderInner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Applies `update` only if `generation` is still the live one.
    fn publish<F>(&self, generation: u64, update: F) -> bool
    where
        F: FnOnce(&mut LoadState),
    {
        self.state.send_if_modified(|state| {
            if !self.is_current(generation) || state.generation != generation {
                return false;
            }
            update(state);
            true
        })
    }

    fn emit(&self, generation: u64, event: LoadEvent) {
        if !self.is_current(generation) {
            return;
        }
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    async fn attempt(&self, locator: &Locator, attempt: u32) -> Result<(DecodedArchive, Strategy), ArchiveError> {
        let payload = self.resolver.resolve(locator, attempt).await?;
        validate(&payload.bytes)?;
        let strategy = payload.strategy;
        let decoded = decode_async(payload.bytes, self.limits).await?;
        Ok((decoded, strategy))
    }

    async fn run(self: Arc<Self>, generation: u64, locator: Locator) {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut retry = RetryState::default();
        self.emit(
            generation,
            LoadEvent::Started {
                locator: locator.to_string(),
            },
        );

        loop {
            match self.attempt(&locator, retry.attempt_count).await {
                Ok((decoded, strategy)) => {
                    // Tree is built only after every entry has been decoded.
                    let tree = build_tree(&decoded.entries);
                    let file_count = decoded.files.len();
                    info!(%locator, files = file_count, %strategy, attempts = retry.attempt_count + 1, "archive loaded");
                    let published = self.publish(generation, |state| {
                        state.phase = LoadPhase::Success;
                        state.tree = tree;
                        state.files = decoded.files;
                        state.entry_errors = decoded.entry_errors;
                        state.loading = false;
                        state.error = None;
                        state.retry = retry.clone();
                        state.strategy = Some(strategy);
                    });
                    if published {
                        self.emit(generation, LoadEvent::Loaded { file_count, strategy });
                    }
                    return;
                }
                Err(e) => {
                    retry.attempt_count += 1;
                    retry.last_error = Some(e.to_string());
                    warn!(%locator, kind = e.kind(), attempt = retry.attempt_count, error = %e, "archive load attempt failed");
                    self.emit(
                        generation,
                        LoadEvent::AttemptFailed {
                            attempt: retry.attempt_count,
                            kind: e.kind().to_string(),
                            message: e.to_string(),
                        },
                    );

                    if retry.attempt_count < max_attempts {
                        let delay = self.retry.delay(retry.attempt_count);
                        let published = self.publish(generation, |state| {
                            state.phase = LoadPhase::Retrying;
                            state.error = Some(e.to_string());
                            state.retry = retry.clone();
                        });
                        if !published {
                            return;
                        }
                        self.emit(
                            generation,
                            LoadEvent::Retrying {
                                attempt: retry.attempt_count + 1,
                                delay_ms: delay.as_millis() as u64,
                            },
                        );
                        tokio::time::sleep(delay).await;
                        if !self.publish(generation, |state| state.phase = LoadPhase::Loading) {
                            return;
                        }
                        continue;
                    }

                    self.fail(generation, &locator, retry, e);
                    return;
                }
            }
        }
    }

    fn fail(&self, generation: u64, locator: &Locator, retry: RetryState, err: ArchiveError) {
        let message = err.to_string();
        error!(%locator, kind = err.kind(), attempts = retry.attempt_count, error = %message, "giving up on archive");
        // Failure and fallback are one update: observers never see a settled
        // Failed state that is about to be replaced.
        let fallback = self.fallback_to_mock.then(templates::fallback_files);
        let published = self.publish(generation, |state| {
            state.loading = false;
            state.error = Some(message.clone());
            state.retry = retry;
            match fallback {
                Some(files) => {
                    state.phase = LoadPhase::MockFallback;
                    state.tree = build_tree(files.keys());
                    state.files = files;
                }
                None => state.phase = LoadPhase::Failed,
            }
        });
        if !published {
            return;
        }
        self.emit(
            generation,
            LoadEvent::Failed {
                message: message.clone(),
            },
        );
        if self.fallback_to_mock {
            warn!(%locator, "using mock project files");
            self.emit(
                generation,
                LoadEvent::FallbackUsed {
                    message: "Using mock files - couldn't load actual game files".into(),
                },
            );
        }
    }
}

/// Drives archive loads for a single view.
pub struct ArchiveLoader {
    inner: Arc<LoaderInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ArchiveLoader {
    pub fn new(config: &Config, resolver: TransportResolver) -> Self {
        Self::build(config, resolver, None)
    }

    /// Like [`ArchiveLoader::new`], additionally streaming [`LoadEvent`]s to `events`.
    pub fn with_events(
        config: &Config,
        resolver: TransportResolver,
        events: mpsc::UnboundedSender<LoadEvent>,
    ) -> Self {
        Self::build(config, resolver, Some(events))
    }

    fn build(config: &Config, resolver: TransportResolver, events: Option<mpsc::UnboundedSender<LoadEvent>>) -> Self {
        let (state, _) = watch::channel(LoadState::idle(0));
        Self {
            inner: Arc::new(LoaderInner {
                resolver,
                limits: DecodeLimits::from_config(config),
                retry: config.retry.clone(),
                fallback_to_mock: config.fallback_to_mock,
                generation: AtomicU64::new(0),
                state,
                events,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LoadState> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> LoadState {
        self.inner.state.borrow().clone()
    }

    /// Switches to a new locator (or to nothing). Any in-flight load is
    /// cancelled and its result discarded. Returns the new generation.
    pub async fn set_locator(&self, locator: Option<Locator>) -> u64 {
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            handle.abort();
        }

        let mut generation = 0;
        self.inner.state.send_modify(|state| {
            generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *state = match &locator {
                Some(l) => LoadState::loading(generation, l.clone()),
                None => LoadState::idle(generation),
            };
        });

        if let Some(locator) = locator {
            info!(%locator, generation, "loading archive");
            let inner = self.inner.clone();
            *task = Some(tokio::spawn(inner.run(generation, locator)));
        }
        generation
    }

    /// Classifies a raw locator string and loads it; empty input clears the view.
    pub async fn set_raw_locator(&self, raw: &str) -> u64 {
        self.set_locator(Locator::parse(raw)).await
    }

    /// Loads the current locator again from scratch.
    pub async fn reload(&self) -> u64 {
        let current = self.inner.state.borrow().locator.clone();
        self.set_locator(current).await
    }

    /// Waits until the load for the latest generation has settled.
    pub async fn settled(&self) -> LoadState {
        let mut rx = self.subscribe();
        let result = rx
            .wait_for(|s| self.inner.is_current(s.generation) && s.is_settled())
            .await
            .map(|s| s.clone());
        match result {
            Ok(state) => state,
            Err(_) => self.snapshot(),
        }
    }

    /// Convenience for one-shot callers: load `locator` and wait for the outcome.
    pub async fn load(&self, locator: Locator) -> LoadState {
        self.set_locator(Some(locator)).await;
        self.settled().await
    }

    /// Stops any in-flight load without changing the published state.
    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}

impl Drop for ArchiveLoader {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.task.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BlobStore, MemoryBlobStore};
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.retry = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        };
        config
    }

    async fn loader_with(store: Arc<MemoryBlobStore>, config: &Config) -> ArchiveLoader {
        let storage: Arc<dyn BlobStore> = store;
        ArchiveLoader::new(config, TransportResolver::new(config, Some(storage)))
    }

    #[tokio::test]
    async fn test_empty_locator_is_idle() {
        let config = fast_config();
        let loader = loader_with(Arc::new(MemoryBlobStore::new()), &config).await;
        loader.set_raw_locator("").await;
        let state = loader.settled().await;
        assert_eq!(state.phase, LoadPhase::Idle);
        assert!(state.tree.is_empty());
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_loads_from_storage_key() {
        let config = fast_config();
        let store = Arc::new(MemoryBlobStore::new());
        store
            .insert("j1.zip", zip_bytes(&[("index.html", "<p>hi</p>"), ("scripts/main.js", "go()")]))
            .await;
        let loader = loader_with(store, &config).await;
        let state = loader.load(Locator::storage_key("j1.zip")).await;
        assert_eq!(state.phase, LoadPhase::Success);
        assert_eq!(state.files["scripts/main.js"], "go()");
        assert_eq!(state.tree[0].name, "scripts");
        assert_eq!(state.retry.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_retry_bound_then_mock_fallback() {
        let config = fast_config();
        let store = Arc::new(MemoryBlobStore::new());
        store.insert("bad.zip", br#"{"error":"job still running"}"#.to_vec()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let storage: Arc<dyn BlobStore> = store;
        let loader = ArchiveLoader::with_events(&config, TransportResolver::new(&config, Some(storage)), tx);

        let state = loader.load(Locator::storage_key("bad.zip")).await;
        assert_eq!(state.phase, LoadPhase::MockFallback);
        assert_eq!(state.retry.attempt_count, 3);
        assert!(state.error.as_deref().unwrap_or_default().contains("invalid ZIP format"));
        assert!(state.files.contains_key("index.html"));
        assert!(state.files.contains_key("main.js"));

        // Events trail the state update, so wait for the last one.
        let mut failures = 0;
        loop {
            let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                LoadEvent::AttemptFailed { kind, .. } => {
                    assert_eq!(kind, "format");
                    failures += 1;
                }
                LoadEvent::FallbackUsed { .. } => break,
                _ => {}
            }
        }
        assert_eq!(failures, 3);
    }

    #[tokio::test]
    async fn test_no_fallback_stays_failed() {
        let mut config = fast_config();
        config.fallback_to_mock = false;
        let loader = loader_with(Arc::new(MemoryBlobStore::new()), &config).await;
        let state = loader.load(Locator::storage_key("missing.zip")).await;
        assert_eq!(state.phase, LoadPhase::Failed);
        assert!(state.tree.is_empty());
        assert!(state.error.is_some());
    }

    #[tokio::test]
    async fn test_same_locator_twice_is_identical() {
        let config = fast_config();
        let store = Arc::new(MemoryBlobStore::new());
        store.insert("j.zip", zip_bytes(&[("b/x.js", "1"), ("a.js", "2")])).await;
        let loader = loader_with(store, &config).await;
        let first = loader.load(Locator::storage_key("j.zip")).await;
        let second = loader.load(Locator::storage_key("j.zip")).await;
        assert_eq!(first.tree, second.tree);
        assert_eq!(first.files, second.files);
        assert!(second.generation > first.generation);
    }
}
