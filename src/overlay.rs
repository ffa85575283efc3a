//! Per-project edit overlay.
//!
//! User edits are stored as whole-file objects under `edits/{project}/{path}`
//! and shadow the archive-backed original. Reads resolve, in order:
//!
//! 1. the overlay object in blob storage,
//! 2. the original content attached from the last archive load,
//!    then `projects/{project}/{path}` in storage,
//! 3. `{localRoot}/{project}/{path}` on disk.
//!
//! Nothing is cached on the client side: every `load` reads through and every
//! `save` writes through, so saves are immediately visible to later loads.
//!
//! A project id is exactly one key segment and a file path is a `/`-separated
//! list of real names, so no two `(project, path)` pairs share a key.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::archive::decode::FileContentMap;
use crate::error::{OverlayError, StorageError};
use crate::storage::{BlobStore, UploadOptions};

pub const EDITS_PREFIX: &str = "edits";
pub const PROJECTS_PREFIX: &str = "projects";

/// Which layer a loaded file came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentSource {
    Overlay,
    Archive,
    StoredOriginal,
    Local,
}

pub struct EditOverlayStore {
    storage: Arc<dyn BlobStore>,
    originals: RwLock<HashMap<String, Arc<FileContentMap>>>,
    local_root: Option<PathBuf>,
}

impl EditOverlayStore {
    pub fn new(storage: Arc<dyn BlobStore>) -> Self {
        Self {
            storage,
            originals: RwLock::new(HashMap::new()),
            local_root: None,
        }
    }

    pub fn with_local_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.local_root = Some(root.into());
        self
    }

    /// Storage key of the edit for `path`, or `None` if the pair is not addressable.
    pub fn overlay_key(project: &str, path: &str) -> Option<String> {
        scoped_key(EDITS_PREFIX, project, path).ok()
    }

    /// Registers the archive contents of a project instance as its originals.
    /// The map is shared read-only; saves never touch it.
    pub async fn attach_original(&self, project: &str, files: FileContentMap) {
        self.originals
            .write()
            .await
            .insert(project.to_string(), Arc::new(files));
    }

    pub async fn detach_original(&self, project: &str) {
        self.originals.write().await.remove(project);
    }

    pub async fn load(&self, project: &str, path: &str) -> Result<String, OverlayError> {
        self.load_with_source(project, path).await.map(|(text, _)| text)
    }

    pub async fn load_with_source(&self, project: &str, path: &str) -> Result<(String, ContentSource), OverlayError> {
        let not_found = || OverlayError::NotFound {
            project: project.to_string(),
            path: path.to_string(),
        };

        let key = match scoped_key(EDITS_PREFIX, project, path) {
            Ok(key) => key,
            Err(reason) => {
                let err = not_found();
                warn!(project, path, reason, kind = err.kind(), "refusing unscoped read");
                return Err(err);
            }
        };

        if let Some(text) = self.fetch_text(&key).await {
            debug!(project, path, "loaded edited file");
            return Ok((text, ContentSource::Overlay));
        }

        let original = self
            .originals
            .read()
            .await
            .get(project)
            .and_then(|files| files.get(path).cloned());
        if let Some(text) = original {
            return Ok((text, ContentSource::Archive));
        }

        if let Ok(key) = scoped_key(PROJECTS_PREFIX, project, path) {
            if let Some(text) = self.fetch_text(&key).await {
                return Ok((text, ContentSource::StoredOriginal));
            }
        }

        if let Some(text) = self.read_local(project, path).await {
            return Ok((text, ContentSource::Local));
        }

        let err = not_found();
        warn!(project, path, kind = err.kind(), "file not found in any layer");
        Err(err)
    }

    /// Overwrites the overlay for `path` with the full `text`. Last write wins.
    pub async fn save(&self, project: &str, path: &str, text: &str) -> Result<(), OverlayError> {
        let key = scoped_key(EDITS_PREFIX, project, path).map_err(|reason| OverlayError::Persist {
            path: path.to_string(),
            reason: reason.to_string(),
        })?;
        match self
            .storage
            .upload(&key, text.as_bytes().to_vec(), UploadOptions::upsert_text())
            .await
        {
            Ok(()) => {
                info!(project, path, size = text.len(), "saved edit");
                Ok(())
            }
            Err(e) => {
                let err = OverlayError::Persist {
                    path: path.to_string(),
                    reason: e.to_string(),
                };
                warn!(project, path, kind = err.kind(), error = %e, "save failed");
                Err(err)
            }
        }
    }

    pub async fn has_edit(&self, project: &str, path: &str) -> bool {
        let Some(key) = Self::overlay_key(project, path) else {
            return false;
        };
        matches!(self.storage.exists(&key).await, Ok(true))
    }

    async fn fetch_text(&self, key: &str) -> Option<String> {
        match self.storage.download(key).await {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(StorageError::NotFound(_)) => None,
            Err(e) => {
                warn!(key, error = %e, "storage read failed, trying next layer");
                None
            }
        }
    }

    async fn read_local(&self, project: &str, path: &str) -> Option<String> {
        let root = self.local_root.as_ref()?;
        let relative = Path::new(project).join(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            warn!(project, path, "refusing local read outside the project root");
            return None;
        }
        tokio::fs::read_to_string(root.join(relative)).await.ok()
    }
}

/// `{prefix}/{project}/{path}` after checking both parts are unambiguous.
fn scoped_key(prefix: &str, project: &str, path: &str) -> Result<String, &'static str> {
    if project.is_empty() || project == "." || project == ".." {
        return Err("invalid project id");
    }
    if project.contains(['/', '\\']) || project.chars().any(char::is_control) {
        return Err("invalid project id");
    }
    if path.is_empty() {
        return Err("empty path");
    }
    if path.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
        return Err("invalid path");
    }
    Ok(format!("{prefix}/{project}/{path}"))
}
