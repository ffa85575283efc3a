use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CanvasError, Result};
use crate::util::expand_tilde;

pub const DEFAULT_BUCKET: &str = "game-builds";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8787";

/// Connection details for the blob storage service.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    pub url: String,
    pub api_key: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

/// Bounded exponential backoff between archive load attempts.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Failed attempts tolerated before the loader gives up.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_delay_ms: 8000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LogPollConfig {
    pub interval_ms: u64,
    pub error_interval_ms: u64,
}

impl Default for LogPollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            error_interval_ms: 5000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub build_service_url: Option<String>,
    pub proxy_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,
    pub listen: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_root: Option<String>,
    pub retry: RetryPolicy,
    pub signed_url_ttl_secs: u64,
    pub max_archive_bytes: u64,
    /// Largest decoded size accepted for a single archive member.
    pub max_entry_bytes: u64,
    /// Largest decoded size accepted for a whole archive.
    pub max_inflated_bytes: u64,
    pub fallback_to_mock: bool,
    pub log_poll: LogPollConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            build_service_url: None,
            proxy_url: None,
            storage: None,
            listen: DEFAULT_LISTEN.to_string(),
            local_root: None,
            retry: RetryPolicy::default(),
            signed_url_ttl_secs: 3600,
            max_archive_bytes: 100 * 1024 * 1024,
            max_entry_bytes: 32 * 1024 * 1024,
            max_inflated_bytes: 256 * 1024 * 1024,
            fallback_to_mock: true,
            log_poll: LogPollConfig::default(),
        }
    }
}

fn default_bucket() -> String {
    DEFAULT_BUCKET.to_string()
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".canvascraft").join("config.json"))
}

impl Config {
    /// Loads `~/.canvascraft/config.json` and applies environment overrides.
    pub fn load() -> Config {
        let config = config_path()
            .and_then(|p| Self::read_file(&p).ok())
            .unwrap_or_default();
        config.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn read_file(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Applies overrides from a variable lookup (normally the process environment).
    pub fn with_overrides<F>(mut self, lookup: F) -> Config
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| keys.iter().find_map(|k| lookup(k).filter(|v| !v.is_empty()));

        if let Some(url) = first(&["CANVASCRAFT_BUILD_URL", "RENDER_URL"]) {
            self.build_service_url = Some(url);
        }
        if let Some(url) = first(&["CANVASCRAFT_PROXY_URL"]) {
            self.proxy_url = Some(url);
        }
        if let Some(listen) = first(&["CANVASCRAFT_LISTEN"]) {
            self.listen = listen;
        }
        if let Some(root) = first(&["CANVASCRAFT_LOCAL_ROOT"]) {
            self.local_root = Some(root);
        }

        let url = first(&["SUPABASE_URL"]);
        let key = first(&["SUPABASE_SERVICE_ROLE_KEY", "SUPABASE_KEY"]);
        let bucket = first(&["CANVASCRAFT_BUCKET"]);
        if let Some(storage) = self.storage.as_mut() {
            if let Some(url) = url {
                storage.url = url;
            }
            if let Some(key) = key {
                storage.api_key = key;
            }
        } else if let (Some(url), Some(api_key)) = (url, key) {
            self.storage = Some(StorageConfig {
                url,
                api_key,
                bucket: default_bucket(),
            });
        }
        if let (Some(storage), Some(bucket)) = (self.storage.as_mut(), bucket) {
            storage.bucket = bucket;
        }

        if let Some(root) = self.local_root.take() {
            self.local_root = Some(expand_tilde(&root));
        }
        self
    }

    pub fn require_build_service_url(&self) -> Result<&str> {
        self.build_service_url
            .as_deref()
            .ok_or_else(|| CanvasError::Custom("build service URL is not configured (set RENDER_URL)".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.log_poll.interval_ms, 2000);
        assert_eq!(config.log_poll.error_interval_ms, 5000);
        assert!(config.fallback_to_mock);
        assert!(config.max_entry_bytes <= config.max_inflated_bytes);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(2000));
        assert_eq!(policy.delay(2), Duration::from_millis(4000));
        assert_eq!(policy.delay(3), Duration::from_millis(8000));
        assert_eq!(policy.delay(30), Duration::from_millis(8000));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"buildServiceUrl":"https://builds.example","retry":{"maxAttempts":5}}"#)
                .unwrap();
        assert_eq!(config.build_service_url.as_deref(), Some("https://builds.example"));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 2000);
        assert_eq!(config.listen, DEFAULT_LISTEN);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("RENDER_URL", "https://render.example"),
            ("SUPABASE_URL", "https://db.example"),
            ("SUPABASE_KEY", "secret"),
            ("CANVASCRAFT_BUCKET", "games"),
        ]
        .into_iter()
        .collect();
        let config = Config::default().with_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.build_service_url.as_deref(), Some("https://render.example"));
        let storage = config.storage.unwrap();
        assert_eq!(storage.url, "https://db.example");
        assert_eq!(storage.api_key, "secret");
        assert_eq!(storage.bucket, "games");
    }

    #[test]
    fn test_save_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.proxy_url = Some("http://localhost:8787".into());
        config.save(&path).unwrap();
        assert_eq!(Config::read_file(&path).unwrap(), config);
    }
}
