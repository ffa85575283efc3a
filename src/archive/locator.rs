//! Archive locators.
//!
//! Raw locator strings are classified exactly once, at the boundary where they
//! enter the crate. Everything downstream matches on [`Locator`] instead of
//! sniffing substrings again.

use serde::{Deserialize, Serialize};

use crate::util::is_valid_job_id;

/// Path marker of a proxy-routed job download.
pub const DOWNLOAD_MARKER: &str = "/download/";

/// Path fragments that identify a pre-signed storage URL.
const SIGNED_MARKERS: [&str; 2] = ["/object/sign/", "token="];

/// Where an archive can be retrieved from.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Locator {
    /// A build job whose download URL is handed out by the proxy layer.
    /// `base` is the origin the locator was written against, if it had one.
    #[serde(rename_all = "camelCase")]
    Proxy {
        job_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base: Option<String>,
    },
    /// An absolute HTTP(S) URL.
    DirectUrl { url: String },
    /// A pre-signed storage URL (possibly relative to the storage host).
    SignedUrl { url: String },
    /// A key inside the storage bucket.
    StorageKey { key: String },
}

impl Locator {
    /// Classifies a raw locator string. First match wins:
    /// proxy download path, absolute URL, signed URL, bare storage key.
    ///
    /// Returns `None` for empty input; an empty locator means "nothing to load".
    pub fn parse(raw: &str) -> Option<Locator> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if let Some(idx) = raw.find(DOWNLOAD_MARKER) {
            let job_id = raw[idx + DOWNLOAD_MARKER.len()..]
                .split(['/', '?', '#'])
                .next()
                .unwrap_or_default();
            if is_valid_job_id(job_id) {
                let prefix = &raw[..idx];
                let base = (prefix.starts_with("http://") || prefix.starts_with("https://"))
                    .then(|| prefix.trim_end_matches('/').to_string());
                return Some(Locator::Proxy {
                    job_id: job_id.to_string(),
                    base,
                });
            }
        }

        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Some(Locator::DirectUrl {
                url: raw.to_string(),
            });
        }

        if SIGNED_MARKERS.iter().any(|m| raw.contains(m)) {
            return Some(Locator::SignedUrl {
                url: raw.to_string(),
            });
        }

        Some(Locator::StorageKey {
            key: raw.trim_start_matches('/').to_string(),
        })
    }

    pub fn proxy(job_id: impl Into<String>) -> Locator {
        Locator::Proxy {
            job_id: job_id.into(),
            base: None,
        }
    }

    /// A job locator that remembers the origin serving it.
    pub fn proxy_at(base: impl Into<String>, job_id: impl Into<String>) -> Locator {
        Locator::Proxy {
            job_id: job_id.into(),
            base: Some(base.into()),
        }
    }

    pub fn storage_key(key: impl Into<String>) -> Locator {
        Locator::StorageKey { key: key.into() }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Locator::Proxy { job_id, base: None } => write!(f, "job:{job_id}"),
            Locator::Proxy {
                job_id,
                base: Some(base),
            } => write!(f, "{base}{DOWNLOAD_MARKER}{job_id}"),
            Locator::DirectUrl { url } | Locator::SignedUrl { url } => f.write_str(url),
            Locator::StorageKey { key } => write!(f, "storage:{key}"),
        }
    }
}
