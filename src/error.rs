use serde::Serialize;

use crate::archive::transport::Strategy;

/// How a payload that failed signature validation looks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PayloadKind {
    /// Zero-length body.
    Empty,
    /// Printable text, usually a JSON or HTML error page from upstream.
    TextError,
    /// Bytes that are neither text nor an archive.
    Binary,
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PayloadKind::Empty => "empty payload",
            PayloadKind::TextError => "textual error payload",
            PayloadKind::Binary => "unrelated binary",
        })
    }
}

/// Failures while turning a locator into decoded archive contents.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("could not fetch archive via {strategy}: {reason}")]
    Transport { strategy: Strategy, reason: String },

    #[error("invalid ZIP format ({kind}): {sample}")]
    Format { kind: PayloadKind, sample: String },

    #[error("archive could not be opened: {0}")]
    Decode(#[from] zip::result::ZipError),

    #[error("archive inflates beyond {limit} bytes")]
    Inflate { limit: u64 },
}

impl ArchiveError {
    pub(crate) fn transport(strategy: Strategy, reason: impl Into<String>) -> Self {
        ArchiveError::Transport {
            strategy,
            reason: reason.into(),
        }
    }

    /// Stable name of the taxonomy bucket, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ArchiveError::Transport { .. } => "transport",
            ArchiveError::Format { .. } => "format",
            ArchiveError::Decode(_) | ArchiveError::Inflate { .. } => "decode",
        }
    }
}

/// A single archive member that could not be read as text.
///
/// Recorded alongside the decoded files; never aborts a load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("could not decode {path}: {reason}")]
pub struct EntryDecodeError {
    pub path: String,
    pub reason: String,
}

impl EntryDecodeError {
    pub fn kind(&self) -> &'static str {
        "entry_decode"
    }
}

/// Errors from the blob storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("storage returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("storage is not configured")]
    Unconfigured,
}

/// Errors from the edit overlay store. Both always surface to the caller.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("File not found: {path}")]
    NotFound { project: String, path: String },

    #[error("failed to save {path}: {reason}")]
    Persist { path: String, reason: String },
}

impl OverlayError {
    pub fn kind(&self) -> &'static str {
        match self {
            OverlayError::NotFound { .. } => "not_found",
            OverlayError::Persist { .. } => "persist",
        }
    }
}

/// Errors talking to the remote build service (directly or through the proxy).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("build service request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{endpoint} service error: {status}")]
    Status { endpoint: String, status: u16 },

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("invalid job ID: {0:?}")]
    InvalidJobId(String),

    #[error("unexpected response from build service: {0}")]
    InvalidResponse(String),
}

/// All errors that can cross the library boundary.
#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Zip extraction error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("{0}")]
    Custom(String),
}

// UI layers only ever see the human-readable message.
impl Serialize for CanvasError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CanvasError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_message() {
        let err = CanvasError::from(OverlayError::NotFound {
            project: "p1".into(),
            path: "main.js".into(),
        });
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"File not found: main.js\"");
    }

    #[test]
    fn test_kinds() {
        let format = ArchiveError::Format {
            kind: PayloadKind::TextError,
            sample: "{\"error\":\"x\"}".into(),
        };
        assert_eq!(format.kind(), "format");
        assert_eq!(
            ArchiveError::transport(Strategy::Direct, "boom").kind(),
            "transport"
        );
        let persist = OverlayError::Persist {
            path: "a".into(),
            reason: "b".into(),
        };
        assert_eq!(persist.kind(), "persist");
    }
}
