use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ArchiveError, EntryDecodeError};

/// Archive entry path → decoded text content.
pub type FileContentMap = BTreeMap<String, String>;

/// Result of expanding one archive.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodedArchive {
    pub files: FileContentMap,
    /// Non-directory entry paths in archive order (may repeat for malformed archives).
    pub entries: Vec<String>,
    pub entry_errors: Vec<EntryDecodeError>,
}

/// Caps on decompressed output. Header-declared sizes are never trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeLimits {
    pub max_entry_bytes: u64,
    pub max_total_bytes: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        let config = Config::default();
        Self::from_config(&config)
    }
}

impl DecodeLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_entry_bytes: config.max_entry_bytes,
            max_total_bytes: config.max_inflated_bytes.max(config.max_entry_bytes),
        }
    }
}

/// Content stored for an entry that could not be read as text.
pub fn entry_error_marker(err: &EntryDecodeError) -> String {
    format!("[decode error] {}: {}", err.path, err.reason)
}

/// Expands a validated payload into text files with the default limits.
pub fn decode(payload: &[u8]) -> Result<DecodedArchive, ArchiveError> {
    decode_with_limits(payload, DecodeLimits::default())
}

/// Expands a validated payload into text files.
///
/// Fails only when the container itself cannot be opened or the archive as a
/// whole inflates past `limits.max_total_bytes`. Every non-directory member
/// gets a content value: members that cannot be opened (encrypted,
/// unsupported method, bad local header), exceed the per-entry cap or are
/// not UTF-8 get an error marker instead.
pub fn decode_with_limits(payload: &[u8], limits: DecodeLimits) -> Result<DecodedArchive, ArchiveError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(payload))?;
    let mut decoded = DecodedArchive::default();
    let mut inflated: u64 = 0;

    for i in 0..archive.len() {
        // Names come from the central directory, so they are known even when
        // the member itself cannot be opened.
        let Some(path) = archive.name_for_index(i).map(str::to_string) else {
            continue;
        };
        if path.ends_with('/') {
            continue;
        }

        let remaining = limits.max_total_bytes.saturating_sub(inflated);
        let cap = limits.max_entry_bytes.min(remaining);
        let read = match archive.by_index(i) {
            Ok(entry) => read_capped(entry, cap),
            Err(e) => Err(EntryRead::Failed(e.to_string())),
        };

        let content = match read {
            Ok(bytes) => {
                inflated += bytes.len() as u64;
                String::from_utf8(bytes).map_err(|e| e.utf8_error().to_string())
            }
            Err(EntryRead::TooLarge) if remaining < limits.max_entry_bytes => {
                warn!(path = %path, limit = limits.max_total_bytes, kind = "decode", "archive inflates past limit");
                return Err(ArchiveError::Inflate {
                    limit: limits.max_total_bytes,
                });
            }
            Err(EntryRead::TooLarge) => Err(format!("entry exceeds {} bytes", limits.max_entry_bytes)),
            Err(EntryRead::Failed(reason)) => Err(reason),
        };

        let content = content.unwrap_or_else(|reason| {
            let err = EntryDecodeError {
                path: path.clone(),
                reason,
            };
            warn!(path = %err.path, reason = %err.reason, kind = err.kind(), "entry is not readable text");
            let marker = entry_error_marker(&err);
            decoded.entry_errors.push(err);
            marker
        });

        decoded.files.insert(path.clone(), content);
        decoded.entries.push(path);
    }

    debug!(
        files = decoded.files.len(),
        entry_errors = decoded.entry_errors.len(),
        inflated,
        "archive decoded"
    );
    Ok(decoded)
}

enum EntryRead {
    TooLarge,
    Failed(String),
}

/// Reads at most `cap` bytes; one byte more means the entry is too large.
fn read_capped(entry: impl Read, cap: u64) -> Result<Vec<u8>, EntryRead> {
    let mut bytes = Vec::new();
    entry
        .take(cap.saturating_add(1))
        .read_to_end(&mut bytes)
        .map_err(|e| EntryRead::Failed(e.to_string()))?;
    if bytes.len() as u64 > cap {
        return Err(EntryRead::TooLarge);
    }
    Ok(bytes)
}

/// Decodes on the blocking pool; zip inflation is CPU-bound.
pub async fn decode_async(payload: Vec<u8>, limits: DecodeLimits) -> Result<DecodedArchive, ArchiveError> {
    match tokio::task::spawn_blocking(move || decode_with_limits(&payload, limits)).await {
        Ok(result) => result,
        Err(e) => Err(ArchiveError::Decode(zip::result::ZipError::Io(
            std::io::Error::other(e.to_string()),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8])], dirs: &[&str]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for dir in dirs {
            writer.add_directory(*dir, options).unwrap();
        }
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_decodes_text_entries_and_skips_dirs() {
        let payload = build_zip(
            &[("index.html", b"<h1>hi</h1>"), ("scripts/main.js", b"let x = 1;")],
            &["scripts/"],
        );
        let decoded = decode(&payload).unwrap();
        assert_eq!(decoded.files.len(), 2);
        assert_eq!(decoded.files["scripts/main.js"], "let x = 1;");
        assert_eq!(decoded.entries, vec!["index.html", "scripts/main.js"]);
        assert!(decoded.entry_errors.is_empty());
    }

    #[test]
    fn test_non_utf8_entry_is_isolated() {
        let payload = build_zip(&[("logo.png", &[0x89, 0x50, 0xff, 0xfe]), ("a.txt", b"fine")], &[]);
        let decoded = decode(&payload).unwrap();
        assert_eq!(decoded.files["a.txt"], "fine");
        assert_eq!(decoded.entry_errors.len(), 1);
        assert_eq!(decoded.entry_errors[0].path, "logo.png");
        assert!(decoded.files["logo.png"].starts_with("[decode error] logo.png"));
    }

    #[test]
    fn test_encrypted_entry_gets_marker() {
        use zip::unstable::write::FileOptionsExt;

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer.start_file("index.html", SimpleFileOptions::default()).unwrap();
        writer.write_all(b"<p>open</p>").unwrap();
        let locked = FileOptionsExt::with_deprecated_encryption(SimpleFileOptions::default(), b"hunter2");
        writer.start_file("secret.js", locked).unwrap();
        writer.write_all(b"let key = 1;").unwrap();
        let payload = writer.finish().unwrap().into_inner();

        let decoded = decode(&payload).unwrap();
        assert_eq!(decoded.entries, vec!["index.html", "secret.js"]);
        assert_eq!(decoded.files["index.html"], "<p>open</p>");
        assert!(decoded.files["secret.js"].starts_with("[decode error] secret.js"));
        assert_eq!(decoded.entry_errors.len(), 1);
        assert_eq!(decoded.entry_errors[0].path, "secret.js");
    }

    #[test]
    fn test_oversized_entry_is_marked_not_loaded() {
        let big = vec![b'a'; 4096];
        let payload = build_zip(&[("big.txt", &big), ("small.txt", b"ok")], &[]);
        let limits = DecodeLimits {
            max_entry_bytes: 1024,
            max_total_bytes: 1 << 20,
        };
        let decoded = decode_with_limits(&payload, limits).unwrap();
        assert_eq!(decoded.files["small.txt"], "ok");
        assert!(decoded.files["big.txt"].contains("entry exceeds 1024 bytes"));
        assert_eq!(decoded.entry_errors.len(), 1);
    }

    #[test]
    fn test_total_inflate_limit_fails_archive() {
        let chunk = vec![b'x'; 800];
        let payload = build_zip(&[("a.txt", &chunk), ("b.txt", &chunk)], &[]);
        let limits = DecodeLimits {
            max_entry_bytes: 1000,
            max_total_bytes: 1200,
        };
        let err = decode_with_limits(&payload, limits).unwrap_err();
        assert!(matches!(err, ArchiveError::Inflate { limit: 1200 }));
        assert_eq!(err.kind(), "decode");
    }

    #[test]
    fn test_corrupt_container_fails_whole_decode() {
        let err = decode(b"PK\x03\x04 definitely not a zip").unwrap_err();
        assert_eq!(err.kind(), "decode");
    }
}
