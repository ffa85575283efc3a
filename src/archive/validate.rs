use crate::error::{ArchiveError, PayloadKind};
use crate::util::text_sample;

/// Local file header signature every ZIP container starts with.
pub const ZIP_MAGIC: [u8; 2] = [0x50, 0x4B];

/// Bytes of a rejected payload kept for diagnostics.
pub const SAMPLE_LEN: usize = 100;

/// Checks the container signature. Only the first two bytes matter here;
/// structural problems further in are reported by the decoder.
pub fn validate(payload: &[u8]) -> Result<(), ArchiveError> {
    if payload.len() >= ZIP_MAGIC.len() && payload[..2] == ZIP_MAGIC {
        return Ok(());
    }

    Err(ArchiveError::Format {
        kind: classify(payload),
        sample: text_sample(payload, SAMPLE_LEN),
    })
}

fn classify(payload: &[u8]) -> PayloadKind {
    if payload.is_empty() {
        return PayloadKind::Empty;
    }
    let head = &payload[..payload.len().min(SAMPLE_LEN)];
    let text = match std::str::from_utf8(head) {
        Ok(t) => t,
        // A multi-byte char cut at the sample boundary is still text.
        Err(e) if e.error_len().is_none() => match std::str::from_utf8(&head[..e.valid_up_to()]) {
            Ok(t) => t,
            Err(_) => return PayloadKind::Binary,
        },
        Err(_) => return PayloadKind::Binary,
    };
    let printable = text
        .chars()
        .all(|c| !c.is_control() || c.is_whitespace());
    if printable {
        PayloadKind::TextError
    } else {
        PayloadKind::Binary
    }
}
