//! Record-separator framing for the text-based hub protocol.
//!
//! Every protocol message is a JSON document terminated by the ASCII record
//! separator (0x1E). A single transport message may carry several frames.

use serde::Serialize;

pub const RECORD_SEPARATOR: &str = "\u{001E}";

/// Serializes a message and appends the record-separator terminator.
pub fn to_json<T>(value: &T) -> Result<String, serde_json::Error>
where
    T: ?Sized + Serialize,
{
    let serialized = serde_json::to_string(value)?;
    Ok(serialized + RECORD_SEPARATOR)
}

/// Yields every terminated frame in `payload`.
///
/// Data after the final record separator is not a complete message and is
/// not yielded.
pub fn split_frames(payload: &str) -> impl Iterator<Item = &str> {
    let terminated = match payload.rfind(RECORD_SEPARATOR) {
        Some(position) => &payload[..position],
        None => "",
    };
    terminated
        .split(RECORD_SEPARATOR)
        .filter(|segment| !segment.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_json_appends_record_separator() {
        let serialized = to_json(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(serialized, "{\"a\":1}\u{001E}");
    }

    #[test]
    fn split_frames_yields_terminated_segments_in_order() {
        let payload = "{\"a\":1}\u{001E}{\"b\":2}\u{001E}";
        let frames: Vec<_> = split_frames(payload).collect();
        assert_eq!(frames, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn split_frames_ignores_unterminated_tail() {
        let payload = "{\"a\":1}\u{001E}{\"partial\"";
        let frames: Vec<_> = split_frames(payload).collect();
        assert_eq!(frames, vec!["{\"a\":1}"]);
    }

    #[test]
    fn split_frames_skips_empty_segments() {
        assert_eq!(split_frames("\u{001E}\u{001E}").count(), 0);
        assert_eq!(split_frames("").count(), 0);
    }
}
