//! Shared utility functions

/// Safely truncate a string to at most `max_bytes` while respecting UTF-8 boundaries.
///
/// If the string is already shorter than `max_bytes`, returns it unchanged.
/// Otherwise, finds the last valid UTF-8 character boundary at or before `max_bytes`
/// and returns a slice up to that point.
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Render a possibly-binary body for the exchange log, capped at `max_bytes`.
///
/// Valid UTF-8 is truncated on a character boundary; anything else is rendered
/// lossily first so a tunnel carrying ciphertext can't poison the JSONL log.
pub fn lossy_body_for_log(body: &[u8], max_bytes: usize) -> String {
    match std::str::from_utf8(body) {
        Ok(s) => truncate_utf8_safe(s, max_bytes).to_string(),
        Err(_) => {
            let lossy = String::from_utf8_lossy(body);
            truncate_utf8_safe(&lossy, max_bytes).to_string()
        }
    }
}

/// Case-insensitive lookup in an ordered header list; last value wins.
///
/// Matches the framing rule for duplicate header names: every occurrence is
/// kept in order, but a lookup observes only the final one.
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .rev()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
