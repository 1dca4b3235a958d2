use uuid::Uuid;

/// First eight hex characters of a UUID, used for human-facing identifiers.
pub fn short_uuid(id: &Uuid) -> String {
    let simple = id.simple().to_string();
    simple.chars().take(8).collect()
}

/// Truncate `s` to at most `max_bytes`, backing off to the previous char boundary.
pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Collapse a multi-line diagnostic into one short line suitable for a status message.
pub fn summarize_line(s: &str, max_bytes: usize) -> String {
    let line = s
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("");
    let truncated = truncate_to_char_boundary(line, max_bytes);
    if truncated.len() < line.len() {
        format!("{truncated}...")
    } else {
        truncated.to_string()
    }
}
