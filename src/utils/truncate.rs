//! Truncation Utilities
//!
//! UTF-8 safe truncation for build logs (keep both ends, the interesting
//! compiler output is usually at the tail) and for fingerprint keys.

/// Keep at most `max_bytes`, eliding the middle.
pub fn truncate_middle(content: &str, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content.to_string();
    }
    if max_bytes == 0 {
        return format!("... [{} chars truncated] ...", content.len());
    }

    let half = max_bytes / 2;
    let mut prefix_end = 0;
    for (idx, c) in content.char_indices() {
        let end = idx + c.len_utf8();
        if end > half {
            break;
        }
        prefix_end = end;
    }

    let suffix_target = content.len().saturating_sub(half);
    let mut suffix_start = content.len();
    for (idx, _) in content.char_indices().rev() {
        if idx < suffix_target {
            break;
        }
        suffix_start = idx;
    }
    if suffix_start < prefix_end {
        suffix_start = prefix_end;
    }

    let prefix = &content[..prefix_end];
    let suffix = &content[suffix_start..];
    let dropped = content.len() - (prefix.len() + suffix.len());
    format!("{} ... [{} chars truncated] ... {}", prefix, dropped, suffix)
}

/// First `max_chars` characters.
pub fn truncate_chars(content: &str, max_chars: usize) -> &str {
    match content.char_indices().nth(max_chars) {
        Some((idx, _)) => &content[..idx],
        None => content,
    }
}
