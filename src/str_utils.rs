/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Returns the text appended to `base` to produce `merged`, assuming newline-joined merges.
///
/// `None` when `merged` does not extend `base`.
pub fn appended_suffix<'a>(base: &str, merged: &'a str) -> Option<&'a str> {
    if merged.len() <= base.len() || !merged.starts_with(base) || !merged.is_char_boundary(base.len()) {
        return None;
    }
    let rest = &merged[base.len()..];
    Some(rest.strip_prefix('\n').unwrap_or(rest))
}
