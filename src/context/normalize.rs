//! Folder-name derivation from untrusted title text.
//!
//! This is the only place folder-name policy lives. Everything that needs a
//! destination folder reads it from a [`RoutingContext`](super::RoutingContext)
//! snapshot instead of recomputing it.

/// Maximum length (in characters) of a normalized title.
pub const MAX_TITLE_LEN: usize = 40;

/// Length a title is cut to before the truncation marker is appended.
const TRUNCATED_LEN: usize = 38;

/// Appended to titles that were cut short.
pub const TRUNCATION_MARKER: &str = "~~";

/// Used when nothing usable is left of a title.
pub const UNTITLED: &str = "Untitled";

/// Maximum length of the identifier part of a folder name.
pub const MAX_ID_LEN: usize = 30;

/// Substituted for characters that are illegal in path segments.
const PLACEHOLDER: char = '#';

/// Characters rejected by common filesystems inside a single path segment.
const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Producers escape real brackets and pipes with these look-alikes.
fn unescape_lookalike(c: char) -> char {
    match c {
        '［' | '【' | '⟦' => '[',
        '］' | '】' | '⟧' => ']',
        '（' => '(',
        '）' => ')',
        '｛' => '{',
        '｝' => '}',
        '｜' | '∣' | '│' => '|',
        other => other,
    }
}

/// Normalize a raw title into a filesystem-safe folder-name fragment.
///
/// Deterministic and total: every input produces a non-empty string of at
/// most [`MAX_TITLE_LEN`] characters.
pub fn normalize(raw: &str) -> String {
    let unescaped: String = raw.chars().map(unescape_lookalike).collect();

    let stripped = strip_leading_groups(&unescaped);
    let head = cut_at_double_whitespace(stripped);

    let safe: String = head
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .map(|c| if ILLEGAL_CHARS.contains(&c) { PLACEHOLDER } else { c })
        .collect();

    let joined = safe.split_whitespace().collect::<Vec<_>>().join("_");
    // Windows silently drops trailing dots from directory names
    let trimmed = joined.trim_end_matches('.');

    let title = if trimmed.chars().count() > MAX_TITLE_LEN {
        let mut cut: String = trimmed.chars().take(TRUNCATED_LEN).collect();
        cut.push_str(TRUNCATION_MARKER);
        cut
    } else {
        trimmed.to_string()
    };

    if title.is_empty() {
        UNTITLED.to_string()
    } else {
        title
    }
}

/// Make an identifier usable inside the `[...]` part of a folder name.
pub fn sanitize_id(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| {
            if ILLEGAL_CHARS.contains(&c) || c == '[' || c == ']' {
                PLACEHOLDER
            } else if c.is_whitespace() {
                '_'
            } else {
                c
            }
        })
        .take(MAX_ID_LEN)
        .collect()
}

/// Build the destination folder name: `[<id>]_<normalized-title>`.
pub fn folder_name(id: &str, raw_title: &str) -> String {
    format!("[{}]_{}", id, normalize(raw_title))
}

/// Repeatedly drop a leading `[...]`, `(...)` or `{...}` group.
fn strip_leading_groups(mut text: &str) -> &str {
    loop {
        text = text.trim_start();
        let close = match text.chars().next() {
            Some('[') => ']',
            Some('(') => ')',
            Some('{') => '}',
            _ => return text,
        };
        match matching_close(text, close) {
            Some(end) => text = &text[end + close.len_utf8()..],
            None => return text,
        }
    }
}

/// Byte index of the bracket closing the one at the start of `text`.
fn matching_close(text: &str, close: char) -> Option<usize> {
    let open = text.chars().next()?;
    let mut depth = 0usize;
    for (idx, c) in text.char_indices() {
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Some(idx);
            }
        }
    }
    None
}

/// Everything before the first run of two whitespace characters.
fn cut_at_double_whitespace(text: &str) -> &str {
    let mut prev_ws = false;
    for (idx, c) in text.char_indices() {
        let ws = c.is_whitespace();
        if ws && prev_ws {
            // `idx` points at the second whitespace char; back up over the first.
            let first = text[..idx].char_indices().next_back().map(|(i, _)| i).unwrap_or(0);
            return &text[..first];
        }
        prev_ws = ws;
    }
    text
}
