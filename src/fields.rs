// ============================================================================
// SECTION 13: FIELD NORMALISATION HELPERS
// ============================================================================
// Small pure functions shared by every pipeline: identifier extraction from
// namespaced keys, the status vocabulary, first-non-empty fallbacks and
// plain `key=value` / `key: value` text.
// ============================================================================

use crate::store::FieldMap;

// ----------------------------------------------------------------------------
// 13.1 Status Vocabulary
// ----------------------------------------------------------------------------

/// Textual states that map to `1`; anything else is `0`.
pub const UP_STATES: [&str; 6] = ["up", "enabled", "selected", "active", "true", "ok"];

/// Convert a status-like value to a binary gauge, ignoring case and padding.
pub fn status_to_gauge(status: &str) -> f64 {
    let value = status.trim().to_ascii_lowercase();
    if UP_STATES.contains(&value.as_str()) {
        1.0
    } else {
        0.0
    }
}

// ----------------------------------------------------------------------------
// 13.2 First Non-Empty
// ----------------------------------------------------------------------------

/// Return the first candidate that is non-blank. The returned value is not
/// trimmed; blankness is judged on the trimmed form.
pub fn first_non_empty<'a, I>(candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    candidates.into_iter().find(|v| !v.trim().is_empty())
}

/// Field lookup returning `""` for absent fields.
pub fn field<'a>(fields: &'a FieldMap, name: &str) -> &'a str {
    fields.get(name).map(String::as_str).unwrap_or("")
}

// ----------------------------------------------------------------------------
// 13.3 Identifier Extraction
// ----------------------------------------------------------------------------

/// Strip a fixed prefix from a raw key. Returns `None` when the prefix is
/// absent or nothing remains, so malformed keys never become labels.
pub fn strip_identifier<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    match key.strip_prefix(prefix) {
        Some(rest) if !rest.is_empty() => Some(rest),
        _ => None,
    }
}

/// Split a membership key (`<prefix><parent><sep><child>`) into its parts.
pub fn split_member_key<'a>(key: &'a str, prefix: &str, separator: char) -> Option<(&'a str, &'a str)> {
    let rest = strip_identifier(key, prefix)?;
    let (parent, child) = rest.split_once(separator)?;
    if parent.is_empty() || child.is_empty() {
        return None;
    }
    Some((parent, child))
}

// ----------------------------------------------------------------------------
// 13.4 Key-Value Lines
// ----------------------------------------------------------------------------

/// Parse `KEY=value` or `key: value` lines. Blank lines and `#` comments are
/// ignored, a trailing `# ...` is cut from `:` lines, and surrounding quotes
/// are removed from values.
pub fn parse_key_value_lines(text: &str) -> FieldMap {
    let mut out = FieldMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, mut value) = match line.split_once('=') {
            Some((key, value)) => (key, value.trim()),
            None => match line.split_once(':') {
                Some((key, value)) => {
                    let value = value.split_once('#').map_or(value, |(head, _)| head);
                    (key, value.trim())
                }
                None => continue,
            },
        };
        value = value.trim_matches(|c| c == '\'' || c == '"');
        out.insert(key.trim().to_string(), value.to_string());
    }
    out
}
