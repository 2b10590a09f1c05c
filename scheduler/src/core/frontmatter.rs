//! Minimal YAML frontmatter handling for task logs.
//!
//! Task logs only ever contain flat `key: value` pairs, so we render and parse
//! that subset directly instead of pulling in a YAML implementation.

/// Render a value as a single-quoted YAML scalar (`'` is doubled).
pub fn quote_scalar(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Split a document into (frontmatter, rest). Returns None if it doesn't look like frontmatter.
pub fn split_frontmatter(contents: &str) -> Option<(&str, &str)> {
    let after = contents
        .strip_prefix("---\n")
        .or_else(|| contents.strip_prefix("---\r\n"))?;
    if let Some(rest) = after.strip_prefix("---\n") {
        return Some(("", rest));
    }
    let end = after.find("\n---")?;
    let frontmatter = &after[..end];
    let rest = after[end + 4..].trim_start_matches(['\r', '\n']);
    Some((frontmatter, rest))
}

/// Parse flat `key: value` pairs in document order.
///
/// Quoted values are unwrapped; single-quoted values have `''` restored to `'`.
pub fn parse_pairs(frontmatter: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in frontmatter.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        pairs.push((key.trim().to_string(), unquote(value.trim())));
    }
    pairs
}

/// Look up a single key in a document's frontmatter.
pub fn read_key(contents: &str, key: &str) -> Option<String> {
    let (frontmatter, _) = split_frontmatter(contents)?;
    parse_pairs(frontmatter)
        .into_iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}

fn unquote(value: &str) -> String {
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        return value[1..value.len() - 1].replace("''", "'");
    }
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        return value[1..value.len() - 1].to_string();
    }
    value.to_string()
}
