//! Secret redaction and excerpting for subprocess output embedded in task logs.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum number of characters kept by [`excerpt`].
pub const EXCERPT_MAX_CHARS: usize = 600;

static BEARER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(bearer\s+)[A-Za-z0-9._~+/=-]+").unwrap());

static KEY_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(token|api[_-]?key|secret(?:[_-]?key)?|password|passwd|authorization)\s*[:=]\s*[^\s,;]+",
    )
    .unwrap()
});

static PREFIXED_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:sk|pk|ghp|xoxb|xoxp)_[A-Za-z0-9_-]+\b").unwrap());

/// Replace bearer tokens, `key=value` secrets and prefixed API tokens with `[REDACTED]`.
pub fn redact(text: &str) -> String {
    let text = BEARER_RE.replace_all(text, "${1}[REDACTED]");
    let text = KEY_VALUE_RE.replace_all(&text, "${1}=[REDACTED]");
    PREFIXED_TOKEN_RE
        .replace_all(&text, "[REDACTED]")
        .into_owned()
}

/// Redact, trim and cap text for inclusion in a task log.
///
/// Returns an empty string for blank input. Longer text is cut at
/// [`EXCERPT_MAX_CHARS`] characters and suffixed with an ellipsis.
pub fn excerpt(text: &str) -> String {
    let redacted = redact(text);
    let trimmed = redacted.trim();
    if trimmed.chars().count() <= EXCERPT_MAX_CHARS {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(EXCERPT_MAX_CHARS).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_bearer_tokens() {
        assert_eq!(
            redact("Authorization header: Bearer abc.def-123"),
            "Authorization header: Bearer [REDACTED]"
        );
    }

    #[test]
    fn redacts_key_value_secrets() {
        assert_eq!(redact("api_key=hunter2 next"), "api_key=[REDACTED] next");
        assert_eq!(redact("PASSWORD: swordfish;"), "PASSWORD=[REDACTED];");
        assert_eq!(redact("secret-key = xyz,"), "secret-key=[REDACTED],");
    }

    #[test]
    fn redacts_prefixed_tokens() {
        assert_eq!(
            redact("using ghp_AbC123 and sk_live_9"),
            "using [REDACTED] and [REDACTED]"
        );
    }

    #[test]
    fn leaves_plain_text_alone() {
        let text = "publish failed to all relays (0/3 acknowledged)";
        assert_eq!(redact(text), text);
    }

    #[test]
    fn excerpt_trims_and_caps() {
        assert_eq!(excerpt("  \n  "), "");
        assert_eq!(excerpt("  short  "), "short");

        let long = "x".repeat(EXCERPT_MAX_CHARS + 10);
        let cut = excerpt(&long);
        assert_eq!(cut.chars().count(), EXCERPT_MAX_CHARS + 1);
        assert!(cut.ends_with('…'));
    }
}
