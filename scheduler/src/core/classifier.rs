//! Deterministic classification of lock backend diagnostics.
//!
//! The lock backend only reports free-form text next to its exit code. This
//! module maps that text to a small, stable set of categories recorded in task
//! logs and used to decide retry eligibility.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static ERROR_CATEGORY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"error_category=([a-z0-9_]+)").unwrap());

/// Canonical backend failure category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BackendCategory {
    RelayQueryTimeout,
    RelayPublishQuorumFailure,
    WebsocketConnectionRefusedOrDns,
    MalformedRelayUrlConfig,
    PermanentValidation,
    Unknown,
    /// Token reported by the backend through an explicit `error_category=` marker.
    Reported(String),
}

impl BackendCategory {
    pub fn as_str(&self) -> &str {
        match self {
            BackendCategory::RelayQueryTimeout => "relay_query_timeout",
            BackendCategory::RelayPublishQuorumFailure => "relay_publish_quorum_failure",
            BackendCategory::WebsocketConnectionRefusedOrDns => {
                "websocket_connection_refused_or_dns"
            }
            BackendCategory::MalformedRelayUrlConfig => "malformed_relay_url_config",
            BackendCategory::PermanentValidation => "permanent_validation_error",
            BackendCategory::Unknown => "unknown_backend_error",
            BackendCategory::Reported(token) => token,
        }
    }

    /// Map a category token back to its variant. Unrecognised tokens are kept verbatim.
    pub fn from_token(token: &str) -> Self {
        match token {
            "relay_query_timeout" => BackendCategory::RelayQueryTimeout,
            "relay_publish_quorum_failure" => BackendCategory::RelayPublishQuorumFailure,
            "websocket_connection_refused_or_dns" => {
                BackendCategory::WebsocketConnectionRefusedOrDns
            }
            "malformed_relay_url_config" => BackendCategory::MalformedRelayUrlConfig,
            "permanent_validation_error" => BackendCategory::PermanentValidation,
            "unknown_backend_error" => BackendCategory::Unknown,
            other => BackendCategory::Reported(other.to_string()),
        }
    }

    /// Every category is retryable except permanent validation failures.
    pub fn is_transient(&self) -> bool {
        !matches!(self, BackendCategory::PermanentValidation)
    }
}

impl fmt::Display for BackendCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify raw backend output (stderr and stdout concatenated) into a category.
///
/// Total: empty or unrecognised text yields [`BackendCategory::Unknown`].
pub fn classify_backend_error(output: &str) -> BackendCategory {
    let text = output.to_lowercase();
    if text.trim().is_empty() {
        return BackendCategory::Unknown;
    }

    if let Some(token) = ERROR_CATEGORY_RE
        .captures(&text)
        .and_then(|caps| caps.get(1))
    {
        return BackendCategory::from_token(token.as_str());
    }

    if (text.contains("relay") || text.contains("query")) && text.contains("timeout") {
        return BackendCategory::RelayQueryTimeout;
    }

    if text.contains("publish failed to all relays") || text.contains("failed to publish to any relay")
    {
        return BackendCategory::RelayPublishQuorumFailure;
    }

    if contains_any(
        &text,
        &[
            "connection refused",
            "econnrefused",
            "getaddrinfo",
            "enotfound",
            "eai_again",
        ],
    ) || (text.contains("websocket") && text.contains("dns"))
    {
        return BackendCategory::WebsocketConnectionRefusedOrDns;
    }

    if contains_any(
        &text,
        &[
            "invalid url",
            "malformed",
            "unsupported protocol",
            "must start with ws",
            "invalid relay",
        ],
    ) {
        return BackendCategory::MalformedRelayUrlConfig;
    }

    BackendCategory::Unknown
}

fn contains_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| text.contains(needle))
}
