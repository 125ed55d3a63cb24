//! Deterministic classification of proposal provider failures.

use std::sync::LazyLock;

use regex::Regex;

/// How the controller should treat a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFailure {
    /// Rate limits, overload, network hiccups: retry the same attempt.
    Transient,
    /// Credentials rejected: stop the run.
    Auth,
    /// Anything else: the attempt fails and consumes budget.
    Provider,
}

/// A status code only counts when something HTTP-like names it, so line
/// numbers and token counts in stderr do not.
const STATUS_PREFIX: &str = concat!(
    r"\b(?:https?(?:/\d(?:\.\d)?)?|status(?:[ _]code)?|error(?:[ _]code)?|code)",
    r"[ :=]*"
);

fn any_of(alternatives: &[&str]) -> Regex {
    Regex::new(&format!("(?i){}", alternatives.join("|"))).expect("provider pattern should compile")
}

static AUTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    let status = format!(r"{STATUS_PREFIX}40[13]\b");
    any_of(&[
        status.as_str(),
        r"\b403 forbidden\b",
        r"\bunauthori[sz]ed\b",
        r"authentication ?error",
        r"authentication failed",
        r"permissiondeniederror",
        r"invalid[ _-]?api[ _-]?key",
        r"incorrect api key",
    ])
});

static TRANSIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    let status = format!(r"{STATUS_PREFIX}(?:429|50[0234]|529)\b");
    any_of(&[
        status.as_str(),
        r"\b50[0234] (?:internal server error|bad gateway|service unavailable|gateway time-?out)",
        r"rate[ _-]?limit",
        r"too many requests",
        r"overloaded",
        r"timed? ?out",
        r"temporarily unavailable",
        r"connection (?:reset|refused|closed|aborted)",
        r"service unavailable",
        r"bad gateway",
    ])
});

/// Classify provider error text.
///
/// Authentication markers win over transient ones, so a `401` in a response
/// that also mentions a retry is still fatal.
pub fn classify_provider_message(message: &str) -> ProviderFailure {
    if AUTH_RE.is_match(message) {
        ProviderFailure::Auth
    } else if TRANSIENT_RE.is_match(message) {
        ProviderFailure::Transient
    } else {
        ProviderFailure::Provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        for msg in [
            "HTTP 429 Too Many Requests",
            "litellm.RateLimitError: rate limit reached",
            "upstream returned status 503",
            "HTTP/1.1 502 Bad Gateway",
            "Error code: 529 - overloaded_error",
            "Overloaded, please retry",
            "request timed out",
            "connection reset by peer",
        ] {
            assert_eq!(
                classify_provider_message(msg),
                ProviderFailure::Transient,
                "{msg}"
            );
        }
    }

    #[test]
    fn credential_errors_are_auth() {
        for msg in [
            "401 Unauthorized",
            "AuthenticationError: Incorrect API key provided",
            "invalid_api_key",
            "403 Forbidden",
            "Error code: 401 - {'error': {'message': 'bad key'}}",
            "openai.PermissionDeniedError: status 403",
        ] {
            assert_eq!(classify_provider_message(msg), ProviderFailure::Auth, "{msg}");
        }
    }

    #[test]
    fn auth_wins_over_transient_markers() {
        assert_eq!(
            classify_provider_message("401 unauthorized (will not retry after 429)"),
            ProviderFailure::Auth
        );
    }

    #[test]
    fn other_errors_are_provider_errors() {
        assert_eq!(
            classify_provider_message("model returned malformed output"),
            ProviderFailure::Provider
        );
        assert_eq!(classify_provider_message(""), ProviderFailure::Provider);
    }

    #[test]
    fn status_codes_need_word_boundaries() {
        assert_eq!(
            classify_provider_message("processed 4290 tokens"),
            ProviderFailure::Provider
        );
    }

    #[test]
    fn bare_numbers_and_os_errors_are_not_auth() {
        for msg in [
            "Traceback (most recent call last):\n  File \"propose.py\", line 403, in main\n\
             ValueError: could not parse model reply",
            "sh: 1: ./propose.sh: Permission denied",
            "read 401 bytes from cache",
        ] {
            assert_eq!(
                classify_provider_message(msg),
                ProviderFailure::Provider,
                "{msg}"
            );
        }
    }

    #[test]
    fn counts_that_look_like_server_errors_are_not_transient() {
        for msg in [
            "error: reply truncated after 500 tokens, no JSON found",
            "  File \"propose.py\", line 503, in parse",
            "wrote 429 lines",
        ] {
            assert_eq!(
                classify_provider_message(msg),
                ProviderFailure::Provider,
                "{msg}"
            );
        }
    }
}
