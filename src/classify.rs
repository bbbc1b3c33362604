//! Failure classification.
//!
//! [`classify`] is a pure mapping from a raw [`Failure`] plus its
//! [`ErrorContext`] to a typed [`AppError`]. Resolution order:
//!
//! 1. a recognized machine-readable code from the upstream API
//! 2. HTTP-status-like signals (429, 5xx, connection refused)
//! 3. known substrings in the failure message
//! 4. fail closed: `Unknown`, non-retryable
//!
//! An unclassified error is never silently retried.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, ErrorCategory, ErrorContext};

// ── Raw failure ──────────────────────────────────────────────────────────────

/// Which external collaborator produced a failure, when the call site knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOrigin {
    Github,
    AiProvider,
    Database,
    Preview,
    Queue,
    Filesystem,
}

/// A raw, unclassified failure as reported by an external collaborator.
///
/// Call sites attach whatever signals they have; the classifier does the
/// rest. `message` is always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub message: String,
    /// Documented machine code from the upstream API, if any
    /// (e.g. `"context_length_exceeded"`).
    pub code: Option<String>,
    /// HTTP-ish status signal, if the failure came off the wire.
    pub http_status: Option<u16>,
    pub origin: Option<FailureOrigin>,
}

impl Failure {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            http_status: None,
            origin: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_origin(mut self, origin: FailureOrigin) -> Self {
        self.origin = Some(origin);
        self
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        Failure::msg(format!("{err:#}"))
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

// ── Classification ───────────────────────────────────────────────────────────

/// Classify a raw failure into a typed [`AppError`].
pub fn classify(failure: &Failure, context: ErrorContext) -> AppError {
    let category = by_code(failure)
        .or_else(|| by_status(failure))
        .or_else(|| by_message(&failure.message))
        .unwrap_or(ErrorCategory::Unknown);
    AppError::new(category, failure.message.clone(), context)
}

/// Step 1 — documented upstream error codes map directly.
fn by_code(failure: &Failure) -> Option<ErrorCategory> {
    let code = failure.code.as_deref()?.to_ascii_lowercase();
    let category = match code.as_str() {
        "context_length_exceeded" | "max_tokens_exceeded" => ErrorCategory::AiContextLength,
        "rate_limit_exceeded" | "insufficient_quota" | "overloaded" => ErrorCategory::AiRateLimit,
        "model_not_available" | "model_error" => ErrorCategory::AiModelFailure,
        "bad_credentials" | "requires_authentication" => ErrorCategory::GithubAuth,
        "not_found" | "repository_disabled" => ErrorCategory::RepositoryAccess,
        "sqlite_busy" | "pool_timed_out" | "connection_reset" => ErrorCategory::DatabaseConnection,
        _ => return None,
    };
    Some(category)
}

/// Step 2 — HTTP-status-like signals, disambiguated by origin.
fn by_status(failure: &Failure) -> Option<ErrorCategory> {
    let status = failure.http_status?;
    let category = match status {
        401 | 403 => match failure.origin {
            Some(FailureOrigin::Github) => ErrorCategory::GithubAuth,
            _ => ErrorCategory::RepositoryAccess,
        },
        404 if failure.origin == Some(FailureOrigin::Github) => ErrorCategory::RepositoryAccess,
        429 => match failure.origin {
            Some(FailureOrigin::Github) => ErrorCategory::GithubRateLimit,
            _ => ErrorCategory::AiRateLimit,
        },
        500..=599 => match failure.origin {
            Some(FailureOrigin::AiProvider) => ErrorCategory::AiModelFailure,
            Some(FailureOrigin::Github) => ErrorCategory::RepositoryAccess,
            Some(FailureOrigin::Preview) => ErrorCategory::PreviewStartup,
            Some(FailureOrigin::Database) => ErrorCategory::DatabaseConnection,
            _ => ErrorCategory::Network,
        },
        _ => return None,
    };
    Some(category)
}

/// Step 3 — known substrings. Checked in order of specificity.
fn by_message(message: &str) -> Option<ErrorCategory> {
    let msg = message.to_ascii_lowercase();
    let contains = |needle: &str| msg.contains(needle);

    let category = if contains("context length") || contains("maximum context") {
        ErrorCategory::AiContextLength
    } else if contains("quota exceeded") || contains("rate limit") || contains("too many requests")
    {
        ErrorCategory::AiRateLimit
    } else if contains("syntax error") || contains("parse error") || contains("unexpected token") {
        ErrorCategory::ConversionSyntax
    } else if contains("cannot resolve dependency")
        || contains("unresolved dependency")
        || contains("peer dependency")
    {
        ErrorCategory::ConversionDependency
    } else if contains("out of memory") || contains("resource exhausted") {
        ErrorCategory::PreviewResources
    } else if contains("database") || contains("sqlite") || contains("connection pool") {
        ErrorCategory::DatabaseConnection
    } else if contains("enoent")
        || contains("enospc")
        || contains("eacces")
        || contains("permission denied")
        || contains("no such file")
    {
        ErrorCategory::Filesystem
    } else if contains("econnrefused")
        || contains("econnreset")
        || contains("etimedout")
        || contains("timeout")
        || contains("timed out")
        || contains("socket hang up")
        || contains("network")
        || contains("dns")
    {
        ErrorCategory::Network
    } else {
        return None;
    };
    Some(category)
}

// ── Conversion glue ──────────────────────────────────────────────────────────

/// Anything the retry pipeline can turn into an [`AppError`].
///
/// `Failure` goes through [`classify`]; an `AppError` is already classified
/// and passes through untouched.
pub trait IntoAppError {
    fn into_app_error(self, context: &ErrorContext) -> AppError;
}

impl IntoAppError for Failure {
    fn into_app_error(self, context: &ErrorContext) -> AppError {
        classify(&self, context.clone())
    }
}

impl IntoAppError for AppError {
    fn into_app_error(self, _context: &ErrorContext) -> AppError {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ErrorContext {
        ErrorContext::new("test_op")
    }

    #[test]
    fn econnrefused_is_retryable_network() {
        let err = classify(
            &Failure::msg("connect ECONNREFUSED 127.0.0.1:8080"),
            ctx(),
        );
        assert_eq!(err.category, ErrorCategory::Network);
        assert!(err.retryable);
    }

    #[test]
    fn status_429_from_github_is_github_rate_limit() {
        let failure = Failure::msg("API rate limit exceeded for installation")
            .with_status(429)
            .with_origin(FailureOrigin::Github);
        let err = classify(&failure, ctx());
        assert_eq!(err.category, ErrorCategory::GithubRateLimit);
        assert!(err.retryable);
    }

    #[test]
    fn status_429_without_origin_is_ai_rate_limit() {
        let err = classify(&Failure::msg("slow down").with_status(429), ctx());
        assert_eq!(err.category, ErrorCategory::AiRateLimit);
    }

    #[test]
    fn upstream_code_beats_status_and_message() {
        // The documented code wins even though the message smells like a timeout.
        let failure = Failure::msg("request timed out waiting for model")
            .with_code("context_length_exceeded")
            .with_status(500)
            .with_origin(FailureOrigin::AiProvider);
        let err = classify(&failure, ctx());
        assert_eq!(err.category, ErrorCategory::AiContextLength);
        assert!(!err.retryable);
    }

    #[test]
    fn five_xx_from_ai_provider_is_model_failure() {
        let failure = Failure::msg("upstream unavailable")
            .with_status(503)
            .with_origin(FailureOrigin::AiProvider);
        assert_eq!(
            classify(&failure, ctx()).category,
            ErrorCategory::AiModelFailure
        );
    }

    #[test]
    fn syntax_error_message_is_conversion_syntax() {
        let err = classify(
            &Failure::msg("SyntaxError: Unexpected token '}' at line 42"),
            ctx(),
        );
        assert_eq!(err.category, ErrorCategory::ConversionSyntax);
        assert!(!err.retryable);
    }

    #[test]
    fn unrecognized_failure_fails_closed() {
        let err = classify(&Failure::msg("something inexplicable"), ctx());
        assert_eq!(err.category, ErrorCategory::Unknown);
        assert!(!err.retryable);
        assert_eq!(err.max_retries, 0);
    }

    #[test]
    fn filesystem_signals() {
        let err = classify(&Failure::msg("ENOENT: no such file or directory"), ctx());
        assert_eq!(err.category, ErrorCategory::Filesystem);
    }
}
