//! Typed application errors.
//!
//! Every failure that crosses a component boundary is an [`AppError`]: a
//! closed category taxonomy plus static per-category metadata (severity,
//! retryability, default retry bound) and a user-facing message. Raw upstream
//! failures are turned into `AppError`s by the classifier; nothing downstream
//! ever inspects error strings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ── Categories ───────────────────────────────────────────────────────────────

/// Closed failure taxonomy.
///
/// Four origin classes: upstream providers (GitHub, AI inference),
/// conversion semantics, infrastructure, and caller input. Adding a variant
/// is a compile-time-checked change — the classifier and the recovery
/// registry match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    GithubAuth,
    GithubRateLimit,
    RepositoryAccess,
    AiRateLimit,
    AiContextLength,
    AiModelFailure,
    ConversionSyntax,
    ConversionDependency,
    PreviewStartup,
    PreviewResources,
    DatabaseConnection,
    Network,
    Filesystem,
    Validation,
    Unknown,
}

/// Severity attached to every classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl ErrorCategory {
    /// Stable machine-readable code, surfaced across the API boundary.
    pub fn code(self) -> &'static str {
        match self {
            Self::GithubAuth => "GITHUB_AUTH",
            Self::GithubRateLimit => "GITHUB_RATE_LIMIT",
            Self::RepositoryAccess => "REPOSITORY_ACCESS",
            Self::AiRateLimit => "AI_RATE_LIMIT",
            Self::AiContextLength => "AI_CONTEXT_LENGTH",
            Self::AiModelFailure => "AI_MODEL_FAILURE",
            Self::ConversionSyntax => "CONVERSION_SYNTAX",
            Self::ConversionDependency => "CONVERSION_DEPENDENCY",
            Self::PreviewStartup => "PREVIEW_STARTUP",
            Self::PreviewResources => "PREVIEW_RESOURCES",
            Self::DatabaseConnection => "DATABASE_CONNECTION",
            Self::Network => "NETWORK",
            Self::Filesystem => "FILESYSTEM",
            Self::Validation => "VALIDATION",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            Self::GithubAuth => Severity::Error,
            Self::GithubRateLimit => Severity::Warning,
            Self::RepositoryAccess => Severity::Error,
            Self::AiRateLimit => Severity::Warning,
            Self::AiContextLength => Severity::Warning,
            Self::AiModelFailure => Severity::Error,
            Self::ConversionSyntax => Severity::Error,
            Self::ConversionDependency => Severity::Error,
            Self::PreviewStartup => Severity::Error,
            Self::PreviewResources => Severity::Critical,
            Self::DatabaseConnection => Severity::Critical,
            Self::Network => Severity::Warning,
            Self::Filesystem => Severity::Error,
            Self::Validation => Severity::Info,
            Self::Unknown => Severity::Error,
        }
    }

    /// Whether a plain retry is ever worthwhile for this category.
    pub fn retryable(self) -> bool {
        match self {
            Self::GithubRateLimit
            | Self::AiRateLimit
            | Self::AiModelFailure
            | Self::PreviewStartup
            | Self::DatabaseConnection
            | Self::Network => true,
            Self::GithubAuth
            | Self::RepositoryAccess
            | Self::AiContextLength
            | Self::ConversionSyntax
            | Self::ConversionDependency
            | Self::PreviewResources
            | Self::Filesystem
            | Self::Validation
            | Self::Unknown => false,
        }
    }

    /// Default retry bound when no operation-specific policy overrides it.
    pub fn default_max_retries(self) -> u32 {
        match self {
            Self::GithubRateLimit | Self::AiRateLimit => 5,
            Self::AiModelFailure => 2,
            Self::PreviewStartup => 2,
            Self::DatabaseConnection => 3,
            Self::Network => 3,
            _ => 0,
        }
    }

    /// Plain-language message shown to the end user, never a raw error string.
    pub fn default_user_message(self) -> &'static str {
        match self {
            Self::GithubAuth => {
                "GitHub rejected our credentials. Reconnect your GitHub account and try again."
            }
            Self::GithubRateLimit => {
                "GitHub is rate-limiting requests. The conversion will resume automatically in a few minutes."
            }
            Self::RepositoryAccess => {
                "The repository could not be accessed. Check that it exists and that you have permission to read it."
            }
            Self::AiRateLimit => {
                "The AI provider is rate-limiting requests. Waiting before retrying — no action needed."
            }
            Self::AiContextLength => {
                "A file was too large for the AI model to process in one pass. It will be split into smaller chunks."
            }
            Self::AiModelFailure => {
                "The AI provider returned an error. Retrying — if this keeps happening, try again later."
            }
            Self::ConversionSyntax => {
                "Generated code failed to parse. The task will be re-run in a stricter mode."
            }
            Self::ConversionDependency => {
                "A dependency could not be resolved for the target stack. Review the plan warnings."
            }
            Self::PreviewStartup => "The preview environment failed to start. Retrying.",
            Self::PreviewResources => {
                "The preview environment ran out of resources. Contact support if this persists."
            }
            Self::DatabaseConnection => {
                "We're having trouble reaching our database. Reconnecting — your job is safe."
            }
            Self::Network => "A network error occurred. Retrying automatically.",
            Self::Filesystem => "A file operation failed. Contact support if this persists.",
            Self::Validation => "The request was invalid.",
            Self::Unknown => "An unexpected error occurred. Contact support if this persists.",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

// ── Context ──────────────────────────────────────────────────────────────────

/// Machine context captured at the point of failure.
///
/// Carried on every [`AppError`] and written to the structured log when an
/// error escalates to job failure. Never shown to the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Name of the operation that failed, e.g. `"start_conversion"`.
    pub operation: String,
    pub job_id: Option<String>,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    /// Arbitrary key/value metadata (provider reset hints, item ids, …).
    pub metadata: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

// ── AppError ─────────────────────────────────────────────────────────────────

/// A classified failure. Created once at the point of failure, never mutated.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct AppError {
    pub category: ErrorCategory,
    /// Stable code. Usually the category code; `NOT_FOUND` and
    /// `INVALID_TRANSITION` refine the `VALIDATION` category so callers can
    /// distinguish them without string matching.
    pub code: &'static str,
    pub severity: Severity,
    pub retryable: bool,
    pub max_retries: u32,
    /// Internal message — safe to log, never surfaced to the user.
    pub message: String,
    /// Plain-language message for the user.
    pub user_message: String,
    pub context: ErrorContext,
}

impl AppError {
    /// Build an error with the category's default metadata.
    pub fn new(category: ErrorCategory, message: impl Into<String>, context: ErrorContext) -> Self {
        Self {
            category,
            code: category.code(),
            severity: category.severity(),
            retryable: category.retryable(),
            max_retries: category.default_max_retries(),
            message: message.into(),
            user_message: category.default_user_message().to_string(),
            context,
        }
    }

    pub fn validation(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::new(ErrorCategory::Validation, message, context)
    }

    /// "Job not found" — Validation category with a distinguishable code.
    pub fn not_found(job_id: &str, context: ErrorContext) -> Self {
        let mut err = Self::new(
            ErrorCategory::Validation,
            format!("conversion job {job_id} not found"),
            context,
        );
        err.code = "NOT_FOUND";
        err.user_message = "That conversion no longer exists.".to_string();
        err
    }

    /// Illegal state-machine transition, e.g. pausing a completed job.
    pub fn invalid_transition(message: impl Into<String>, context: ErrorContext) -> Self {
        let mut err = Self::new(ErrorCategory::Validation, message, context);
        err.code = "INVALID_TRANSITION";
        err.user_message = "The conversion is not in a state that allows that action.".to_string();
        err
    }

    pub fn with_user_message(mut self, user_message: impl Into<String>) -> Self {
        self.user_message = user_message.into();
        self
    }

    /// Shape surfaced across the API boundary — never raw internals.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code.to_string(),
            message: self.message.clone(),
            user_message: self.user_message.clone(),
        }
    }
}

/// Boundary form of an error: `{code, message, user_message}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    pub user_message: String,
}
