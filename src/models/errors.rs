//! Centralized Error Handling Module
//!
//! Every failure carries a unique error code so deployment logs can be
//! grepped and alerted on without parsing messages.
//!
//! Error codes follow pattern: CATEGORY_SPECIFIC_ERROR
//! - DOCKER_xxx: Docker CLI / daemon errors
//! - DEPLOY_xxx: Deployment pipeline errors
//! - CFG_xxx: Configuration errors
//! - API_xxx: Status API errors
//! - NOTIFY_xxx: Webhook notification errors

use std::fmt;

/// Application-wide error type
#[derive(Debug)]
pub struct AppError {
    /// Unique error code for logging/monitoring
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Optional underlying error
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    /// Create a new AppError
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create AppError with source error
    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get error code as string (for logging)
    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Unique error codes for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // ============================================
    // Docker Errors
    // ============================================
    /// docker binary could not be spawned
    DockerCliMissing,
    /// Docker daemon is not reachable
    DockerUnavailable,
    /// docker command exited non-zero
    DockerCommandFailed,
    /// docker command did not finish in time
    DockerTimeout,
    /// Image or container does not exist
    DockerNotFound,
    /// docker printed something we could not parse
    DockerInvalidOutput,

    // ============================================
    // Deployment Errors
    // ============================================
    /// New container could not be started
    DeployStartFailed,
    /// New container reported unhealthy or exited
    DeployUnhealthy,
    /// New container did not become healthy in time
    DeployHealthTimeout,
    /// Restoring the previous container failed
    DeployRollbackFailed,
    /// No rule with that name
    DeployUnknownRule,
    /// Image to deploy is not present locally
    DeployImageNotFound,

    // ============================================
    // Configuration Errors
    // ============================================
    /// Config file does not exist
    ConfigFileMissing,
    /// Config file is not valid JSON for the schema
    ConfigParseError,
    /// Invalid configuration value
    ConfigInvalidValue,
    /// Two rules share a name or container
    ConfigDuplicateRule,

    // ============================================
    // API Errors
    // ============================================
    /// Invalid request format
    ApiBadRequest,
    /// Unauthorized (invalid API key)
    ApiUnauthorized,
    /// Resource not found
    ApiNotFound,
    /// Internal server error
    ApiInternalError,

    // ============================================
    // Notification Errors
    // ============================================
    /// Webhook POST failed or returned non-2xx
    NotifyFailed,

    // ============================================
    // Generic Errors
    // ============================================
    /// Unknown error
    Unknown,
}

impl ErrorCode {
    /// Get string representation of error code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DockerCliMissing => "DOCKER_CLI_MISSING",
            Self::DockerUnavailable => "DOCKER_UNAVAILABLE",
            Self::DockerCommandFailed => "DOCKER_COMMAND_FAILED",
            Self::DockerTimeout => "DOCKER_TIMEOUT",
            Self::DockerNotFound => "DOCKER_NOT_FOUND",
            Self::DockerInvalidOutput => "DOCKER_INVALID_OUTPUT",

            Self::DeployStartFailed => "DEPLOY_START_FAILED",
            Self::DeployUnhealthy => "DEPLOY_UNHEALTHY",
            Self::DeployHealthTimeout => "DEPLOY_HEALTH_TIMEOUT",
            Self::DeployRollbackFailed => "DEPLOY_ROLLBACK_FAILED",
            Self::DeployUnknownRule => "DEPLOY_UNKNOWN_RULE",
            Self::DeployImageNotFound => "DEPLOY_IMAGE_NOT_FOUND",

            Self::ConfigFileMissing => "CFG_FILE_MISSING",
            Self::ConfigParseError => "CFG_PARSE_ERROR",
            Self::ConfigInvalidValue => "CFG_INVALID_VALUE",
            Self::ConfigDuplicateRule => "CFG_DUPLICATE_RULE",

            Self::ApiBadRequest => "API_BAD_REQUEST",
            Self::ApiUnauthorized => "API_UNAUTHORIZED",
            Self::ApiNotFound => "API_NOT_FOUND",
            Self::ApiInternalError => "API_INTERNAL_ERROR",

            Self::NotifyFailed => "NOTIFY_FAILED",

            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    /// Get HTTP status code for API responses
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ApiBadRequest | Self::ConfigInvalidValue => 400,
            Self::ApiUnauthorized => 401,
            Self::ApiNotFound
            | Self::DockerNotFound
            | Self::DeployUnknownRule
            | Self::DeployImageNotFound => 404,
            Self::DockerUnavailable => 503,
            _ => 500,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DockerUnavailable | Self::DockerTimeout | Self::NotifyFailed
        )
    }
}

// ============================================
// Convenience constructors
// ============================================

impl AppError {
    pub fn docker_unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::DockerUnavailable, msg)
    }

    pub fn docker_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::DockerCommandFailed, msg)
    }

    pub fn docker_timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::DockerTimeout, msg)
    }

    pub fn docker_not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::DockerNotFound, msg)
    }

    pub fn invalid_output(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::DockerInvalidOutput, msg)
    }

    pub fn start_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeployStartFailed, msg)
    }

    pub fn unhealthy(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeployUnhealthy, msg)
    }

    pub fn health_timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeployHealthTimeout, msg)
    }

    pub fn rollback_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeployRollbackFailed, msg)
    }

    pub fn unknown_rule(name: &str) -> Self {
        Self::new(ErrorCode::DeployUnknownRule, format!("Unknown rule: {}", name))
    }

    pub fn image_not_found(image: &str) -> Self {
        Self::new(
            ErrorCode::DeployImageNotFound,
            format!("Image not present locally: {}", image),
        )
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigInvalidValue, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ApiBadRequest, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ApiInternalError, msg)
    }
}

// ============================================
// Result type alias
// ============================================

/// Application Result type
pub type AppResult<T> = Result<T, AppError>;

// ============================================
// Conversion from common error types
// ============================================

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::with_source(ErrorCode::Unknown, "IO error", err)
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::new(ErrorCode::NotifyFailed, "Webhook request timeout")
        } else {
            Self::with_source(ErrorCode::NotifyFailed, "Webhook request failed", err)
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source(ErrorCode::DockerInvalidOutput, "JSON parse error", err)
    }
}
