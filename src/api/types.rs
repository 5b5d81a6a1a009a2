//! API Request/Response Types

use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::models::config::DeployRule;
use crate::models::errors::{AppError, ErrorCode};

/// API Response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    pub latency_ms: f64,
    pub timestamp: i64,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T, latency_ms: f64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            latency_ms,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

impl ApiResponse<()> {
    pub fn error(error: ApiError, latency_ms: f64) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            latency_ms,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// API Error
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self {
            code: ErrorCode::ApiUnauthorized.as_str().to_string(),
            message: "Invalid or missing API key".to_string(),
            details: None,
        }
    }
}

impl From<&AppError> for ApiError {
    fn from(err: &AppError) -> Self {
        Self {
            code: err.code_str().to_string(),
            message: err.message.clone(),
            details: None,
        }
    }
}

/// Error half of every handler result
pub type ApiFailure = (StatusCode, Json<ApiResponse<()>>);

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiFailure>;

pub fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Map an `AppError` to its status code and error envelope
pub fn failure(err: AppError, start: Instant) -> ApiFailure {
    let status = StatusCode::from_u16(err.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ApiResponse::error(ApiError::from(&err), elapsed_ms(start))))
}

// ============================================
// Health
// ============================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthData {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub dry_run: bool,
}

// ============================================
// Deployments
// ============================================

#[derive(Debug, Deserialize)]
pub struct DeploymentsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DeployBody {
    pub rule: String,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Rule as listed by `/v1/rules`
#[derive(Debug, Serialize, Deserialize)]
pub struct RuleData {
    pub name: String,
    pub repository: String,
    pub tag_pattern: String,
    pub container_name: String,
    pub semver_only: bool,
    /// Image of the most recent recorded deployment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<String>,
}

impl RuleData {
    pub fn new(rule: &DeployRule) -> Self {
        Self {
            name: rule.name.clone(),
            repository: rule.repository.clone(),
            tag_pattern: rule.tag_pattern.clone(),
            container_name: rule.container_name().to_string(),
            semver_only: rule.semver_only,
            last_image: None,
            last_status: None,
        }
    }
}
