//! API Request Handlers

use axum::extract::{Json, Path, Query, State};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::types::*;
use crate::history::DeploymentHistory;
use crate::models::errors::{AppError, ErrorCode};
use crate::models::types::{DaemonStats, DeploymentRecord};
use crate::utils::constants::{APP_VERSION, DEFAULT_DEPLOYMENTS_LIMIT};
use crate::watcher::DeployWatcher;

/// Shared application state
pub struct AppState {
    pub watcher: Arc<DeployWatcher>,
    /// Required `X-API-Key` value, if any
    pub api_key: Option<String>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(watcher: Arc<DeployWatcher>, api_key: Option<String>) -> Self {
        Self {
            watcher,
            api_key: api_key.filter(|k| !k.is_empty()),
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn history(&self) -> &Arc<DeploymentHistory> {
        self.watcher.deployer().history()
    }
}

// ============================================
// Health & Stats
// ============================================

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<ApiResponse<HealthData>> {
    let start = Instant::now();

    let data = HealthData {
        status: "healthy".to_string(),
        version: APP_VERSION.to_string(),
        uptime_seconds: state.uptime_seconds(),
        dry_run: state.watcher.deployer().is_dry_run(),
    };

    Json(ApiResponse::success(data, elapsed_ms(start)))
}

pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<ApiResponse<DaemonStats>> {
    let start = Instant::now();
    Json(ApiResponse::success(state.watcher.stats(), elapsed_ms(start)))
}

// ============================================
// Deployments
// ============================================

pub async fn list_deployments(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeploymentsQuery>,
) -> Json<ApiResponse<Vec<DeploymentRecord>>> {
    let start = Instant::now();
    let history = state.history();
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEPLOYMENTS_LIMIT)
        .clamp(1, history.capacity());

    Json(ApiResponse::success(history.recent(limit), elapsed_ms(start)))
}

pub async fn get_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<DeploymentRecord> {
    let start = Instant::now();
    match state.history().get(&id) {
        Some(record) => Ok(Json(ApiResponse::success(record, elapsed_ms(start)))),
        None => Err(failure(
            AppError::new(ErrorCode::ApiNotFound, format!("Deployment {} not found", id)),
            start,
        )),
    }
}

pub async fn list_rules(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<RuleData>>> {
    let start = Instant::now();
    let history = state.history();
    let rules = state
        .watcher
        .rules()
        .map(|rule| {
            let mut data = RuleData::new(rule);
            if let Some(last) = history.last_for_rule(&rule.name) {
                data.last_image = Some(last.image);
                data.last_status = Some(last.status.as_str().to_string());
            }
            data
        })
        .collect();

    Json(ApiResponse::success(rules, elapsed_ms(start)))
}

/// Deploy a rule now and return the finished record
pub async fn trigger_deploy(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeployBody>,
) -> ApiResult<DeploymentRecord> {
    let start = Instant::now();

    let rule = state
        .watcher
        .rules()
        .find(|r| r.name == body.rule)
        .cloned()
        .ok_or_else(|| failure(AppError::unknown_rule(&body.rule), start))?;

    let deployer = state.watcher.deployer();
    let request = deployer
        .manual_request(&rule, body.tag.as_deref())
        .await
        .map_err(|e| failure(e, start))?;

    info!(rule = %rule.name, image = %request.image, "Manual deployment requested");
    let record = deployer.deploy(&rule, request).await;
    Ok(Json(ApiResponse::success(record, elapsed_ms(start))))
}
