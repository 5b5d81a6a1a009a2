//! dockployment library
//!
//! Watches the local Docker daemon for newly tagged images and redeploys
//! the containers whose rules match them:
//! - `providers::docker` talks to the docker CLI and its event stream
//! - `core::matcher` maps images to rules and picks reconcile candidates
//! - `core::deployer` swaps containers with health checks and rollback
//! - `watcher` drives deployments from events and periodic reconciles
//! - `api` serves status and manual deploys over HTTP

pub mod api;
pub mod core;
pub mod history;
pub mod models;
pub mod providers;
pub mod utils;
pub mod watcher;

pub use crate::core::{DeployRequest, Deployer, RuleMatcher, TagPattern};
pub use history::{DeploymentHistory, HistorySummary};
pub use models::{AppError, AppResult, DaemonConfig, DeployRule, DeploymentRecord, DeploymentStatus, ErrorCode};
pub use providers::{DockerCli, DockerEngine, WebhookNotifier};
pub use watcher::DeployWatcher;
