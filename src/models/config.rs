//! Configuration module for the deployment daemon
//!
//! Rules and daemon settings come from a JSON file; a handful of
//! deployment-specific values can be overridden from the environment.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::errors::{AppError, AppResult, ErrorCode};
use super::types::{ContainerSpec, ImageRef};
use crate::core::matcher::TagPattern;
use crate::utils::constants::{
    DEFAULT_API_HOST, DEFAULT_API_PORT, DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_HEALTH_POLL_MS,
    DEFAULT_HEALTH_TIMEOUT_SECS, DEFAULT_HISTORY_CAPACITY, DEFAULT_MAX_CONCURRENT_DEPLOYS,
    DEFAULT_MAX_RETRIES, DEFAULT_RECONCILE_INTERVAL_SECS, DEFAULT_RETRY_BASE_MS,
    DEFAULT_RETRY_MAX_MS, DEFAULT_STARTUP_GRACE_SECS, DEFAULT_STATS_INTERVAL_SECS,
    DEFAULT_STOP_TIMEOUT_SECS, DEFAULT_WEBHOOK_TIMEOUT_SECS,
};

/// `docker run` options applied to every container a rule deploys
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// `-p` mappings, e.g. `8080:80`
    pub ports: Vec<String>,
    /// `-e` entries in `KEY=VALUE` form
    pub env: Vec<String>,
    /// `-v` mounts
    pub volumes: Vec<String>,
    pub network: Option<String>,
    /// Restart policy, e.g. `unless-stopped`
    pub restart: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// Overrides the image CMD when non-empty
    pub command: Vec<String>,
}

/// Maps a repository/tag pattern to a container to keep up to date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRule {
    pub name: String,
    /// Repository to watch, e.g. `registry.local:5000/team/api`
    pub repository: String,
    /// Glob over tags (`*`, `?`)
    #[serde(default = "default_tag_pattern")]
    pub tag_pattern: String,
    /// Container to replace; defaults to the rule name
    #[serde(default)]
    pub container_name: Option<String>,
    /// Only deploy tags that parse as versions newer than the running one
    #[serde(default)]
    pub semver_only: bool,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    #[serde(default = "default_startup_grace")]
    pub startup_grace_secs: u64,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub run: RunOptions,
}

impl DeployRule {
    /// Minimal rule, mostly useful for tests and manual setups
    pub fn new(name: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repository: repository.into(),
            tag_pattern: default_tag_pattern(),
            container_name: None,
            semver_only: false,
            health_timeout_secs: DEFAULT_HEALTH_TIMEOUT_SECS,
            startup_grace_secs: DEFAULT_STARTUP_GRACE_SECS,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            enabled: true,
            run: RunOptions::default(),
        }
    }

    pub fn container_name(&self) -> &str {
        self.container_name.as_deref().unwrap_or(&self.name)
    }

    /// Name the running container is parked under during a deployment
    pub fn backup_name(&self) -> String {
        format!("{}-dockployment-previous", self.container_name())
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }

    /// Container spec for deploying `image` under this rule
    pub fn container_spec(&self, image: &ImageRef) -> ContainerSpec {
        ContainerSpec {
            name: self.container_name().to_string(),
            image: image.to_string(),
            rule: self.name.clone(),
            ports: self.run.ports.clone(),
            env: self.run.env.clone(),
            volumes: self.run.volumes.clone(),
            network: self.run.network.clone(),
            restart: self.run.restart.clone(),
            labels: self.run.labels.clone(),
            command: self.run.command.clone(),
        }
    }
}

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// docker CLI binary
    pub docker_bin: String,
    pub command_timeout_secs: u64,
    pub api_host: String,
    pub api_port: u16,
    /// Required `X-API-Key` value; API is open when unset
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub reconcile_on_startup: bool,
    /// 0 disables periodic reconciliation
    pub reconcile_interval_secs: u64,
    pub stats_interval_secs: u64,
    pub max_concurrent_deploys: usize,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub health_poll_ms: u64,
    pub webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,
    pub history_capacity: usize,
    /// Where deployment history is exported on shutdown
    pub history_dir: Option<String>,
    /// Log what would be deployed without touching containers
    pub dry_run: bool,
    pub rules: Vec<DeployRule>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            api_host: DEFAULT_API_HOST.to_string(),
            api_port: DEFAULT_API_PORT,
            api_key: None,
            reconcile_on_startup: true,
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
            max_concurrent_deploys: DEFAULT_MAX_CONCURRENT_DEPLOYS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            retry_max_ms: DEFAULT_RETRY_MAX_MS,
            health_poll_ms: DEFAULT_HEALTH_POLL_MS,
            webhook_url: None,
            webhook_timeout_secs: DEFAULT_WEBHOOK_TIMEOUT_SECS,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            history_dir: None,
            dry_run: false,
            rules: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Read and parse a JSON config file
    pub fn load(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            return Err(AppError::new(
                ErrorCode::ConfigFileMissing,
                format!("Config file not found: {}", path.display()),
            ));
        }
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json(&raw)?;
        info!(path = %path.display(), rules = config.rules.len(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_json(raw: &str) -> AppResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| AppError::with_source(ErrorCode::ConfigParseError, "Invalid config JSON", e))
    }

    /// Apply `DOCKPLOY_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> AppResult<()> {
        if let Ok(host) = std::env::var("DOCKPLOY_API_HOST") {
            self.api_host = host;
        }
        if let Ok(port) = std::env::var("DOCKPLOY_API_PORT").or_else(|_| std::env::var("PORT")) {
            self.api_port = port
                .parse()
                .map_err(|_| AppError::invalid_config(format!("Invalid API port: {}", port)))?;
        }
        if let Ok(key) = std::env::var("DOCKPLOY_API_KEY") {
            if !key.is_empty() {
                info!("🔑 DOCKPLOY_API_KEY configured (key hidden)");
                self.api_key = Some(key);
            }
        }
        if let Ok(bin) = std::env::var("DOCKPLOY_DOCKER_BIN") {
            self.docker_bin = bin;
        }
        if let Ok(url) = std::env::var("DOCKPLOY_WEBHOOK_URL") {
            self.webhook_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Ok(flag) = std::env::var("DOCKPLOY_DRY_RUN") {
            self.dry_run = matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    /// Reject configurations the daemon cannot act on safely
    pub fn validate(&self) -> AppResult<()> {
        if self.rules.is_empty() {
            return Err(AppError::invalid_config("No deployment rules configured"));
        }
        if self.max_concurrent_deploys == 0 {
            return Err(AppError::invalid_config("max_concurrent_deploys must be at least 1"));
        }
        if self.history_capacity == 0 {
            return Err(AppError::invalid_config("history_capacity must be at least 1"));
        }

        let mut names = HashSet::new();
        let mut containers = HashSet::new();
        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                return Err(AppError::invalid_config("Rule name must not be empty"));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(AppError::new(
                    ErrorCode::ConfigDuplicateRule,
                    format!("Duplicate rule name: {}", rule.name),
                ));
            }
            if rule.repository.trim().is_empty() {
                return Err(AppError::invalid_config(format!(
                    "Rule {} has an empty repository",
                    rule.name
                )));
            }
            if !is_valid_container_name(rule.container_name()) {
                return Err(AppError::invalid_config(format!(
                    "Rule {} has an invalid container name: {}",
                    rule.name,
                    rule.container_name()
                )));
            }
            if !containers.insert(rule.container_name()) {
                return Err(AppError::new(
                    ErrorCode::ConfigDuplicateRule,
                    format!("Container {} is managed by more than one rule", rule.container_name()),
                ));
            }
            TagPattern::new(&rule.tag_pattern)?;
        }
        Ok(())
    }

    pub fn enabled_rules(&self) -> impl Iterator<Item = &DeployRule> {
        self.rules.iter().filter(|r| r.enabled)
    }

    pub fn rule(&self, name: &str) -> Option<&DeployRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_ms)
    }
}

/// Docker container names: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`
pub fn is_valid_container_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn default_tag_pattern() -> String {
    "*".to_string()
}
fn default_health_timeout() -> u64 {
    DEFAULT_HEALTH_TIMEOUT_SECS
}
fn default_startup_grace() -> u64 {
    DEFAULT_STARTUP_GRACE_SECS
}
fn default_stop_timeout() -> u64 {
    DEFAULT_STOP_TIMEOUT_SECS
}
fn default_true() -> bool {
    true
}
