//! Deployment pipeline
//!
//! Replaces a rule's container with one running the new image:
//! park the old container under a backup name, run the new one, wait for it
//! to come up healthy, then drop the backup. Any failure after parking puts
//! the old container back.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use super::matcher::{is_upgrade, TagPattern};
use crate::history::DeploymentHistory;
use crate::models::config::{DaemonConfig, DeployRule};
use crate::models::errors::{AppError, AppResult, ErrorCode};
use crate::models::types::{ContainerInfo, DeploymentRecord, DeploymentStatus, ImageRef, Trigger};
use crate::providers::docker::DockerEngine;
use crate::providers::webhook::WebhookNotifier;
use crate::utils::retry::RetryPolicy;

/// A resolved image to deploy under some rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub image: ImageRef,
    /// Full image ID (`sha256:...`)
    pub image_id: String,
    pub trigger: Trigger,
}

pub struct Deployer {
    engine: Arc<dyn DockerEngine>,
    history: Arc<DeploymentHistory>,
    notifier: Option<Arc<WebhookNotifier>>,
    retry: RetryPolicy,
    health_poll: Duration,
    dry_run: bool,
    /// Bounds deployments running at once across all rules
    semaphore: Arc<Semaphore>,
    /// One deployment at a time per rule
    rule_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Deployer {
    pub fn new(engine: Arc<dyn DockerEngine>, history: Arc<DeploymentHistory>, config: &DaemonConfig) -> Self {
        Self {
            engine,
            history,
            notifier: None,
            retry: RetryPolicy::new(config.max_retries, config.retry_base_ms, config.retry_max_ms),
            health_poll: config.health_poll_interval(),
            dry_run: config.dry_run,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_deploys.max(1))),
            rule_locks: DashMap::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<WebhookNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn engine(&self) -> &Arc<dyn DockerEngine> {
        &self.engine
    }

    pub fn history(&self) -> &Arc<DeploymentHistory> {
        &self.history
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn rule_lock(&self, rule: &str) -> Arc<Mutex<()>> {
        self.rule_locks
            .entry(rule.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Resolve an image reference to a request, `None` if not present locally
    pub async fn request_for(&self, image: ImageRef, trigger: Trigger) -> AppResult<Option<DeployRequest>> {
        let reference = image.to_string();
        let engine = self.engine.as_ref();
        let reference = reference.as_str();
        let (info, _) = self
            .retry
            .run("inspect image", move || engine.inspect_image(reference))
            .await;
        Ok(info?.map(|info| DeployRequest {
            image,
            image_id: info.id,
            trigger,
        }))
    }

    /// Build a manual request for `rule`. Without a tag, the rule's pattern
    /// must name exactly one tag.
    pub async fn manual_request(&self, rule: &DeployRule, tag: Option<&str>) -> AppResult<DeployRequest> {
        let tag = match tag.map(str::trim).filter(|t| !t.is_empty()) {
            Some(tag) => tag.to_string(),
            None => {
                let pattern = TagPattern::new(&rule.tag_pattern)?;
                if !pattern.is_literal() {
                    return Err(AppError::bad_request(format!(
                        "Rule {} matches {}; a tag is required",
                        rule.name,
                        pattern.as_str()
                    )));
                }
                pattern.as_str().to_string()
            }
        };

        let image = ImageRef::new(rule.repository.clone(), tag);
        let display = image.to_string();
        self.request_for(image, Trigger::Manual)
            .await?
            .ok_or_else(|| AppError::image_not_found(&display))
    }

    /// Run one deployment to completion and record its outcome
    pub async fn deploy(&self, rule: &DeployRule, request: DeployRequest) -> DeploymentRecord {
        let lock = self.rule_lock(&rule.name);
        let _guard = lock.lock().await;
        // The semaphore is never closed
        let _permit = self.semaphore.acquire().await.ok();

        let record = DeploymentRecord::start(&rule.name, &request.image, &request.image_id, request.trigger);
        info!(
            rule = %rule.name,
            image = %request.image,
            trigger = request.trigger.as_str(),
            "🚀 Deploying"
        );

        let record = self.execute(rule, &request, record).await;
        match record.status {
            DeploymentStatus::Succeeded => info!("✅ {}", record.summary()),
            DeploymentStatus::Skipped if record.trigger == Trigger::Reconcile => debug!("{}", record.summary()),
            DeploymentStatus::Skipped | DeploymentStatus::DryRun => info!("{}", record.summary()),
            DeploymentStatus::RolledBack => warn!("↩️ {}", record.summary()),
            DeploymentStatus::Failed => error!("❌ {}", record.summary()),
        }

        // Periodic reconciles of an up-to-date rule are noise
        if !(record.status == DeploymentStatus::Skipped && record.trigger == Trigger::Reconcile) {
            self.history.record(record.clone());
        }
        if let Some(ref notifier) = self.notifier {
            notifier.notify(&record).await;
        }
        record
    }

    async fn execute(&self, rule: &DeployRule, request: &DeployRequest, mut record: DeploymentRecord) -> DeploymentRecord {
        let name = rule.container_name();

        let current = match self.inspect_container(name).await {
            Ok(current) => current,
            Err(e) => return record.finish(DeploymentStatus::Failed, Some(e.to_string())),
        };

        if let Some(ref container) = current {
            record.previous_image = Some(container.image.clone());
            if let Some(reason) = skip_reason(rule, container, request) {
                return record.finish(DeploymentStatus::Skipped, Some(reason));
            }
        }

        let spec = rule.container_spec(&request.image);
        if self.dry_run {
            let command = format!("docker {}", spec.to_run_args().join(" "));
            return record.finish(DeploymentStatus::DryRun, Some(format!("would run: {}", command)));
        }

        let backup = match current {
            Some(_) => match self.park(rule).await {
                Ok(backup) => Some(backup),
                Err(e) => {
                    return record.finish(
                        DeploymentStatus::Failed,
                        Some(format!("could not park current container: {}", e)),
                    )
                }
            },
            None => None,
        };

        let engine = self.engine.as_ref();
        let spec = &spec;
        let (run_result, attempts) = self.retry.run("run container", move || engine.run_container(spec)).await;
        record.attempts = attempts;

        let failure = match run_result {
            Ok(container_id) => {
                debug!(rule = %rule.name, container = %container_id, "Container started");
                record.container_id = Some(container_id);
                match self.wait_healthy(rule).await {
                    Ok(()) => {
                        if let Some(ref backup) = backup {
                            if let Err(e) = self.engine.remove_container(backup).await {
                                warn!(rule = %rule.name, "Could not remove previous container {}: {}", backup, e);
                            }
                        }
                        return record.finish(DeploymentStatus::Succeeded, None);
                    }
                    Err(e) => e,
                }
            }
            Err(e) => e,
        };

        // Roll back: the failed container may exist even if `run` errored
        if let Err(e) = self.engine.remove_container(name).await {
            if e.code != ErrorCode::DockerNotFound {
                warn!(rule = %rule.name, "Could not remove failed container: {}", e);
            }
        }

        match backup {
            Some(backup) => match self.restore(rule, &backup).await {
                Ok(()) => record.finish(DeploymentStatus::RolledBack, Some(failure.to_string())),
                Err(e) => {
                    let e = AppError::rollback_failed(e.to_string());
                    record.finish(DeploymentStatus::Failed, Some(format!("{}; {}", failure, e)))
                }
            },
            None => record.finish(DeploymentStatus::Failed, Some(failure.to_string())),
        }
    }

    async fn inspect_container(&self, name: &str) -> AppResult<Option<ContainerInfo>> {
        let engine = self.engine.as_ref();
        self.retry
            .run("inspect container", move || engine.inspect_container(name))
            .await
            .0
    }

    /// Move the running container out of the way; returns its new name
    async fn park(&self, rule: &DeployRule) -> AppResult<String> {
        let name = rule.container_name();
        let backup = rule.backup_name();

        // Left over from an interrupted deployment
        if self.inspect_container(&backup).await?.is_some() {
            warn!(rule = %rule.name, "Removing stale backup container {}", backup);
            self.engine.remove_container(&backup).await?;
        }

        self.engine.rename_container(name, &backup).await?;
        if let Err(e) = self.engine.stop_container(&backup, rule.stop_timeout_secs).await {
            // The stop may still land on the daemon side, so bring it back up
            match self.engine.rename_container(&backup, name).await {
                Ok(()) => {
                    if let Err(undo) = self.engine.start_container(name).await {
                        error!(rule = %rule.name, "Could not restart {} after failed stop: {}", name, undo);
                    }
                }
                Err(undo) => error!(rule = %rule.name, "Could not restore container name after failed stop: {}", undo),
            }
            return Err(e);
        }
        debug!(rule = %rule.name, "Parked {} as {}", name, backup);
        Ok(backup)
    }

    async fn restore(&self, rule: &DeployRule, backup: &str) -> AppResult<()> {
        let name = rule.container_name();
        self.engine.rename_container(backup, name).await?;
        self.engine.start_container(name).await?;
        info!(rule = %rule.name, "Restored previous container {}", name);
        Ok(())
    }

    /// Poll until the new container is healthy, has died, or time runs out
    async fn wait_healthy(&self, rule: &DeployRule) -> AppResult<()> {
        let name = rule.container_name();
        let deadline = Instant::now() + rule.health_timeout();
        let mut running_since: Option<Instant> = None;

        loop {
            match self.engine.inspect_container(name).await {
                Ok(Some(info)) => match health_verdict(&info) {
                    HealthVerdict::Healthy => return Ok(()),
                    HealthVerdict::Failed(reason) => return Err(AppError::unhealthy(reason)),
                    HealthVerdict::RunningUnchecked => {
                        let since = *running_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= rule.startup_grace() {
                            return Ok(());
                        }
                    }
                    HealthVerdict::Pending => running_since = None,
                },
                Ok(None) => return Err(AppError::unhealthy("container disappeared after start")),
                Err(e) if e.is_retryable() => debug!("Health check failed, retrying: {}", e),
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(AppError::health_timeout(format!(
                    "{} not healthy after {}s",
                    name, rule.health_timeout_secs
                )));
            }
            tokio::time::sleep(self.health_poll).await;
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum HealthVerdict {
    Healthy,
    /// Running, image defines no healthcheck
    RunningUnchecked,
    Pending,
    Failed(String),
}

fn health_verdict(info: &ContainerInfo) -> HealthVerdict {
    if info.has_stopped() {
        return HealthVerdict::Failed(format!("container exited with code {}", info.exit_code));
    }
    match info.health.as_deref() {
        Some("unhealthy") => HealthVerdict::Failed("healthcheck reported unhealthy".to_string()),
        Some("healthy") if info.running => HealthVerdict::Healthy,
        None if info.running && info.status == "running" => HealthVerdict::RunningUnchecked,
        _ => HealthVerdict::Pending,
    }
}

/// Why the current container should be left alone, if it should
fn skip_reason(rule: &DeployRule, current: &ContainerInfo, request: &DeployRequest) -> Option<String> {
    if current.running && current.image_id == request.image_id {
        return Some("already running this image".to_string());
    }
    if rule.semver_only {
        let current_tag = ImageRef::parse(&current.image)?.tag;
        if !is_upgrade(&current_tag, &request.image.tag) {
            return Some(format!("{} is not newer than running {}", request.image.tag, current_tag));
        }
    }
    None
}
