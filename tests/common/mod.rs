//! Scripted in-memory Docker engine shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use dockployment::history::DeploymentHistory;
use dockployment::models::{
    AppError, AppResult, ContainerInfo, ContainerSpec, DaemonConfig, DeployRule, DockerEvent, ErrorCode,
    ImageInfo, ImageSummary,
};
use dockployment::{Deployer, DockerEngine};

/// How containers started by `run_container` behave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    Healthy,
    NoHealthcheck,
    Unhealthy,
    Exits,
    /// Healthcheck never leaves `starting`
    Starting,
}

/// What one `stream_events` call does. Once the script runs out the
/// stream delivers `MockState::events` and stays connected.
#[derive(Debug, Clone)]
pub enum StreamStep {
    /// Fail straight away
    Fail(ErrorCode),
    /// Deliver these events, then end cleanly
    End(Vec<DockerEvent>),
    /// Stay connected this long, then end cleanly
    Hold(Duration),
}

pub struct MockState {
    pub images: Vec<ImageSummary>,
    /// Keyed by container name
    pub containers: HashMap<String, ContainerInfo>,
    /// Delivered by the next `stream_events` call
    pub events: Vec<DockerEvent>,
    pub start_mode: StartMode,
    /// Retryable `run` failures before one succeeds
    pub transient_run_failures: u32,
    /// Every `run` fails permanently
    pub run_always_fails: bool,
    pub runs: Vec<ContainerSpec>,
    /// How long each `inspect_image` takes
    pub inspect_image_delay: Duration,
    /// How long each `stop` takes
    pub stop_delay: Duration,
    /// `stop` times out, though the daemon still stops the container
    pub stop_fails: bool,
    /// `start` fails permanently
    pub start_fails: bool,
    /// Containers being stopped right now, and the most seen at once
    pub stopping: usize,
    pub max_stopping: usize,
    pub stream_script: VecDeque<StreamStep>,
    pub stream_since: Vec<Option<i64>>,
    next_id: u32,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            images: Vec::new(),
            containers: HashMap::new(),
            events: Vec::new(),
            start_mode: StartMode::Healthy,
            transient_run_failures: 0,
            run_always_fails: false,
            runs: Vec::new(),
            inspect_image_delay: Duration::ZERO,
            stop_delay: Duration::ZERO,
            stop_fails: false,
            start_fails: false,
            stopping: 0,
            max_stopping: 0,
            stream_script: VecDeque::new(),
            stream_since: Vec::new(),
            next_id: 0,
        }
    }
}

#[derive(Default)]
pub struct MockEngine {
    pub state: Mutex<MockState>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn add_image(&self, repository: &str, tag: &str, id: &str, created: i64) {
        self.with(|s| {
            s.images.push(ImageSummary {
                id: id.to_string(),
                repository: repository.to_string(),
                tag: tag.to_string(),
                created_at: Utc.timestamp_opt(created, 0).single(),
            })
        });
    }

    /// A running container as if deployed earlier
    pub fn add_running(&self, name: &str, image: &str, image_id: &str) {
        self.with(|s| {
            s.containers.insert(
                name.to_string(),
                ContainerInfo {
                    id: format!("old-{}", name),
                    name: name.to_string(),
                    image_id: image_id.to_string(),
                    image: image.to_string(),
                    status: "running".to_string(),
                    running: true,
                    exit_code: 0,
                    health: None,
                },
            );
        });
    }

    pub fn container(&self, name: &str) -> Option<ContainerInfo> {
        self.with(|s| s.containers.get(name).cloned())
    }

    pub fn run_count(&self) -> usize {
        self.with(|s| s.runs.len())
    }

    pub fn push_event(&self, event: DockerEvent) {
        self.with(|s| s.events.push(event));
    }

    pub fn script_stream(&self, steps: impl IntoIterator<Item = StreamStep>) {
        self.with(|s| s.stream_script.extend(steps));
    }

    pub fn stream_connects(&self) -> usize {
        self.with(|s| s.stream_since.len())
    }
}

#[async_trait]
impl DockerEngine for MockEngine {
    async fn ping(&self) -> AppResult<String> {
        Ok("24.0.7-mock".to_string())
    }

    async fn list_images(&self) -> AppResult<Vec<ImageSummary>> {
        Ok(self.with(|s| s.images.clone()))
    }

    async fn inspect_image(&self, reference: &str) -> AppResult<Option<ImageInfo>> {
        let delay = self.with(|s| s.inspect_image_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.with(|s| {
            s.images
                .iter()
                .find(|i| format!("{}:{}", i.repository, i.tag) == reference || i.id == reference)
                .map(|i| ImageInfo {
                    id: i.id.clone(),
                    repo_tags: vec![format!("{}:{}", i.repository, i.tag)],
                    created: i.created_at,
                })
        }))
    }

    async fn inspect_container(&self, name: &str) -> AppResult<Option<ContainerInfo>> {
        Ok(self.container(name))
    }

    async fn run_container(&self, spec: &ContainerSpec) -> AppResult<String> {
        self.with(|s| {
            s.runs.push(spec.clone());
            if s.transient_run_failures > 0 {
                s.transient_run_failures -= 1;
                return Err(AppError::docker_unavailable("Cannot connect to the Docker daemon"));
            }
            if s.run_always_fails {
                return Err(AppError::start_failed("port is already allocated"));
            }
            if s.containers.contains_key(&spec.name) {
                return Err(AppError::docker_failed(format!("Conflict. The container name \"/{}\" is already in use", spec.name)));
            }

            let image_id = s
                .images
                .iter()
                .find(|i| format!("{}:{}", i.repository, i.tag) == spec.image)
                .map(|i| i.id.clone())
                .unwrap_or_else(|| "sha256:unknown".to_string());
            s.next_id += 1;
            let id = format!("new-{}", s.next_id);

            let (status, running, exit_code, health) = match s.start_mode {
                StartMode::Healthy => ("running", true, 0, Some("healthy")),
                StartMode::NoHealthcheck => ("running", true, 0, None),
                StartMode::Unhealthy => ("running", true, 0, Some("unhealthy")),
                StartMode::Exits => ("exited", false, 1, None),
                StartMode::Starting => ("running", true, 0, Some("starting")),
            };
            s.containers.insert(
                spec.name.clone(),
                ContainerInfo {
                    id: id.clone(),
                    name: spec.name.clone(),
                    image_id,
                    image: spec.image.clone(),
                    status: status.to_string(),
                    running,
                    exit_code,
                    health: health.map(String::from),
                },
            );
            Ok(id)
        })
    }

    async fn stop_container(&self, name: &str, _timeout_secs: u64) -> AppResult<()> {
        let delay = self.with(|s| {
            s.stopping += 1;
            s.max_stopping = s.max_stopping.max(s.stopping);
            s.stop_delay
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| {
            s.stopping -= 1;
            match s.containers.get_mut(name) {
                Some(c) => {
                    c.running = false;
                    c.status = "exited".to_string();
                    if s.stop_fails {
                        Err(AppError::docker_timeout(format!("docker stop timed out for {}", name)))
                    } else {
                        Ok(())
                    }
                }
                None => Err(AppError::docker_not_found(format!("No such container: {}", name))),
            }
        })
    }

    async fn start_container(&self, name: &str) -> AppResult<()> {
        self.with(|s| match s.containers.get_mut(name) {
            Some(_) if s.start_fails => Err(AppError::docker_failed(format!("cannot start {}", name))),
            Some(c) => {
                c.running = true;
                c.status = "running".to_string();
                Ok(())
            }
            None => Err(AppError::docker_not_found(format!("No such container: {}", name))),
        })
    }

    async fn remove_container(&self, name: &str) -> AppResult<()> {
        self.with(|s| match s.containers.remove(name) {
            Some(_) => Ok(()),
            None => Err(AppError::docker_not_found(format!("No such container: {}", name))),
        })
    }

    async fn rename_container(&self, name: &str, new_name: &str) -> AppResult<()> {
        self.with(|s| {
            if s.containers.contains_key(new_name) {
                return Err(AppError::docker_failed(format!("name {} is already in use", new_name)));
            }
            match s.containers.remove(name) {
                Some(mut c) => {
                    c.name = new_name.to_string();
                    s.containers.insert(new_name.to_string(), c);
                    Ok(())
                }
                None => Err(AppError::docker_not_found(format!("No such container: {}", name))),
            }
        })
    }

    async fn stream_events(&self, since: Option<i64>, tx: mpsc::Sender<DockerEvent>) -> AppResult<()> {
        let (step, events) = self.with(|s| {
            s.stream_since.push(since);
            match s.stream_script.pop_front() {
                Some(step) => (Some(step), Vec::new()),
                None => (None, std::mem::take(&mut s.events)),
            }
        });
        match step {
            Some(StreamStep::Fail(code)) => return Err(AppError::new(code, "scripted stream failure")),
            Some(StreamStep::End(events)) => {
                for event in events {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                return Ok(());
            }
            Some(StreamStep::Hold(duration)) => {
                tokio::time::sleep(duration).await;
                return Ok(());
            }
            None => {}
        }
        for event in events {
            if tx.send(event).await.is_err() {
                return Ok(());
            }
        }
        // Stay connected like `docker events` does
        tx.closed().await;
        Ok(())
    }
}

/// Parse an event the way `docker events --format '{{json .}}'` prints it
pub fn image_event(action: &str, name: &str, time: i64) -> DockerEvent {
    serde_json::from_value(serde_json::json!({
        "Type": "image",
        "Action": action,
        "Actor": { "ID": "sha256:ignored", "Attributes": { "name": name } },
        "time": time,
        "timeNano": time * 1_000_000_000,
    }))
    .unwrap()
}

/// Config with short timings so health checks and retries finish fast
pub fn fast_config(rules: Vec<DeployRule>) -> DaemonConfig {
    let rules = rules
        .into_iter()
        .map(|mut rule| {
            rule.health_timeout_secs = 1;
            rule.startup_grace_secs = 0;
            rule.stop_timeout_secs = 1;
            rule
        })
        .collect();
    DaemonConfig {
        max_retries: 3,
        retry_base_ms: 1,
        retry_max_ms: 5,
        health_poll_ms: 10,
        reconcile_on_startup: false,
        reconcile_interval_secs: 0,
        stats_interval_secs: 0,
        rules,
        ..DaemonConfig::default()
    }
}

pub fn deployer(engine: Arc<MockEngine>, config: &DaemonConfig) -> Arc<Deployer> {
    let history = Arc::new(DeploymentHistory::new(config.history_capacity));
    Arc::new(Deployer::new(engine, history, config))
}
