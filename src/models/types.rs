//! Type definitions for the deployment daemon
//! Image references, Docker engine views and deployment records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Tag Docker assumes when a reference has none
pub const DEFAULT_TAG: &str = "latest";

/// Label stamped on every container this daemon starts
pub const RULE_LABEL: &str = "dockployment.rule";

/// Registry prefixes that all mean Docker Hub
const DOCKER_HUB_PREFIXES: [&str; 3] = ["docker.io/", "index.docker.io/", "registry-1.docker.io/"];

// ============================================
// Image references
// ============================================

/// A parsed `repository[:tag][@digest]` image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse an image reference as printed by the docker CLI.
    ///
    /// Bare image IDs (`sha256:...`) are not references and yield `None`.
    pub fn parse(reference: &str) -> Option<Self> {
        let reference = reference.trim();
        if reference.is_empty() || reference.starts_with("sha256:") {
            return None;
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) if !digest.is_empty() => (name, Some(digest.to_string())),
            Some(_) => return None,
            None => (reference, None),
        };

        // A colon before the last slash belongs to a registry port
        let last_segment = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name[last_segment..].rfind(':') {
            Some(offset) => {
                let idx = last_segment + offset;
                (&name[..idx], &name[idx + 1..])
            }
            None => (name, DEFAULT_TAG),
        };

        if repository.is_empty() || tag.is_empty() || repository.ends_with('/') {
            return None;
        }

        Some(Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest,
        })
    }

    /// Build from a repository and tag pair
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
            digest: None,
        }
    }

    /// Repository in the short form `docker` prints for Docker Hub images
    pub fn familiar_repository(&self) -> String {
        normalize_repository(&self.repository)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)?;
        if let Some(ref digest) = self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Strip Docker Hub registry and `library/` prefixes
pub fn normalize_repository(repository: &str) -> String {
    let stripped = DOCKER_HUB_PREFIXES
        .iter()
        .find_map(|prefix| repository.strip_prefix(prefix))
        .unwrap_or(repository);
    stripped.strip_prefix("library/").unwrap_or(stripped).to_string()
}

// ============================================
// Docker events
// ============================================

/// Event actor (the object the event is about)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventActor {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

/// One line of `docker events --format '{{json .}}'`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerEvent {
    #[serde(rename = "Type", default)]
    pub event_type: String,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Actor", default)]
    pub actor: EventActor,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub time: i64,
    #[serde(rename = "timeNano", default)]
    pub time_nano: i64,
}

impl DockerEvent {
    /// Actions that can make a new tagged image appear locally
    pub const TRIGGER_ACTIONS: [&'static str; 4] = ["tag", "pull", "load", "import"];

    pub fn is_deploy_trigger(&self) -> bool {
        self.event_type == "image" && Self::TRIGGER_ACTIONS.contains(&self.action.as_str())
    }

    /// Image reference the event refers to
    pub fn image_ref(&self) -> Option<ImageRef> {
        self.actor
            .attributes
            .get("name")
            .and_then(|name| ImageRef::parse(name))
            .or_else(|| self.id.as_deref().and_then(ImageRef::parse))
            .or_else(|| ImageRef::parse(&self.actor.id))
    }
}

// ============================================
// Engine views
// ============================================

/// Row of `docker image ls`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageSummary {
    pub id: String,
    pub repository: String,
    pub tag: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl ImageSummary {
    pub fn image_ref(&self) -> ImageRef {
        ImageRef::new(self.repository.clone(), self.tag.clone())
    }
}

/// Subset of `docker image inspect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub created: Option<DateTime<Utc>>,
}

/// Subset of `docker container inspect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    /// Image ID the container runs (`sha256:...`)
    pub image_id: String,
    /// Reference the container was created from
    pub image: String,
    pub status: String,
    pub running: bool,
    pub exit_code: i64,
    /// Healthcheck status, absent when the image defines none
    pub health: Option<String>,
}

impl ContainerInfo {
    pub fn has_stopped(&self) -> bool {
        !self.running && matches!(self.status.as_str(), "exited" | "dead")
    }
}

/// Everything needed to `docker run` a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub rule: String,
    pub ports: Vec<String>,
    pub env: Vec<String>,
    pub volumes: Vec<String>,
    pub network: Option<String>,
    pub restart: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub command: Vec<String>,
}

impl ContainerSpec {
    /// Arguments for the docker CLI, starting at the `run` subcommand
    pub fn to_run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string(), "--name".to_string(), self.name.clone()];

        if let Some(ref restart) = self.restart {
            args.push("--restart".to_string());
            args.push(restart.clone());
        }
        if let Some(ref network) = self.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        for port in &self.ports {
            args.push("-p".to_string());
            args.push(port.clone());
        }
        for var in &self.env {
            args.push("-e".to_string());
            args.push(var.clone());
        }
        for volume in &self.volumes {
            args.push("-v".to_string());
            args.push(volume.clone());
        }
        for (key, value) in &self.labels {
            if key == RULE_LABEL {
                continue;
            }
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push("--label".to_string());
        args.push(format!("{}={}", RULE_LABEL, self.rule));

        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

// ============================================
// Deployment records
// ============================================

/// What caused a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// A docker image event
    Event,
    /// Startup or periodic reconciliation
    Reconcile,
    /// POST /v1/deploy
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Event => "event",
            Trigger::Reconcile => "reconcile",
            Trigger::Manual => "manual",
        }
    }
}

/// Final outcome of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Succeeded,
    Skipped,
    RolledBack,
    Failed,
    DryRun,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Succeeded => "succeeded",
            DeploymentStatus::Skipped => "skipped",
            DeploymentStatus::RolledBack => "rolled_back",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::DryRun => "dry_run",
        }
    }

    /// Whether this outcome changed (or tried to change) a running container
    pub fn is_notable(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Succeeded | DeploymentStatus::RolledBack | DeploymentStatus::Failed
        )
    }
}

/// One deployment attempt, from trigger to outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub rule: String,
    pub image: String,
    pub image_id: String,
    pub previous_image: Option<String>,
    pub container_id: Option<String>,
    pub trigger: Trigger,
    pub status: DeploymentStatus,
    pub reason: Option<String>,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

impl DeploymentRecord {
    pub fn start(rule: &str, image: &ImageRef, image_id: &str, trigger: Trigger) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            rule: rule.to_string(),
            image: image.to_string(),
            image_id: image_id.to_string(),
            previous_image: None,
            container_id: None,
            trigger,
            status: DeploymentStatus::Skipped,
            reason: None,
            attempts: 0,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
        }
    }

    /// Close the record with its outcome
    pub fn finish(mut self, status: DeploymentStatus, reason: Option<String>) -> Self {
        let now = Utc::now();
        self.status = status;
        self.reason = reason;
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(now);
        self
    }

    /// Human-readable one-line summary for logs
    pub fn summary(&self) -> String {
        let mut line = format!(
            "[{}] rule={} image={} trigger={} took={}ms",
            self.status.as_str(),
            self.rule,
            self.image,
            self.trigger.as_str(),
            self.duration_ms
        );
        if let Some(ref reason) = self.reason {
            line.push_str(" reason=");
            line.push_str(reason);
        }
        line
    }
}

/// Snapshot served by `/v1/stats`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonStats {
    pub events_received: u64,
    pub events_ignored: u64,
    pub triggers: u64,
    pub reconciles: u64,
    pub deployments_total: u64,
    pub deployments_succeeded: u64,
    pub deployments_failed: u64,
    pub deployments_rolled_back: u64,
    pub deployments_skipped: u64,
    pub avg_deploy_ms: f64,
    pub uptime_seconds: u64,
}
