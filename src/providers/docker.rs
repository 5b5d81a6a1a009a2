//! Docker Engine Provider
//!
//! Talks to the local Docker daemon through the `docker` CLI, so whatever
//! `DOCKER_HOST`/context the operator has configured is honoured without
//! the daemon needing its own socket handling.
//!
//! Every command asks for `{{json .}}` output and is bounded by a timeout.
//! stderr is classified into error codes:
//! - daemon unreachable → `DOCKER_UNAVAILABLE` (retryable)
//! - "No such ..." → not found (`Ok(None)` for inspects)
//! - anything else → `DOCKER_COMMAND_FAILED`

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::errors::{AppError, AppResult, ErrorCode};
use crate::models::types::{ContainerInfo, ContainerSpec, DockerEvent, ImageInfo, ImageSummary};
use crate::utils::constants::{DOCKER_NOT_FOUND_MARKER, DOCKER_UNAVAILABLE_MARKERS};

/// Operations the deployer and watcher need from Docker
#[async_trait]
pub trait DockerEngine: Send + Sync {
    /// Server version, as a liveness check
    async fn ping(&self) -> AppResult<String>;

    async fn list_images(&self) -> AppResult<Vec<ImageSummary>>;

    async fn inspect_image(&self, reference: &str) -> AppResult<Option<ImageInfo>>;

    async fn inspect_container(&self, name: &str) -> AppResult<Option<ContainerInfo>>;

    /// Create and start a container, returning its ID
    async fn run_container(&self, spec: &ContainerSpec) -> AppResult<String>;

    async fn stop_container(&self, name: &str, timeout_secs: u64) -> AppResult<()>;

    async fn start_container(&self, name: &str) -> AppResult<()>;

    /// Force-remove a container (running or not)
    async fn remove_container(&self, name: &str) -> AppResult<()>;

    async fn rename_container(&self, name: &str, new_name: &str) -> AppResult<()>;

    /// Forward image events to `tx` until the stream ends or the receiver
    /// is dropped. `since` is a unix timestamp to resume from.
    async fn stream_events(&self, since: Option<i64>, tx: mpsc::Sender<DockerEvent>) -> AppResult<()>;
}

// ============================================
// CLI output shapes
// ============================================

#[derive(Debug, Deserialize)]
struct VersionOutput {
    #[serde(rename = "Server")]
    server: Option<ServerVersion>,
}

#[derive(Debug, Deserialize)]
struct ServerVersion {
    #[serde(rename = "Version")]
    version: String,
}

#[derive(Debug, Deserialize)]
struct ImageLsRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Repository")]
    repository: String,
    #[serde(rename = "Tag")]
    tag: String,
    #[serde(rename = "CreatedAt", default)]
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct ImageInspect {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Option<Vec<String>>,
    #[serde(rename = "Created", default)]
    created: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContainerInspect {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "State")]
    state: ContainerStateRaw,
    #[serde(rename = "Config", default)]
    config: Option<ContainerConfigRaw>,
}

#[derive(Debug, Deserialize)]
struct ContainerStateRaw {
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Running", default)]
    running: bool,
    #[serde(rename = "ExitCode", default)]
    exit_code: i64,
    #[serde(rename = "Health", default)]
    health: Option<HealthRaw>,
}

#[derive(Debug, Deserialize)]
struct HealthRaw {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerConfigRaw {
    #[serde(rename = "Image", default)]
    image: String,
}

impl From<ContainerInspect> for ContainerInfo {
    fn from(raw: ContainerInspect) -> Self {
        Self {
            id: raw.id,
            name: raw.name.trim_start_matches('/').to_string(),
            image_id: raw.image,
            image: raw.config.map(|c| c.image).unwrap_or_default(),
            status: raw.state.status,
            running: raw.state.running,
            exit_code: raw.state.exit_code,
            health: raw.state.health.map(|h| h.status),
        }
    }
}

/// Parse `CreatedAt` from `docker image ls`, e.g. `2024-01-01 10:00:00 +0000 UTC`
pub fn parse_created_at(raw: &str) -> Option<DateTime<Utc>> {
    let mut parts = raw.split_whitespace();
    let stamp = format!("{} {} {}", parts.next()?, parts.next()?, parts.next()?);
    DateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S %z")
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(&stamp[..19.min(stamp.len())], "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// Parse one `docker image ls` JSON line; `<none>` rows are dropped
pub fn parse_image_row(line: &str) -> AppResult<Option<ImageSummary>> {
    let row: ImageLsRow = serde_json::from_str(line)?;
    if row.repository == "<none>" || row.tag == "<none>" {
        return Ok(None);
    }
    Ok(Some(ImageSummary {
        id: row.id,
        repository: row.repository,
        tag: row.tag,
        created_at: parse_created_at(&row.created_at),
    }))
}

/// `inspect --format '{{json .}}'` prints one object per argument
pub fn parse_container_inspect(output: &str) -> AppResult<ContainerInfo> {
    let raw: ContainerInspect = serde_json::from_str(output.trim())?;
    Ok(raw.into())
}

pub fn parse_image_inspect(output: &str) -> AppResult<ImageInfo> {
    let raw: ImageInspect = serde_json::from_str(output.trim())?;
    Ok(ImageInfo {
        id: raw.id,
        repo_tags: raw.repo_tags.unwrap_or_default(),
        created: raw
            .created
            .as_deref()
            .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

/// Map a failed docker invocation to an error code
pub fn classify_failure(args: &[String], stderr: &str) -> AppError {
    let stderr = stderr.trim();
    let command = args.first().map(String::as_str).unwrap_or("docker");
    if DOCKER_UNAVAILABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
        AppError::docker_unavailable(format!("docker {}: {}", command, stderr))
    } else if stderr.contains(DOCKER_NOT_FOUND_MARKER) {
        AppError::docker_not_found(format!("docker {}: {}", command, stderr))
    } else {
        AppError::docker_failed(format!("docker {}: {}", command, stderr))
    }
}

// ============================================
// CLI implementation
// ============================================

/// `DockerEngine` backed by the docker CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, err: std::io::Error) -> AppError {
        if err.kind() == std::io::ErrorKind::NotFound {
            AppError::with_source(
                ErrorCode::DockerCliMissing,
                format!("docker binary not found: {}", self.binary),
                err,
            )
        } else {
            AppError::with_source(ErrorCode::DockerCommandFailed, "Failed to spawn docker", err)
        }
    }

    /// Run a command to completion and return stdout
    async fn exec(&self, args: Vec<String>) -> AppResult<String> {
        self.exec_with_timeout(args, self.timeout).await
    }

    async fn exec_with_timeout(&self, args: Vec<String>, timeout: Duration) -> AppResult<String> {
        debug!(args = ?args, "docker");
        let output = tokio::time::timeout(timeout, self.command(&args).output())
            .await
            .map_err(|_| {
                AppError::docker_timeout(format!(
                    "docker {} timed out after {}s",
                    args.first().map(String::as_str).unwrap_or(""),
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| self.spawn_error(e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_failure(&args, &String::from_utf8_lossy(&output.stderr)))
        }
    }

    /// Like `exec`, but "No such ..." becomes `Ok(None)`
    async fn exec_optional(&self, args: Vec<String>) -> AppResult<Option<String>> {
        match self.exec(args).await {
            Ok(out) => Ok(Some(out)),
            Err(e) if e.code == ErrorCode::DockerNotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn to_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

#[async_trait]
impl DockerEngine for DockerCli {
    async fn ping(&self) -> AppResult<String> {
        let out = self.exec(to_args(&["version", "--format", "{{json .}}"])).await?;
        let version: VersionOutput = serde_json::from_str(out.trim())?;
        version
            .server
            .map(|s| s.version)
            .ok_or_else(|| AppError::docker_unavailable("docker version reported no server"))
    }

    async fn list_images(&self) -> AppResult<Vec<ImageSummary>> {
        let out = self
            .exec(to_args(&["image", "ls", "--no-trunc", "--format", "{{json .}}"]))
            .await?;
        let mut images = Vec::new();
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            match parse_image_row(line) {
                Ok(Some(image)) => images.push(image),
                Ok(None) => {}
                Err(e) => warn!("Skipping unparseable image row: {}", e),
            }
        }
        Ok(images)
    }

    async fn inspect_image(&self, reference: &str) -> AppResult<Option<ImageInfo>> {
        let out = self
            .exec_optional(to_args(&["image", "inspect", "--format", "{{json .}}", reference]))
            .await?;
        out.map(|o| parse_image_inspect(&o)).transpose()
    }

    async fn inspect_container(&self, name: &str) -> AppResult<Option<ContainerInfo>> {
        let out = self
            .exec_optional(to_args(&["container", "inspect", "--format", "{{json .}}", name]))
            .await?;
        out.map(|o| parse_container_inspect(&o)).transpose()
    }

    async fn run_container(&self, spec: &ContainerSpec) -> AppResult<String> {
        let out = self.exec(spec.to_run_args()).await.map_err(|e| {
            if e.code == ErrorCode::DockerCommandFailed {
                AppError::start_failed(e.message)
            } else {
                e
            }
        })?;
        let id = out.trim().lines().last().unwrap_or("").trim().to_string();
        if id.is_empty() {
            return Err(AppError::invalid_output("docker run printed no container ID"));
        }
        Ok(id)
    }

    async fn stop_container(&self, name: &str, timeout_secs: u64) -> AppResult<()> {
        // docker waits up to `timeout_secs` before killing, on top of the usual call time
        let budget = self.timeout + Duration::from_secs(timeout_secs);
        self.exec_with_timeout(to_args(&["stop", "-t", &timeout_secs.to_string(), name]), budget)
            .await
            .map(|_| ())
    }

    async fn start_container(&self, name: &str) -> AppResult<()> {
        self.exec(to_args(&["start", name])).await.map(|_| ())
    }

    async fn remove_container(&self, name: &str) -> AppResult<()> {
        self.exec(to_args(&["rm", "-f", name])).await.map(|_| ())
    }

    async fn rename_container(&self, name: &str, new_name: &str) -> AppResult<()> {
        self.exec(to_args(&["rename", name, new_name])).await.map(|_| ())
    }

    async fn stream_events(&self, since: Option<i64>, tx: mpsc::Sender<DockerEvent>) -> AppResult<()> {
        let mut args = to_args(&["events", "--format", "{{json .}}", "--filter", "type=image"]);
        if let Some(since) = since {
            args.push("--since".to_string());
            args.push(since.to_string());
        }

        let mut child = self.command(&args).spawn().map_err(|e| self.spawn_error(e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::invalid_output("docker events has no stdout"))?;
        info!("📡 Streaming docker image events");

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DockerEvent>(&line) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        debug!("Event receiver dropped, stopping docker events");
                        let _ = child.kill().await;
                        return Ok(());
                    }
                }
                Err(e) => debug!("Skipping malformed event line: {}", e),
            }
        }

        // stdout closed: the stream ended, report why
        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify_failure(&args, &String::from_utf8_lossy(&output.stderr)))
        }
    }
}
