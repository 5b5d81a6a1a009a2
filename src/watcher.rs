//! Docker event watcher
//! Turns image events and periodic reconciles into deployments

use dashmap::DashMap;
use futures_util::future::join_all;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::core::deployer::{DeployRequest, Deployer};
use crate::core::matcher::{select_candidate, RuleMatcher};
use crate::models::config::{DaemonConfig, DeployRule};
use crate::models::errors::{AppError, AppResult, ErrorCode};
use crate::models::types::{DaemonStats, DeploymentRecord, DockerEvent, Trigger};
use crate::providers::docker::DockerEngine;
use crate::utils::constants::{
    EVENTS_CHANNEL_CAPACITY, EVENTS_MAX_RECONNECT_ATTEMPTS, EVENTS_RECONNECT_BASE_MS, EVENTS_RECONNECT_MAX_MS,
    EVENTS_STABLE_SECS,
};
use crate::utils::retry::{next_backoff_ms, RetryPolicy};

/// Thread-safe watcher counters
#[derive(Default)]
struct WatcherStats {
    events_received: AtomicU64,
    events_ignored: AtomicU64,
    triggers: AtomicU64,
    reconciles: AtomicU64,
}

pub struct DeployWatcher {
    deployer: Arc<Deployer>,
    matcher: RuleMatcher,
    retry: RetryPolicy,
    reconcile_on_startup: bool,
    reconcile_interval: Option<Duration>,
    stats_interval: Option<Duration>,
    stats: Arc<WatcherStats>,
    /// `rule@image_id` keys of deployments currently running
    in_flight: Arc<DashMap<String, ()>>,
    /// Signalled whenever a deployment finishes
    deploy_done: Arc<Notify>,
    /// Unix time of the newest event seen, 0 before the first one
    last_event_time: Arc<AtomicI64>,
    /// `timeNano` of the newest event seen, used to drop `--since` replays
    last_event_nano: AtomicI64,
    started: Instant,
}

impl DeployWatcher {
    pub fn new(deployer: Arc<Deployer>, config: &DaemonConfig) -> AppResult<Self> {
        let non_zero = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        Ok(Self {
            deployer,
            matcher: RuleMatcher::new(config.enabled_rules())?,
            retry: RetryPolicy::new(config.max_retries, config.retry_base_ms, config.retry_max_ms),
            reconcile_on_startup: config.reconcile_on_startup,
            reconcile_interval: non_zero(config.reconcile_interval_secs),
            stats_interval: non_zero(config.stats_interval_secs),
            stats: Arc::new(WatcherStats::default()),
            in_flight: Arc::new(DashMap::new()),
            deploy_done: Arc::new(Notify::new()),
            last_event_time: Arc::new(AtomicI64::new(0)),
            last_event_nano: AtomicI64::new(0),
            started: Instant::now(),
        })
    }

    pub fn deployer(&self) -> &Arc<Deployer> {
        &self.deployer
    }

    pub fn rules(&self) -> impl Iterator<Item = &DeployRule> {
        self.matcher.rules()
    }

    /// Number of deployments currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Wait for running deployments to finish. Returns `false` if some were
    /// still running when `timeout` passed.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                let done = self.deploy_done.notified();
                tokio::pin!(done);
                done.as_mut().enable();
                if self.in_flight.is_empty() {
                    return;
                }
                done.await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    /// Watch until `shutdown` flips (or its sender is dropped).
    ///
    /// Returns an error when docker cannot be reached at startup or the
    /// event stream cannot be re-established. Deployments already started
    /// keep running; see [`DeployWatcher::drain`].
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        let engine = self.deployer.engine().clone();
        let docker = engine.as_ref();
        let (version, _) = self.retry.run("ping docker", move || docker.ping()).await;
        info!("🐳 Connected to Docker {}", version?);
        info!("📋 Watching {} rule(s)", self.matcher.rules().count());

        if self.reconcile_on_startup {
            self.spawn_reconcile().await;
        }

        let (tx, mut rx) = mpsc::channel(EVENTS_CHANNEL_CAPACITY);
        let mut pump = tokio::spawn(pump_events(engine, tx, self.last_event_time.clone()));

        let mut reconcile_tick = self.reconcile_interval.map(ticker);
        let mut stats_tick = self.stats_interval.map(ticker);
        // Events waiting on image resolution; dropped unstarted on shutdown
        let mut resolving = FuturesUnordered::new();

        info!("🔍 Listening for image events...");
        let outcome = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("🛑 Watcher stopping");
                    break Ok(());
                }
                event = rx.recv() => match event {
                    Some(event) if self.is_replay(&event) => {
                        debug!(action = %event.action, time = event.time, "Skipping replayed event");
                    }
                    Some(event) => {
                        resolving.push(self.handle_event(event));
                    }
                    None => {
                        break match (&mut pump).await {
                            Ok(Err(e)) => Err(e),
                            Ok(Ok(())) => Ok(()),
                            Err(e) => Err(AppError::internal(format!("event task panicked: {}", e))),
                        };
                    }
                },
                _ = tick(&mut reconcile_tick) => {
                    self.spawn_reconcile().await;
                }
                _ = tick(&mut stats_tick) => {
                    self.log_stats();
                }
                Some(_) = resolving.next(), if !resolving.is_empty() => {}
            }
        };

        // Dropping the task kills the `docker events` child
        pump.abort();
        outcome
    }

    /// `docker events --since` repeats everything from that second on.
    /// Records the event as seen.
    fn is_replay(&self, event: &DockerEvent) -> bool {
        event.time_nano > 0 && self.last_event_nano.fetch_max(event.time_nano, Ordering::Relaxed) >= event.time_nano
    }

    /// Handle one docker event. Returns the handles of any deployments started.
    pub async fn handle_event(&self, event: DockerEvent) -> Vec<JoinHandle<DeploymentRecord>> {
        self.stats.events_received.fetch_add(1, Ordering::Relaxed);
        self.last_event_time.fetch_max(event.time, Ordering::Relaxed);
        self.last_event_nano.fetch_max(event.time_nano, Ordering::Relaxed);

        if !event.is_deploy_trigger() {
            self.stats.events_ignored.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        }
        let Some(image) = event.image_ref() else {
            debug!(action = %event.action, "Event without an image reference");
            self.stats.events_ignored.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        };

        let rules: Vec<DeployRule> = self.matcher.matching(&image).into_iter().cloned().collect();
        if rules.is_empty() {
            debug!(image = %image, "No rule matches");
            self.stats.events_ignored.fetch_add(1, Ordering::Relaxed);
            return Vec::new();
        }

        info!(image = %image, action = %event.action, rules = rules.len(), "📦 New image");
        let request = match self.deployer.request_for(image.clone(), Trigger::Event).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                warn!(image = %image, "Image vanished before it could be deployed");
                return Vec::new();
            }
            Err(e) => {
                error!(image = %image, code = e.code_str(), "Could not inspect image: {}", e);
                return Vec::new();
            }
        };

        rules
            .into_iter()
            .filter_map(|rule| self.trigger(rule, request.clone()))
            .collect()
    }

    /// Reconcile every rule against local images and wait for the results
    pub async fn reconcile_once(&self) -> AppResult<Vec<DeploymentRecord>> {
        let handles = self.start_reconcile().await?;
        let records = join_all(handles)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(record) => Some(record),
                Err(e) => {
                    error!("Deployment task failed: {}", e);
                    None
                }
            })
            .collect();
        Ok(records)
    }

    async fn spawn_reconcile(&self) {
        if let Err(e) = self.start_reconcile().await {
            error!(code = e.code_str(), "Reconcile failed: {}", e);
        }
    }

    async fn start_reconcile(&self) -> AppResult<Vec<JoinHandle<DeploymentRecord>>> {
        self.stats.reconciles.fetch_add(1, Ordering::Relaxed);
        let engine = self.deployer.engine().as_ref();
        let (images, _) = self.retry.run("list images", move || engine.list_images()).await;
        let images = images?;
        debug!(images = images.len(), "Reconciling");

        let mut handles = Vec::new();
        for rule in self.matcher.rules() {
            let Some(candidate) = select_candidate(rule, &images) else {
                debug!(rule = %rule.name, "No local image for rule");
                continue;
            };
            let request = DeployRequest {
                image: candidate.image_ref(),
                image_id: candidate.id.clone(),
                trigger: Trigger::Reconcile,
            };
            if let Some(handle) = self.trigger(rule.clone(), request) {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    /// Spawn a deployment unless the same rule/image pair is already running
    fn trigger(&self, rule: DeployRule, request: DeployRequest) -> Option<JoinHandle<DeploymentRecord>> {
        let key = format!("{}@{}", rule.name, request.image_id);
        if self.in_flight.insert(key.clone(), ()).is_some() {
            debug!(rule = %rule.name, image = %request.image, "Deployment already in flight");
            return None;
        }
        self.stats.triggers.fetch_add(1, Ordering::Relaxed);

        let deployer = self.deployer.clone();
        let in_flight = self.in_flight.clone();
        let deploy_done = self.deploy_done.clone();
        Some(tokio::spawn(async move {
            let record = deployer.deploy(&rule, request).await;
            in_flight.remove(&key);
            deploy_done.notify_waiters();
            record
        }))
    }

    /// Current counters merged with deployment history
    pub fn stats(&self) -> DaemonStats {
        let summary = self.deployer.history().summary();
        DaemonStats {
            events_received: self.stats.events_received.load(Ordering::Relaxed),
            events_ignored: self.stats.events_ignored.load(Ordering::Relaxed),
            triggers: self.stats.triggers.load(Ordering::Relaxed),
            reconciles: self.stats.reconciles.load(Ordering::Relaxed),
            deployments_total: summary.total,
            deployments_succeeded: summary.succeeded,
            deployments_failed: summary.failed,
            deployments_rolled_back: summary.rolled_back,
            deployments_skipped: summary.skipped,
            avg_deploy_ms: summary.avg_duration_ms,
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }

    pub fn log_stats(&self) {
        let s = self.stats();
        info!(
            "📊 Stats | Events: {} | Ignored: {} | Triggers: {} | Deployed: {} | Rolled back: {} | Failed: {} | Avg: {:.0}ms",
            s.events_received,
            s.events_ignored,
            s.triggers,
            s.deployments_succeeded,
            s.deployments_rolled_back,
            s.deployments_failed,
            s.avg_deploy_ms
        );
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Tick an optional interval; never completes when disabled
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Keep `docker events` running, reconnecting with exponential backoff.
/// Returns `Ok` once the receiver is gone.
async fn pump_events(
    engine: Arc<dyn DockerEngine>,
    tx: mpsc::Sender<DockerEvent>,
    last_event_time: Arc<AtomicI64>,
) -> AppResult<()> {
    let mut reconnect_attempts = 0;
    let mut reconnect_delay = EVENTS_RECONNECT_BASE_MS;

    loop {
        let since = match last_event_time.load(Ordering::Relaxed) {
            0 => None,
            t => Some(t),
        };
        let connected_at = Instant::now();
        let result = engine.stream_events(since, tx.clone()).await;
        if tx.is_closed() {
            return Ok(());
        }

        match result {
            Ok(()) => warn!("🔌 Docker event stream ended"),
            Err(e) if e.code == ErrorCode::DockerCliMissing => return Err(e),
            Err(e) => error!(code = e.code_str(), "❌ Docker event stream failed: {}", e),
        }

        if connected_at.elapsed() >= Duration::from_secs(EVENTS_STABLE_SECS) {
            reconnect_attempts = 0;
            reconnect_delay = EVENTS_RECONNECT_BASE_MS;
        }

        reconnect_attempts += 1;
        if reconnect_attempts >= EVENTS_MAX_RECONNECT_ATTEMPTS {
            error!("❌ Max reconnection attempts reached, giving up");
            return Err(AppError::docker_unavailable(format!(
                "event stream failed {} times in a row",
                reconnect_attempts
            )));
        }

        warn!(
            "🔄 Reconnecting in {}ms (attempt {}/{})",
            reconnect_delay, reconnect_attempts, EVENTS_MAX_RECONNECT_ATTEMPTS
        );
        tokio::time::sleep(Duration::from_millis(reconnect_delay)).await;
        reconnect_delay = next_backoff_ms(reconnect_delay, EVENTS_RECONNECT_MAX_MS);
    }
}
