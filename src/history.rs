//! Deployment History
//!
//! Bounded in-memory log of finished deployments plus running counters.
//! Served by the status API and exported to disk on shutdown.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::models::types::{DeploymentRecord, DeploymentStatus};

/// Aggregated deployment counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub total: u64,
    pub succeeded: u64,
    pub skipped: u64,
    pub rolled_back: u64,
    pub failed: u64,
    pub dry_run: u64,
    /// Average over deployments that touched a container
    pub avg_duration_ms: f64,
}

/// File written by `export_json`
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryExport {
    pub exported_at: i64,
    pub summary: HistorySummary,
    pub deployments: Vec<DeploymentRecord>,
}

pub struct DeploymentHistory {
    /// Oldest at the front
    records: RwLock<VecDeque<DeploymentRecord>>,
    capacity: usize,
    total: AtomicU64,
    succeeded: AtomicU64,
    skipped: AtomicU64,
    rolled_back: AtomicU64,
    failed: AtomicU64,
    dry_run: AtomicU64,
    timed_count: AtomicU64,
    timed_duration_ms: AtomicU64,
}

impl DeploymentHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dry_run: AtomicU64::new(0),
            timed_count: AtomicU64::new(0),
            timed_duration_ms: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a finished record, evicting the oldest when full
    pub fn record(&self, record: DeploymentRecord) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let counter = match record.status {
            DeploymentStatus::Succeeded => &self.succeeded,
            DeploymentStatus::Skipped => &self.skipped,
            DeploymentStatus::RolledBack => &self.rolled_back,
            DeploymentStatus::Failed => &self.failed,
            DeploymentStatus::DryRun => &self.dry_run,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if record.status.is_notable() {
            self.timed_count.fetch_add(1, Ordering::Relaxed);
            self.timed_duration_ms.fetch_add(record.duration_ms, Ordering::Relaxed);
        }

        if let Ok(mut records) = self.records.write() {
            if records.len() >= self.capacity {
                records.pop_front();
            }
            records.push_back(record);
        }
    }

    /// Newest first
    pub fn recent(&self, limit: usize) -> Vec<DeploymentRecord> {
        self.records
            .read()
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Option<DeploymentRecord> {
        self.records
            .read()
            .ok()?
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Most recent record for a rule, if still buffered
    pub fn last_for_rule(&self, rule: &str) -> Option<DeploymentRecord> {
        self.records
            .read()
            .ok()?
            .iter()
            .rev()
            .find(|r| r.rule == rule)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> HistorySummary {
        let timed = self.timed_count.load(Ordering::Relaxed);
        let duration = self.timed_duration_ms.load(Ordering::Relaxed);
        HistorySummary {
            total: self.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dry_run: self.dry_run.load(Ordering::Relaxed),
            avg_duration_ms: if timed > 0 {
                duration as f64 / timed as f64
            } else {
                0.0
            },
        }
    }

    /// Write the buffered history to `<dir>/deployments-<unix>.json`
    pub fn export_json(&self, dir: &Path) -> Result<PathBuf, std::io::Error> {
        fs::create_dir_all(dir)?;
        let now = chrono::Utc::now().timestamp();
        let export = HistoryExport {
            exported_at: now,
            summary: self.summary(),
            deployments: self.recent(self.capacity),
        };
        let path = dir.join(format!("deployments-{}.json", now));
        fs::write(&path, serde_json::to_string_pretty(&export)?)?;
        Ok(path)
    }
}

impl Default for DeploymentHistory {
    fn default() -> Self {
        Self::new(crate::utils::constants::DEFAULT_HISTORY_CAPACITY)
    }
}
