//! In-memory progress table polled by clients while jobs run.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use serde::Serialize;

use crate::engine::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Queued,
    Downloading,
    Merging,
    Finished,
    Failed,
    NotFound,
}

impl ProgressStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Why a job ended without a history entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Latest known state of one job. Always replaced wholesale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub status: ProgressStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub speed: f64,
    pub eta: u64,
    pub percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl ProgressSnapshot {
    fn with_status(status: ProgressStatus, percent: f64) -> Self {
        Self {
            status,
            downloaded_bytes: 0,
            total_bytes: 0,
            speed: 0.0,
            eta: 0,
            percent,
            job_id: None,
            error: None,
        }
    }

    pub fn queued() -> Self {
        Self::with_status(ProgressStatus::Queued, 0.0)
    }

    pub fn downloading(downloaded_bytes: u64, total_bytes: u64, speed: f64, eta: u64) -> Self {
        let percent = if total_bytes > 0 {
            downloaded_bytes as f64 / total_bytes as f64 * 100.0
        } else {
            0.0
        };
        Self {
            downloaded_bytes,
            total_bytes,
            speed,
            eta,
            ..Self::with_status(ProgressStatus::Downloading, percent)
        }
    }

    /// Raw transfer is done and the engine is muxing; counters reset.
    pub fn merging() -> Self {
        Self::with_status(ProgressStatus::Merging, 99.0)
    }

    pub fn finished(size: u64) -> Self {
        Self {
            downloaded_bytes: size,
            total_bytes: size,
            ..Self::with_status(ProgressStatus::Finished, 100.0)
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            error: Some(JobFailure {
                kind,
                message: message.into(),
            }),
            ..Self::with_status(ProgressStatus::Failed, 0.0)
        }
    }

    pub fn with_job(mut self, job_id: &str) -> Self {
        self.job_id = Some(job_id.to_string());
        self
    }
}

/// Sentinel returned for ids the table has never seen (or already evicted).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingProgress {
    pub status: ProgressStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProgressReport {
    Known(ProgressSnapshot),
    Missing(MissingProgress),
}

impl ProgressReport {
    pub fn status(&self) -> ProgressStatus {
        match self {
            Self::Known(snapshot) => snapshot.status,
            Self::Missing(missing) => missing.status,
        }
    }
}

struct Entry {
    snapshot: ProgressSnapshot,
    updated: Instant,
}

pub struct ProgressTable {
    entries: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
}

impl ProgressTable {
    /// `ttl` bounds how long finished/failed entries stay pollable.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Upserts the snapshot for `key`; last write wins.
    pub fn record(&self, key: &str, snapshot: ProgressSnapshot) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        Self::evict(&mut entries, self.ttl, now);
        entries.insert(
            key.to_string(),
            Entry {
                snapshot,
                updated: now,
            },
        );
    }

    pub fn get(&self, key: &str) -> ProgressReport {
        match self.entries.read().get(key) {
            Some(entry) => ProgressReport::Known(entry.snapshot.clone()),
            None => ProgressReport::Missing(MissingProgress {
                status: ProgressStatus::NotFound,
            }),
        }
    }

    /// Drops terminal entries older than the ttl and returns how many went.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        Self::evict(&mut self.entries.write(), self.ttl, now)
    }

    fn evict(entries: &mut HashMap<String, Entry>, ttl: Duration, now: Instant) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| {
            !(entry.snapshot.status.is_terminal()
                && now.saturating_duration_since(entry.updated) > ttl)
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
