//! Backup scheduling decisions.
//!
//! Which kind of snapshot is due is a pure function of the clock, the
//! schedule state and the configured cadence, so it is tested without
//! timers.

use crate::config::BackupConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "full" => Some(BackupKind::Full),
            "incremental" => Some(BackupKind::Incremental),
            _ => None,
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intervals driving the schedule
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    pub incremental: Duration,
    pub full: Duration,
    /// Minimum wait after a failed snapshot before trying again
    pub retry_after: Duration,
}

impl From<&BackupConfig> for Cadence {
    fn from(config: &BackupConfig) -> Self {
        Self {
            incremental: config.incremental_interval(),
            full: config.full_interval(),
            retry_after: config.retry_after(),
        }
    }
}

/// Scheduled times of the last committed snapshots.
///
/// A Full also counts as the latest incremental point, so an incremental
/// is never taken right after a Full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleState {
    pub last_full: Option<DateTime<Utc>>,
    pub last_incremental: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl ScheduleState {
    pub fn record_success(&mut self, kind: BackupKind, at: DateTime<Utc>) {
        if kind == BackupKind::Full {
            self.last_full = Some(at);
        }
        self.last_incremental = Some(self.last_incremental.map_or(at, |t| t.max(at)));
        self.last_failure = None;
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>) {
        self.last_failure = Some(at);
    }
}

/// A snapshot about to be taken
#[derive(Debug, Clone)]
pub struct BackupPlan {
    pub id: String,
    pub kind: BackupKind,
    pub scheduled_at: DateTime<Utc>,
    pub source: PathBuf,
}

impl BackupPlan {
    pub fn new(kind: BackupKind, scheduled_at: DateTime<Utc>, source: PathBuf) -> Self {
        Self {
            id: snapshot_id(scheduled_at, kind),
            kind,
            scheduled_at,
            source,
        }
    }
}

/// Identifier of a snapshot; sorts chronologically
pub fn snapshot_id(at: DateTime<Utc>, kind: BackupKind) -> String {
    format!("{}-{}", at.format("%Y%m%dT%H%M%SZ"), kind)
}

/// The kind of snapshot due at `now`, if any. Full wins when both are due.
pub fn due_kind(now: DateTime<Utc>, state: &ScheduleState, cadence: &Cadence) -> Option<BackupKind> {
    if let Some(failed) = state.last_failure {
        if now - failed < cadence.retry_after {
            return None;
        }
    }

    let Some(last_full) = state.last_full else {
        return Some(BackupKind::Full);
    };

    if now - last_full >= cadence.full {
        return Some(BackupKind::Full);
    }

    let last_any = state.last_incremental.map_or(last_full, |t| t.max(last_full));
    if now - last_any >= cadence.incremental {
        Some(BackupKind::Incremental)
    } else {
        None
    }
}
