//! Backup engine.
//!
//! A periodic timer asks the schedule which snapshot kind is due and runs
//! one snapshot at a time:
//!
//! 1. suspend autosave, flush the world and announce the backup over the
//!    control channel (each step best-effort)
//! 2. copy the world into a new artifact on the blocking pool
//! 3. resume saving, whatever the copy outcome
//! 4. commit the record to the catalog
//! 5. after a Full, evict the oldest chains beyond the retention count
//! 6. mirror the backup root to the remote
//!
//! A failure at any step raises an incident and leaves the catalog as it was.

pub mod catalog;
pub mod manifest;
pub mod plan;
pub mod snapshot;

use crate::config::{BackupConfig, RconConfig};
use crate::db::{with_conn, DbPool};
use crate::incident::{IncidentSender, Severity};
use crate::rcon::commands::GameCommand;
use crate::rcon::RconClient;
use crate::remote::RemoteSync;
use crate::utils::errors::{ManagerError, Result};
use crate::utils::format::format_bytes;
use catalog::BackupRecord;
use chrono::{DateTime, Utc};
use plan::{BackupKind, BackupPlan, Cadence, ScheduleState};
use snapshot::{SnapshotRequest, SnapshotStore};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where and how to reach the game console
#[derive(Debug, Clone)]
pub struct ConsoleEndpoint {
    pub address: String,
    pub password: String,
    pub timeout: Duration,
}

impl From<&RconConfig> for ConsoleEndpoint {
    fn from(config: &RconConfig) -> Self {
        Self {
            address: config.address(),
            password: config.password.clone(),
            timeout: config.timeout(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub world: PathBuf,
    pub backup_root: PathBuf,
    pub cadence: Cadence,
    pub keep_full: usize,
    pub flush_on_save: bool,
    /// Wait after an unflushed `save-all` before copying
    pub save_settle: Duration,
    pub silent: bool,
    pub tick_interval: Duration,
}

impl From<&BackupConfig> for EngineSettings {
    fn from(config: &BackupConfig) -> Self {
        Self {
            world: config.world_folder.clone(),
            backup_root: config.backup_folder.clone(),
            cadence: Cadence::from(config),
            keep_full: config.keep_full_backup as usize,
            flush_on_save: config.flush_on_save,
            save_settle: Duration::from_secs(config.save_settle_secs),
            silent: config.silent,
            tick_interval: Duration::from_secs(config.tick_interval_secs),
        }
    }
}

/// Result of one timer tick
#[derive(Debug)]
pub enum TickOutcome {
    Idle,
    Committed(BackupRecord),
    Failed,
}

pub struct BackupEngine {
    settings: EngineSettings,
    db: DbPool,
    store: Arc<dyn SnapshotStore>,
    console: Option<ConsoleEndpoint>,
    remote: Option<RemoteSync>,
    incidents: IncidentSender,
    schedule: ScheduleState,
    consecutive_failures: u32,
    shutdown: CancellationToken,
}

impl BackupEngine {
    /// Build an engine whose schedule continues from the catalog
    pub async fn new(
        settings: EngineSettings,
        db: DbPool,
        store: Arc<dyn SnapshotStore>,
        console: Option<ConsoleEndpoint>,
        remote: Option<RemoteSync>,
        incidents: IncidentSender,
    ) -> Result<Self> {
        let schedule = with_conn(&db, |conn| catalog::schedule_state(conn)).await?;
        info!(
            last_full = ?schedule.last_full,
            last_incremental = ?schedule.last_incremental,
            "Backup schedule loaded"
        );

        Ok(Self {
            settings,
            db,
            store,
            console,
            remote,
            incidents,
            schedule,
            consecutive_failures: 0,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn schedule(&self) -> ScheduleState {
        self.schedule
    }

    /// Delete artifacts left by a crash between writing an artifact and
    /// committing its record. Only ids newer than the newest committed record
    /// can come from that window; older unknown artifacts are kept and
    /// reported, and nothing is deleted while the catalog is empty.
    pub async fn reconcile(&self) -> Result<usize> {
        let known: HashSet<String> = with_conn(&self.db, |conn| {
            Ok(catalog::find_all(conn)?.into_iter().map(|r| r.id).collect())
        })
        .await?;

        let store = Arc::clone(&self.store);
        let removed = tokio::task::spawn_blocking(move || -> Result<usize> {
            let newest = known.iter().max().cloned();
            let mut removed = 0;
            for id in store.list()? {
                if known.contains(&id) {
                    continue;
                }
                match &newest {
                    Some(newest) if id > *newest => {
                        warn!(snapshot = %id, "Removing snapshot that was never committed");
                        store.remove(&id)?;
                        removed += 1;
                    }
                    _ => warn!(snapshot = %id, "Snapshot is not in the catalog; keeping it"),
                }
            }
            Ok(removed)
        })
        .await
        .map_err(|e| ManagerError::BackupCopy(format!("reconcile task failed: {}", e)))??;

        Ok(removed)
    }

    /// Tick until `shutdown` fires. A snapshot in progress is finished first.
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.shutdown = shutdown.clone();
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            every = ?self.settings.tick_interval,
            keep_full = self.settings.keep_full,
            "Backup scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }

        info!("Backup scheduler stopped");
    }

    /// Take the snapshot due at `now`, if any
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let Some(kind) = plan::due_kind(now, &self.schedule, &self.settings.cadence) else {
            return TickOutcome::Idle;
        };

        let plan = BackupPlan::new(kind, now, self.settings.world.clone());
        info!(snapshot = %plan.id, kind = %kind, "Starting backup");

        match self.perform(&plan).await {
            Ok(record) => {
                self.schedule.record_success(kind, now);
                self.consecutive_failures = 0;
                info!(
                    snapshot = %record.id,
                    files = record.files_total,
                    copied = record.files_copied,
                    size = %format_bytes(record.bytes_total),
                    "Backup committed"
                );

                if kind == BackupKind::Full {
                    self.apply_retention().await;
                }
                self.sync_remote().await;

                TickOutcome::Committed(record)
            }
            Err(e) => {
                self.schedule.record_failure(now);
                self.consecutive_failures += 1;
                self.incidents.report(
                    Severity::Warning,
                    format!(
                        "{} backup {} failed ({} consecutive failure(s)): {}. Existing backups are untouched.",
                        kind, plan.id, self.consecutive_failures, e
                    ),
                );
                TickOutcome::Failed
            }
        }
    }

    async fn perform(&self, plan: &BackupPlan) -> Result<BackupRecord> {
        let (parent_id, base) = self.chain_for(plan.kind).await?;

        let console = self.open_console().await;
        if let Some(client) = &console {
            if let Err(e) = client.run(&GameCommand::SaveOff).await {
                warn!("Autosave suspension not confirmed: {}", e);
            }
            let flush = self.settings.flush_on_save;
            match client.run(&GameCommand::SaveAll { flush }).await {
                Ok(_) => debug!(flush, "World save requested"),
                Err(e) => warn!("World save not confirmed, copying anyway: {}", e),
            }
            if !flush {
                // Without flush the server writes chunks in the background
                tokio::time::sleep(self.settings.save_settle).await;
            }
            if !self.settings.silent {
                notify(client, "Backup started.").await;
            }
        }

        let request = SnapshotRequest {
            id: plan.id.clone(),
            kind: plan.kind,
            source: plan.source.clone(),
            base,
        };
        let store = Arc::clone(&self.store);
        let copied = tokio::task::spawn_blocking(move || store.create(&request))
            .await
            .map_err(|e| ManagerError::BackupCopy(format!("snapshot task failed: {}", e)))
            .and_then(|result| result);

        if let Some(client) = &console {
            if let Err(e) = client.run(&GameCommand::SaveOn).await {
                self.incidents.report(
                    Severity::Warning,
                    format!("Failed to re-enable world saving after backup: {}", e),
                );
            }
        }

        let outcome = match copied {
            Ok(outcome) => outcome,
            Err(e) => {
                close(console).await;
                return Err(e);
            }
        };

        let record = BackupRecord {
            id: plan.id.clone(),
            kind: plan.kind,
            parent_id,
            local_path: outcome.path.clone(),
            scheduled_at: plan.scheduled_at,
            completed_at: Utc::now(),
            files_total: outcome.files_total,
            bytes_total: outcome.bytes_total,
            files_copied: outcome.files_copied,
            bytes_copied: outcome.bytes_copied,
        };

        let committed = record.clone();
        if let Err(e) = with_conn(&self.db, move |conn| catalog::insert(conn, &committed)).await {
            self.discard(&plan.id).await;
            close(console).await;
            return Err(e);
        }

        if let Some(client) = &console {
            if !self.settings.silent {
                let notice = format!("Backup done! ({})", format_bytes(record.bytes_total));
                notify(client, &notice).await;
            }
        }
        close(console).await;

        Ok(record)
    }

    /// Parent Full and diff base for the next snapshot of `kind`
    async fn chain_for(&self, kind: BackupKind) -> Result<(Option<String>, Option<String>)> {
        if kind == BackupKind::Full {
            return Ok((None, None));
        }

        with_conn(&self.db, |conn| {
            let full = catalog::latest_of_kind(conn, BackupKind::Full)?.ok_or_else(|| {
                ManagerError::BackupCopy("no full backup to base an incremental on".into())
            })?;
            let base = catalog::latest_in_chain(conn, &full.id)?.map(|r| r.id);
            Ok((Some(full.id), base))
        })
        .await
    }

    async fn open_console(&self) -> Option<RconClient> {
        let endpoint = self.console.as_ref()?;
        match RconClient::connect(&endpoint.address, &endpoint.password, endpoint.timeout).await {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("Control channel unavailable, backing up without save coordination: {}", e);
                None
            }
        }
    }

    async fn discard(&self, id: &str) {
        let store = Arc::clone(&self.store);
        let owned = id.to_string();
        match tokio::task::spawn_blocking(move || store.remove(&owned)).await {
            Ok(Ok(())) => debug!(snapshot = id, "Uncommitted snapshot removed"),
            Ok(Err(e)) => error!(snapshot = id, "Failed to remove uncommitted snapshot: {}", e),
            Err(e) => error!(snapshot = id, "Failed to remove uncommitted snapshot: {}", e),
        }
    }

    async fn apply_retention(&self) {
        let keep = self.settings.keep_full;
        let evicted = match with_conn(&self.db, move |conn| catalog::evict_beyond(conn, keep)).await {
            Ok(evicted) => evicted,
            Err(e) => {
                self.incidents.report(
                    Severity::Warning,
                    format!("Retention pruning failed, no backups were removed: {}", e),
                );
                return;
            }
        };

        for record in evicted {
            let store = Arc::clone(&self.store);
            let id = record.id.clone();
            let removed = tokio::task::spawn_blocking(move || store.remove(&id))
                .await
                .map_err(|e| ManagerError::BackupCopy(e.to_string()))
                .and_then(|result| result);

            match removed {
                Ok(()) => info!(snapshot = %record.id, kind = %record.kind, "Evicted backup"),
                Err(e) => self.incidents.report(
                    Severity::Warning,
                    format!(
                        "Backup {} was evicted from the catalog but its files could not be deleted: {}",
                        record.id, e
                    ),
                ),
            }
        }
    }

    async fn sync_remote(&self) {
        let Some(remote) = &self.remote else {
            return;
        };

        if let Err(e) = remote.sync(&self.settings.backup_root, &self.shutdown).await {
            self.incidents.report(
                Severity::Warning,
                format!("Remote sync to {} failed: {}", remote.remote(), e),
            );
        }
    }
}

async fn notify(client: &RconClient, message: &str) {
    if let Err(e) = client.run(&GameCommand::Broadcast(message.to_string())).await {
        warn!("Failed to broadcast backup notice: {}", e);
    }
}

async fn close(console: Option<RconClient>) {
    if let Some(client) = console {
        client.close().await;
    }
}
