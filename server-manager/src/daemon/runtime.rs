//! Starts the components, waits for a shutdown signal or the end of
//! supervision, then stops them in order: backups first so an in-flight
//! snapshot completes, then the game server, then the incident reporter
//! once every incident has been handed over.

use crate::backup::snapshot::DirectorySnapshotStore;
use crate::backup::{BackupEngine, ConsoleEndpoint, EngineSettings};
use crate::config::{BackupConfig, Config};
use crate::daemon::shutdown::ShutdownCoordinator;
use crate::db::{create_pool, migrate::migrate};
use crate::incident::mail::{Notifier, SmtpNotifier};
use crate::incident::{self, IncidentReporter, IncidentSender};
use crate::remote::RemoteSync;
use crate::supervisor::{ProcessSupervisor, SupervisorExit, SupervisorSettings};
use anyhow::Context;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Open the catalog, clean up after an interrupted run and build the engine
pub async fn prepare_backups(
    config: &BackupConfig,
    console: ConsoleEndpoint,
    incidents: IncidentSender,
) -> anyhow::Result<BackupEngine> {
    let store = DirectorySnapshotStore::new(&config.backup_folder, config.exclude.clone());
    let swept = store
        .sweep_staging()
        .context("failed to clean up incomplete snapshots")?;
    if swept > 0 {
        warn!(count = swept, "Removed incomplete snapshots from an interrupted run");
    }

    let db = create_pool(&config.catalog_path()).context("failed to open backup catalog")?;
    migrate(&db)?;

    let remote = RemoteSync::from_config(config);
    if let Some(remote) = &remote {
        remote.verify().await?;
        info!(remote = %remote.remote(), "Remote sync enabled");
    }

    let engine = BackupEngine::new(
        EngineSettings::from(config),
        db,
        Arc::new(store),
        Some(console),
        remote,
        incidents,
    )
    .await?;

    let orphans = engine.reconcile().await?;
    if orphans > 0 {
        warn!(count = orphans, "Removed snapshots that were never committed");
    }

    Ok(engine)
}

/// Run the manager until `shutdown` resolves or supervision ends on its own
pub async fn run<S>(config: Arc<Config>, shutdown: S) -> anyhow::Result<SupervisorExit>
where
    S: Future<Output = ()>,
{
    let (incidents, incident_rx) = incident::channel();

    let reporter = match &config.mailing {
        Some(mailing) => {
            let notifier = SmtpNotifier::new(mailing)?;
            if mailing.startup_mail {
                notifier
                    .send(&incident::startup_message(&config.server.name))
                    .await
                    .context("failed to send startup mail; check the [mailing] settings")?;
                info!("Startup mail sent");
            }
            IncidentReporter::new(
                incident_rx,
                Some(notifier),
                config.server.name.clone(),
                Duration::from_secs(mailing.batch_window_secs),
            )
        }
        None => {
            info!("Mailing not configured; incidents are only logged");
            IncidentReporter::<SmtpNotifier>::new(
                incident_rx,
                None,
                config.server.name.clone(),
                Duration::ZERO,
            )
        }
    };
    let reporter_handle = tokio::spawn(reporter.run());

    let coordinator = ShutdownCoordinator::new();

    let engine_handle = match &config.backups {
        Some(backups) => {
            let engine =
                prepare_backups(backups, ConsoleEndpoint::from(&config.rcon), incidents.clone())
                    .await?;
            Some(tokio::spawn(engine.run(coordinator.backup_token())))
        }
        None => {
            info!("Backups not configured");
            None
        }
    };

    let supervisor = ProcessSupervisor::new(SupervisorSettings::from(config.as_ref()), incidents.clone());
    let mut supervisor_handle = tokio::spawn(supervisor.run(coordinator.supervisor_token()));

    info!(server = %config.server.name, "Server manager running");

    let finished = tokio::select! {
        _ = shutdown => None,
        result = &mut supervisor_handle => Some(result),
    };

    coordinator.stop_backups();
    if let Some(handle) = engine_handle {
        if let Err(e) = handle.await {
            error!("Backup task ended abnormally: {}", e);
        }
    }

    let exit = match finished {
        Some(result) => result,
        None => {
            coordinator.stop_supervisor();
            supervisor_handle.await
        }
    }
    .context("supervisor task ended abnormally")?;

    drop(incidents);
    if let Err(e) = reporter_handle.await {
        error!("Incident reporter ended abnormally: {}", e);
    }

    info!(exit = ?exit, "Server manager stopped");
    Ok(exit)
}
