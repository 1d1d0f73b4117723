use server_manager::backup::catalog;
use server_manager::backup::plan::BackupKind;
use server_manager::backup::snapshot::{DirectorySnapshotStore, SnapshotStore};
use server_manager::config::Config;
use server_manager::daemon::runtime;
use server_manager::db::{create_pool, migrate::migrate};
use server_manager::supervisor::SupervisorExit;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn write_world(server: &Path) {
    fs::create_dir_all(server.join("world/region")).unwrap();
    fs::write(server.join("world/level.dat"), b"level").unwrap();
    fs::write(server.join("world/region/r.0.0.mca"), b"region").unwrap();
}

fn config(dir: &TempDir, executable: &str, args: &[&str]) -> Config {
    let server = dir.path().join("server");
    write_world(&server);

    let args = args
        .iter()
        .map(|a| format!("\"{}\"", a))
        .collect::<Vec<_>>()
        .join(", ");
    let body = format!(
        r#"
[server]
name = "Integration"
folder = "{server}"
executable = "{executable}"
args = [{args}]
stop_timeout_secs = 5

[restart]
max_restarts = 1
window_secs = 60
backoff_secs = 0

[rcon]
host = "127.0.0.1"
port = 1
password = "secret"
timeout_secs = 1

[backups]
backup_folder = "{backups}"
world_folder = "world"
incremental_freq_hours = 1
full_backup_every = 24
keep_full_backup = 2
tick_interval_secs = 1
"#,
        server = server.display(),
        backups = dir.path().join("backups").display(),
    );

    let path = dir.path().join("server-manager.toml");
    fs::write(&path, body).unwrap();
    Config::load(&path).unwrap()
}

#[tokio::test]
async fn test_first_tick_takes_full_backup_then_stops() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, "sleep", &["30"]);
    let backups = config.backups.clone().unwrap();

    let shutdown = tokio::time::sleep(Duration::from_secs(2));
    let exit = runtime::run(Arc::new(config), shutdown).await.unwrap();
    assert_eq!(exit, SupervisorExit::Stopped);

    let db = create_pool(&backups.catalog_path()).unwrap();
    migrate(&db).unwrap();
    let records = catalog::find_all(&db.get().unwrap()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, BackupKind::Full);
    assert_eq!(records[0].files_total, 2);

    let store = DirectorySnapshotStore::new(&backups.backup_folder, vec![]);
    let target = dir.path().join("restored");
    assert_eq!(store.restore(&records[0].id, &target).unwrap(), 2);
    assert_eq!(fs::read(target.join("region/r.0.0.mca")).unwrap(), b"region");
}

#[tokio::test]
async fn test_crash_loop_halts_manager() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, "sh", &["-c", "exit 7"]);
    config.backups = None;

    let exit = runtime::run(Arc::new(config), std::future::pending())
        .await
        .unwrap();
    assert_eq!(exit, SupervisorExit::Halted);
}

#[tokio::test]
async fn test_clean_exit_ends_run() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, "true", &[]);
    config.backups = None;

    let exit = runtime::run(Arc::new(config), std::future::pending())
        .await
        .unwrap();
    assert_eq!(exit, SupervisorExit::ServerExited);
}

#[tokio::test]
async fn test_restart_resumes_schedule_from_catalog() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, "sleep", &["30"]);
    let backups = config.backups.clone().unwrap();

    let first = runtime::run(Arc::new(config.clone()), tokio::time::sleep(Duration::from_secs(2)));
    assert_eq!(first.await.unwrap(), SupervisorExit::Stopped);

    let second = runtime::run(Arc::new(config), tokio::time::sleep(Duration::from_secs(2)));
    assert_eq!(second.await.unwrap(), SupervisorExit::Stopped);

    let db = create_pool(&backups.catalog_path()).unwrap();
    let records = catalog::find_all(&db.get().unwrap()).unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn test_crash_and_restart_during_backups() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("crashed.marker");
    let script = format!(
        "if [ -f {m} ]; then exec sleep 30; fi; touch {m}; exit 1",
        m = marker.display()
    );
    let config = config(&dir, "sh", &["-c", &script]);
    let backups = config.backups.clone().unwrap();

    let shutdown = tokio::time::sleep(Duration::from_secs(3));
    let exit = runtime::run(Arc::new(config), shutdown).await.unwrap();
    assert_eq!(exit, SupervisorExit::Stopped);
    assert!(marker.exists());

    let db = create_pool(&backups.catalog_path()).unwrap();
    let records = catalog::find_all(&db.get().unwrap()).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, BackupKind::Full);
    assert!(records[0].parent_id.is_none());

    let store = DirectorySnapshotStore::new(&backups.backup_folder, vec![]);
    let listed = store.list().unwrap();
    assert_eq!(listed, vec![records[0].id.clone()]);
}
