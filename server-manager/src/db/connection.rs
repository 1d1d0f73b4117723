use crate::utils::errors::{ManagerError, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;

pub type DbPool = Pool<SqliteConnectionManager>;

fn configure(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = DELETE;
         PRAGMA synchronous = FULL;
         PRAGMA foreign_keys = ON;",
    )
}

pub fn create_pool(db_path: &Path) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(db_path).with_init(configure);
    let pool = Pool::builder().max_size(4).build(manager)?;
    Ok(pool)
}

/// Single-connection pool over a private in-memory database
pub fn create_memory_pool() -> Result<DbPool> {
    let manager = SqliteConnectionManager::memory().with_init(configure);
    let pool = Pool::builder().max_size(1).build(manager)?;
    Ok(pool)
}

/// Run `f` with a pooled connection on the blocking thread pool
pub async fn with_conn<T, F>(db: &DbPool, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = db.get()?;
        f(&mut conn)
    })
    .await
    .map_err(|e| ManagerError::Io(std::io::Error::other(e)))?
}
