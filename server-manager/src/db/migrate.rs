use crate::db::connection::DbPool;
use crate::utils::errors::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_records (
  id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK(kind IN ('full','incremental')),
  parent_id TEXT REFERENCES backup_records(id),
  local_path TEXT NOT NULL,
  scheduled_at TEXT NOT NULL,
  completed_at TEXT NOT NULL,
  files_total INTEGER NOT NULL DEFAULT 0,
  bytes_total INTEGER NOT NULL DEFAULT 0,
  files_copied INTEGER NOT NULL DEFAULT 0,
  bytes_copied INTEGER NOT NULL DEFAULT 0,
  CHECK((kind = 'full') = (parent_id IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_backup_records_parent ON backup_records(parent_id);
CREATE INDEX IF NOT EXISTS idx_backup_records_scheduled ON backup_records(scheduled_at DESC);

CREATE TRIGGER IF NOT EXISTS backup_records_parent_is_full
BEFORE INSERT ON backup_records
WHEN NEW.parent_id IS NOT NULL
  AND (SELECT kind FROM backup_records WHERE id = NEW.parent_id) IS NOT 'full'
BEGIN
  SELECT RAISE(ABORT, 'incremental parent must be a full backup');
END;
"#;

pub fn migrate(pool: &DbPool) -> Result<()> {
    tracing::info!("[DB] Applying catalog schema");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("[DB] Catalog ready");
    Ok(())
}
