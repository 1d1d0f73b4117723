//! Catalog of committed snapshots.
//!
//! Only snapshots whose artifacts are complete are ever inserted. The
//! schema enforces that an incremental references an existing Full, and
//! retention removes whole chains inside one transaction.

use crate::backup::plan::{BackupKind, ScheduleState};
use crate::utils::errors::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    pub id: String,
    pub kind: BackupKind,
    /// Full snapshot this incremental depends on
    pub parent_id: Option<String>,
    pub local_path: PathBuf,
    pub scheduled_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub files_total: u64,
    pub bytes_total: u64,
    pub files_copied: u64,
    pub bytes_copied: u64,
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    let index = row.as_ref().column_index(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}

fn row_to_record(row: &Row) -> rusqlite::Result<BackupRecord> {
    let kind: String = row.get("kind")?;
    let kind = BackupKind::parse(&kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            format!("unknown backup kind `{}`", kind).into(),
        )
    })?;
    let local_path: String = row.get("local_path")?;

    Ok(BackupRecord {
        id: row.get("id")?,
        kind,
        parent_id: row.get("parent_id")?,
        local_path: PathBuf::from(local_path),
        scheduled_at: parse_timestamp(row, "scheduled_at")?,
        completed_at: parse_timestamp(row, "completed_at")?,
        files_total: row.get::<_, i64>("files_total")? as u64,
        bytes_total: row.get::<_, i64>("bytes_total")? as u64,
        files_copied: row.get::<_, i64>("files_copied")? as u64,
        bytes_copied: row.get::<_, i64>("bytes_copied")? as u64,
    })
}

fn query_records(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<BackupRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, row_to_record)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn insert(conn: &Connection, record: &BackupRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO backup_records (id, kind, parent_id, local_path, scheduled_at, completed_at,
                                     files_total, bytes_total, files_copied, bytes_copied)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.id,
            record.kind.as_str(),
            record.parent_id,
            record.local_path.to_string_lossy(),
            timestamp(&record.scheduled_at),
            timestamp(&record.completed_at),
            record.files_total as i64,
            record.bytes_total as i64,
            record.files_copied as i64,
            record.bytes_copied as i64,
        ],
    )?;
    Ok(())
}

/// All records, oldest first
pub fn find_all(conn: &Connection) -> Result<Vec<BackupRecord>> {
    query_records(conn, "SELECT * FROM backup_records ORDER BY scheduled_at, id", params![])
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<BackupRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM backup_records WHERE id = ?")?;
    Ok(stmt.query_row(params![id], row_to_record).optional()?)
}

pub fn latest_of_kind(conn: &Connection, kind: BackupKind) -> Result<Option<BackupRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_records WHERE kind = ? ORDER BY scheduled_at DESC, id DESC LIMIT 1",
    )?;
    Ok(stmt.query_row(params![kind.as_str()], row_to_record).optional()?)
}

/// Newest member of the chain rooted at `full_id`, the Full included
pub fn latest_in_chain(conn: &Connection, full_id: &str) -> Result<Option<BackupRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_records WHERE id = ?1 OR parent_id = ?1
         ORDER BY scheduled_at DESC, id DESC LIMIT 1",
    )?;
    Ok(stmt.query_row(params![full_id], row_to_record).optional()?)
}

/// Incrementals depending on `full_id`, oldest first
pub fn dependents(conn: &Connection, full_id: &str) -> Result<Vec<BackupRecord>> {
    query_records(
        conn,
        "SELECT * FROM backup_records WHERE parent_id = ? ORDER BY scheduled_at, id",
        params![full_id],
    )
}

/// Schedule state derived from the newest committed snapshots
pub fn schedule_state(conn: &Connection) -> Result<ScheduleState> {
    let last_full = latest_of_kind(conn, BackupKind::Full)?.map(|r| r.scheduled_at);
    let last_incremental = latest_of_kind(conn, BackupKind::Incremental)?.map(|r| r.scheduled_at);

    Ok(ScheduleState {
        last_full,
        last_incremental: match (last_full, last_incremental) {
            (Some(f), Some(i)) => Some(f.max(i)),
            (f, i) => f.or(i),
        },
        last_failure: None,
    })
}

/// Remove the oldest chains until at most `keep` Full records remain.
///
/// Returns the removed records, dependents before their Full. Either every
/// listed record is gone from the catalog or none is.
pub fn evict_beyond(conn: &mut Connection, keep: usize) -> Result<Vec<BackupRecord>> {
    let tx = conn.transaction()?;

    let fulls = query_records(
        &tx,
        "SELECT * FROM backup_records WHERE kind = 'full' ORDER BY scheduled_at, id",
        params![],
    )?;
    let excess = fulls.len().saturating_sub(keep);

    let mut evicted = Vec::new();
    for full in fulls.into_iter().take(excess) {
        let chain = dependents(&tx, &full.id)?;
        tx.execute("DELETE FROM backup_records WHERE parent_id = ?", params![full.id])?;
        tx.execute("DELETE FROM backup_records WHERE id = ?", params![full.id])?;
        evicted.extend(chain);
        evicted.push(full);
    }

    tx.commit()?;
    Ok(evicted)
}
