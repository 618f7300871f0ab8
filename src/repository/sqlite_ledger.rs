// ==========================================
// 批量迁移引擎 - SQLite 账本
// ==========================================
// 表: ledger_entry / batch_checkpoint / migration_run
// ledger_entry 的 UPDATE / DELETE 由触发器拒绝
// ==========================================

use crate::db::{init_schema, open_in_memory, open_sqlite_connection};
use crate::domain::ledger::{BatchCheckpoint, LedgerEntry, MigrationRun};
use crate::domain::record::{DedupeKey, SourceIdentity};
use crate::domain::types::{RecordState, WriteAction};
use crate::repository::error::{LedgerError, LedgerResult};
use crate::repository::ledger_repo::AuditLedger;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex, MutexGuard};

pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    pub fn new(db_path: &str) -> LedgerResult<Self> {
        let conn = open_sqlite_connection(db_path)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> LedgerResult<Self> {
        let conn = open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> LedgerResult<Self> {
        {
            let guard = conn
                .lock()
                .map_err(|e| LedgerError::LockError(e.to_string()))?;
            init_schema(&guard)?;
        }
        Ok(Self { conn })
    }

    fn get_conn(&self) -> LedgerResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LedgerError::LockError(e.to_string()))
    }
}

fn parse_ts(raw: &str, field: &str) -> LedgerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LedgerError::FieldValueError {
            field: field.to_string(),
            message: e.to_string(),
        })
}

struct EntryRow {
    recorded_at: String,
    run_id: String,
    model: String,
    source_identity: String,
    row_number: i64,
    dedupe_key: Option<String>,
    state: String,
    action: Option<String>,
    remote_id: Option<i64>,
    error_message: Option<String>,
    batch_seq: Option<i64>,
}

impl EntryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            model: row.get(1)?,
            source_identity: row.get(2)?,
            row_number: row.get(3)?,
            dedupe_key: row.get(4)?,
            state: row.get(5)?,
            action: row.get(6)?,
            remote_id: row.get(7)?,
            error_message: row.get(8)?,
            batch_seq: row.get(9)?,
            recorded_at: row.get(10)?,
        })
    }

    fn into_entry(self) -> LedgerResult<LedgerEntry> {
        let state: RecordState = self.state.parse().map_err(|message| LedgerError::FieldValueError {
            field: "state".to_string(),
            message,
        })?;
        let action = match self.action {
            Some(raw) => Some(raw.parse::<WriteAction>().map_err(|message| {
                LedgerError::FieldValueError {
                    field: "action".to_string(),
                    message,
                }
            })?),
            None => None,
        };

        Ok(LedgerEntry {
            recorded_at: parse_ts(&self.recorded_at, "recorded_at")?,
            run_id: self.run_id,
            model: self.model,
            source_identity: SourceIdentity::from_raw(self.source_identity),
            row_number: self.row_number.max(0) as usize,
            dedupe_key: self.dedupe_key.map(DedupeKey::from_raw),
            state,
            action,
            remote_id: self.remote_id,
            error_message: self.error_message,
            batch_seq: self.batch_seq.map(|s| s.max(0) as u32),
        })
    }
}

impl AuditLedger for SqliteLedger {
    fn append(&self, entry: &LedgerEntry) -> LedgerResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO ledger_entry (
                run_id, model, source_identity, row_number, dedupe_key,
                state, action, remote_id, error_message, batch_seq, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                entry.run_id,
                entry.model,
                entry.source_identity.as_str(),
                entry.row_number as i64,
                entry.dedupe_key.as_ref().map(|k| k.as_str()),
                entry.state.as_str(),
                entry.action.map(|a| a.as_str()),
                entry.remote_id,
                entry.error_message,
                entry.batch_seq.map(i64::from),
                entry.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn entries(&self, run_id: &str) -> LedgerResult<Vec<LedgerEntry>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, model, source_identity, row_number, dedupe_key,
                   state, action, remote_id, error_message, batch_seq, recorded_at
            FROM ledger_entry
            WHERE run_id = ?1
            ORDER BY seq
            "#,
        )?;
        let rows = stmt.query_map(params![run_id], EntryRow::from_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    fn mark_checkpoint(&self, checkpoint: &BatchCheckpoint) -> LedgerResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO batch_checkpoint (run_id, model, batch_seq, record_count, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                checkpoint.run_id,
                checkpoint.model,
                i64::from(checkpoint.batch_seq),
                checkpoint.record_count as i64,
                checkpoint.completed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn checkpoints(&self, run_id: &str) -> LedgerResult<Vec<BatchCheckpoint>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, model, batch_seq, record_count, completed_at
            FROM batch_checkpoint
            WHERE run_id = ?1
            ORDER BY completed_at, model, batch_seq
            "#,
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut checkpoints = Vec::new();
        for row in rows {
            let (run_id, model, batch_seq, record_count, completed_at) = row?;
            checkpoints.push(BatchCheckpoint {
                run_id,
                model,
                batch_seq: batch_seq.max(0) as u32,
                record_count: record_count.max(0) as usize,
                completed_at: parse_ts(&completed_at, "completed_at")?,
            });
        }
        Ok(checkpoints)
    }

    fn save_run(&self, run: &MigrationRun) -> LedgerResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO migration_run (run_id, status, payload_json, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(run_id) DO UPDATE SET
                status = excluded.status,
                payload_json = excluded.payload_json,
                updated_at = excluded.updated_at
            "#,
            params![
                run.run_id,
                run.status.as_str(),
                serde_json::to_string(run)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn load_run(&self, run_id: &str) -> LedgerResult<Option<MigrationRun>> {
        let conn = self.get_conn()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM migration_run WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}
