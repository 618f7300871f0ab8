// ==========================================
// 批量迁移引擎 - SQLite 连接初始化
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为
// - 账本写入要求落盘后才算完成 (synchronous = FULL)
// - 统一建表（账本 / 批次标记 / 运行元数据 / 配置覆写）
// ==========================================

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use std::time::Duration;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前 schema 版本
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys / busy_timeout 需要“每个连接”单独配置
/// - 内存库的 journal_mode 返回 memory，不影响使用
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 打开内存库（测试 / 演练）
pub fn open_in_memory() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 建表（幂等）
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS config_kv (
            scope_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (scope_id, key)
        );

        CREATE TABLE IF NOT EXISTS migration_run (
            run_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ledger_entry (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            model TEXT NOT NULL,
            source_identity TEXT NOT NULL,
            row_number INTEGER NOT NULL,
            dedupe_key TEXT,
            state TEXT NOT NULL,
            action TEXT,
            remote_id INTEGER,
            error_message TEXT,
            batch_seq INTEGER,
            recorded_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_ledger_entry_run ON ledger_entry (run_id, seq);

        CREATE TRIGGER IF NOT EXISTS trg_ledger_entry_no_update
        BEFORE UPDATE ON ledger_entry
        BEGIN
            SELECT RAISE(ABORT, 'ledger_entry is append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS trg_ledger_entry_no_delete
        BEFORE DELETE ON ledger_entry
        BEGIN
            SELECT RAISE(ABORT, 'ledger_entry is append-only');
        END;

        CREATE TABLE IF NOT EXISTS batch_checkpoint (
            run_id TEXT NOT NULL,
            model TEXT NOT NULL,
            batch_seq INTEGER NOT NULL,
            record_count INTEGER NOT NULL,
            completed_at TEXT NOT NULL,
            PRIMARY KEY (run_id, model, batch_seq)
        );
        "#,
    )?;

    if read_schema_version(conn)?.is_none() {
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            [CURRENT_SCHEMA_VERSION],
        )?;
    }
    Ok(())
}

/// 读取 schema_version（若表不存在或为空则返回 None）
pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
            [],
            |_row| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if !has_table {
        return Ok(None);
    }

    let v: Option<i64> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(v)
}
