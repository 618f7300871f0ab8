// ==========================================
// 批量迁移引擎 - 配置管理器
// ==========================================
// 职责: 从 config_kv 表读取持久化覆写，叠加到引擎参数上
// 存储: config_kv 表 (key-value + scope)
// ==========================================

use crate::config::engine_config::EngineConfig;
use crate::config::error::{ConfigError, ConfigResult};
use crate::db::{configure_sqlite_connection, init_schema, open_sqlite_connection};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// config_kv 中使用的键
pub mod config_keys {
    pub const CHUNK_SIZE: &str = "engine.chunk_size";
    pub const RETRY_ATTEMPTS: &str = "engine.retry_attempts";
    pub const RETRY_BASE_DELAY_MS: &str = "engine.retry_base_delay_ms";
    pub const RETRY_MAX_DELAY_MS: &str = "engine.retry_max_delay_ms";
    pub const BACKOFF: &str = "engine.backoff";
    pub const PARALLEL: &str = "engine.parallel";
    pub const MAX_WORKERS: &str = "engine.max_workers";
    pub const LOOKUP_BATCH_SIZE: &str = "engine.lookup_batch_size";
    pub const LOOKUP_CONCURRENCY: &str = "engine.lookup_concurrency";
    pub const DEFAULT_COUNTRY_CODE: &str = "engine.default_country_code";
    pub const LEDGER_BACKEND: &str = "engine.ledger_backend";
    pub const LEDGER_DIR: &str = "engine.ledger_dir";
    pub const CSV_MIRROR: &str = "engine.csv_mirror";
}

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 打开配置库（不存在则建表）
    pub fn new(db_path: &str) -> ConfigResult<Self> {
        let conn = open_sqlite_connection(db_path)?;
        init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建 ConfigManager
    ///
    /// 说明：会对传入连接再次应用统一 PRAGMA（幂等）。
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> ConfigResult<Self> {
        {
            let guard = conn
                .lock()
                .map_err(|e| ConfigError::StoreError(format!("锁获取失败: {}", e)))?;
            configure_sqlite_connection(&guard)?;
            init_schema(&guard)?;
        }

        Ok(Self { conn })
    }

    /// 读取 global scope 的配置值
    pub fn get_config_value(&self, key: &str) -> ConfigResult<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ConfigError::StoreError(format!("锁获取失败: {}", e)))?;

        let result = conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 写入 global scope 的配置值（UPSERT）
    pub fn set_config_value(&self, key: &str, value: &str) -> ConfigResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ConfigError::StoreError(format!("锁获取失败: {}", e)))?;

        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value, updated_at)
             VALUES ('global', ?1, ?2, datetime('now'))
             ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value],
        )?;
        Ok(())
    }

    /// 所有 global 配置快照
    pub fn get_config_snapshot(&self) -> ConfigResult<BTreeMap<String, String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ConfigError::StoreError(format!("锁获取失败: {}", e)))?;

        let mut stmt =
            conn.prepare("SELECT key, value FROM config_kv WHERE scope_id = 'global' ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut snapshot = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            snapshot.insert(key, value);
        }
        Ok(snapshot)
    }

    /// 在基础参数上叠加持久化覆写，并做范围校验
    pub fn apply_overrides(&self, base: &EngineConfig) -> ConfigResult<EngineConfig> {
        use config_keys::*;

        let mut cfg = base.clone();

        if let Some(v) = self.parsed(CHUNK_SIZE)? {
            cfg.chunk_size = v;
        }
        if let Some(v) = self.parsed(RETRY_ATTEMPTS)? {
            cfg.retry_attempts = v;
        }
        if let Some(v) = self.parsed(RETRY_BASE_DELAY_MS)? {
            cfg.retry_base_delay_ms = v;
        }
        if let Some(v) = self.parsed(RETRY_MAX_DELAY_MS)? {
            cfg.retry_max_delay_ms = v;
        }
        if let Some(v) = self.parsed(BACKOFF)? {
            cfg.backoff = v;
        }
        if let Some(v) = self.parsed(PARALLEL)? {
            cfg.parallel = v;
        }
        if let Some(v) = self.parsed(MAX_WORKERS)? {
            cfg.max_workers = v;
        }
        if let Some(v) = self.parsed(LOOKUP_BATCH_SIZE)? {
            cfg.lookup_batch_size = v;
        }
        if let Some(v) = self.parsed(LOOKUP_CONCURRENCY)? {
            cfg.lookup_concurrency = v;
        }
        if let Some(v) = self.get_config_value(DEFAULT_COUNTRY_CODE)? {
            cfg.default_country_code = v.trim().to_string();
        }
        if let Some(v) = self.parsed(LEDGER_BACKEND)? {
            cfg.ledger_backend = v;
        }
        if let Some(v) = self.get_config_value(LEDGER_DIR)? {
            if !v.trim().is_empty() {
                cfg.ledger_dir = Some(PathBuf::from(v.trim()));
            }
        }
        if let Some(v) = self.parsed(CSV_MIRROR)? {
            cfg.csv_mirror = v;
        }

        cfg.validate()?;
        debug!(chunk_size = cfg.chunk_size, workers = cfg.workers(), "已应用配置覆写");
        Ok(cfg)
    }

    fn parsed<T>(&self, key: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_config_value(key)? {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw.clone(),
                    message: e.to_string(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{BackoffCurve, LedgerBackend};

    fn setup() -> ConfigManager {
        let conn = Connection::open_in_memory().unwrap();
        ConfigManager::from_connection(Arc::new(Mutex::new(conn))).unwrap()
    }

    #[test]
    fn test_missing_key_returns_none() {
        let manager = setup();
        assert_eq!(manager.get_config_value("engine.chunk_size").unwrap(), None);
    }

    #[test]
    fn test_overrides_are_applied() {
        let manager = setup();
        manager.set_config_value(config_keys::CHUNK_SIZE, "50").unwrap();
        manager.set_config_value(config_keys::BACKOFF, "linear").unwrap();
        manager.set_config_value(config_keys::PARALLEL, "true").unwrap();
        manager.set_config_value(config_keys::LEDGER_BACKEND, "sqlite").unwrap();

        let cfg = manager.apply_overrides(&EngineConfig::default()).unwrap();
        assert_eq!(cfg.chunk_size, 50);
        assert_eq!(cfg.backoff, BackoffCurve::Linear);
        assert!(cfg.parallel);
        assert_eq!(cfg.ledger_backend, LedgerBackend::Sqlite);
        assert_eq!(cfg.retry_attempts, 3);
    }

    #[test]
    fn test_upsert_overwrites() {
        let manager = setup();
        manager.set_config_value(config_keys::MAX_WORKERS, "2").unwrap();
        manager.set_config_value(config_keys::MAX_WORKERS, "8").unwrap();
        assert_eq!(
            manager.get_config_value(config_keys::MAX_WORKERS).unwrap().as_deref(),
            Some("8")
        );
        assert_eq!(manager.get_config_snapshot().unwrap().len(), 1);
    }

    #[test]
    fn test_bad_value_is_reported_with_key() {
        let manager = setup();
        manager.set_config_value(config_keys::CHUNK_SIZE, "lots").unwrap();
        match manager.apply_overrides(&EngineConfig::default()) {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, config_keys::CHUNK_SIZE),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_out_of_range_override_rejected() {
        let manager = setup();
        manager.set_config_value(config_keys::CHUNK_SIZE, "9000").unwrap();
        assert!(matches!(
            manager.apply_overrides(&EngineConfig::default()),
            Err(ConfigError::OutOfRange { .. })
        ));
    }
}
