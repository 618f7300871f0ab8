// ==========================================
// 批量迁移引擎 - 审计账本仓储层
// ==========================================
// 红线: Repository 不含业务逻辑，只做持久化
// 约束: SQL 全部参数化
// ==========================================

pub mod error;
pub mod file_ledger;
pub mod ledger_repo;
pub mod sqlite_ledger;

pub use error::{LedgerError, LedgerResult};
pub use file_ledger::FileLedger;
pub use ledger_repo::{checkpoint_set, AuditLedger, CompletedSet};
pub use sqlite_ledger::SqliteLedger;

use crate::config::engine_config::EngineConfig;
use crate::domain::types::LedgerBackend;
use std::sync::Arc;
use tracing::info;

/// SQLite 账本文件名（位于账本根目录下）
pub const SQLITE_LEDGER_FILE: &str = "ledger.db";

/// 按引擎参数打开账本
pub fn open_ledger(cfg: &EngineConfig) -> LedgerResult<Arc<dyn AuditLedger>> {
    let root = cfg.resolved_ledger_dir();
    match cfg.ledger_backend {
        LedgerBackend::Jsonl => {
            info!(root = %root.display(), csv_mirror = cfg.csv_mirror, "打开文件账本");
            Ok(Arc::new(FileLedger::new(root, cfg.csv_mirror)?))
        }
        LedgerBackend::Sqlite => {
            std::fs::create_dir_all(&root)?;
            let path = root.join(SQLITE_LEDGER_FILE);
            info!(path = %path.display(), "打开 SQLite 账本");
            Ok(Arc::new(SqliteLedger::new(&path.to_string_lossy())?))
        }
    }
}
