// ==========================================
// 批量迁移引擎 - 账本仓储错误类型
// ==========================================
// 工具: thiserror 派生宏
// ==========================================

use thiserror::Error;

/// 账本仓储错误类型
#[derive(Error, Debug)]
pub enum LedgerError {
    // ===== 存储错误 =====
    #[error("账本文件读写失败: {0}")]
    IoError(String),

    #[error("账本序列化失败: {0}")]
    SerializationError(String),

    #[error("账本 CSV 镜像写入失败: {0}")]
    CsvError(String),

    #[error("数据库查询失败: {0}")]
    DatabaseQueryError(String),

    #[error("数据库锁获取失败: {0}")]
    LockError(String),

    // ===== 账本规则 =====
    #[error("账本只允许追加: {0}")]
    AppendOnlyViolation(String),

    #[error("账本内容损坏 ({path}, 行 {line}): {message}")]
    Corrupted {
        path: String,
        line: usize,
        message: String,
    },

    #[error("字段值错误 (field={field}): {message}")]
    FieldValueError { field: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        LedgerError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::SerializationError(err.to_string())
    }
}

impl From<csv::Error> for LedgerError {
    fn from(err: csv::Error) -> Self {
        LedgerError::CsvError(err.to_string())
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("append-only") => {
                LedgerError::AppendOnlyViolation(msg)
            }
            _ => LedgerError::DatabaseQueryError(err.to_string()),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
