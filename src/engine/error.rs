// ==========================================
// 批量迁移引擎 - 引擎层错误类型
// ==========================================
// 错误分级:
// - 记录级: ValidationError / TransformError / RemoteError(临时/永久)
// - 运行级: RemoteError(致命) -> RunAborted
// 记录级错误只进账本，不中断批次
// ==========================================

use crate::config::error::ConfigError;
use crate::domain::record::StateTransitionError;
use crate::importer::error::ImportError;
use crate::repository::error::LedgerError;
use std::fmt;
use thiserror::Error;

pub use crate::domain::validation::{ValidationError, ViolationCode};

/// 转换失败（在记录上以 TRANSFORM_FAILED 违规体现）
#[derive(Error, Debug, Clone, PartialEq)]
#[error("转换 {transform} 失败: {message} (value={value})")]
pub struct TransformError {
    pub transform: String,
    pub value: String,
    pub message: String,
}

/// 远端错误分级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 可重试
    Transient,
    /// 不可重试，记录失败
    Permanent,
    /// 中止整次运行
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// 远端调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    // ===== 临时错误 =====
    #[error("远端调用超时: {0}")]
    Timeout(String),

    #[error("连接被重置: {0}")]
    ConnectionReset(String),

    #[error("远端限流 (retry_after_ms={retry_after_ms:?})")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("远端暂不可用: {0}")]
    Unavailable(String),

    // ===== 永久错误 =====
    #[error("远端校验拒绝: {0}")]
    Rejected(String),

    #[error("权限不足: {0}")]
    PermissionDenied(String),

    #[error("远端记录不存在 (model={model}, id={remote_id})")]
    RecordNotFound { model: String, remote_id: i64 },

    // ===== 致命错误 =====
    #[error("认证失败: {0}")]
    AuthenticationFailed(String),

    #[error("远端未知模型: {0}")]
    UnknownModel(String),

    #[error("远端服务不可达: {0}")]
    Unreachable(String),
}

impl RemoteError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RemoteError::Timeout(_)
            | RemoteError::ConnectionReset(_)
            | RemoteError::RateLimited { .. }
            | RemoteError::Unavailable(_) => ErrorClass::Transient,
            RemoteError::Rejected(_)
            | RemoteError::PermissionDenied(_)
            | RemoteError::RecordNotFound { .. } => ErrorClass::Permanent,
            RemoteError::AuthenticationFailed(_)
            | RemoteError::UnknownModel(_)
            | RemoteError::Unreachable(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// 远端建议的等待时间
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            RemoteError::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }
}

/// 引擎错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    InvalidStateTransition(#[from] StateTransitionError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("计划中不存在的模型 (model={model}, identity={identity})")]
    UnknownModel { model: String, identity: String },

    #[error("模型已停用，不接受源行 (model={model}, identity={identity})")]
    ModelDisabled { model: String, identity: String },

    #[error("运行已中止 (run_id={run_id}): {reason}")]
    RunAborted { run_id: String, reason: String },

    #[error("计划已变更，无法续跑 (run_id={run_id}): expected={expected}, actual={actual}")]
    PlanChanged {
        run_id: String,
        expected: String,
        actual: String,
    },

    #[error("运行不存在: {0}")]
    RunNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
