// ==========================================
// 批量迁移引擎 - 领域模型层
// ==========================================
// 职责: 定义记录、Schema、账本条目、运行元数据
// 红线: 不含数据访问逻辑，不含远端调用
// ==========================================

pub mod ledger;
pub mod record;
pub mod schema;
pub mod types;
pub mod validation;

// 重导出核心类型
pub use ledger::{BatchCheckpoint, LedgerEntry, MigrationRun, RunCounters};
pub use record::{
    DedupeKey, FieldValues, MigrationRecord, SourceIdentity, SourceRow, StateTransitionError,
    WriteIntent,
};
pub use schema::{DedupeConfig, FieldRule, FieldType, ReferenceRule, TransformStep, ValidationSchema};
pub use types::{
    BackoffCurve, DedupeStrategy, LedgerBackend, RecordState, RemoteId, RunStatus, WriteAction,
};
pub use validation::{ValidationError, ViolationCode};
