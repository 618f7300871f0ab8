// ==========================================
// 批量迁移引擎 - 引擎层
// ==========================================
// 组件（依赖顺序）:
// 校验器 -> 转换管线 -> 去重器 -> 引用解析 -> 批次控制器
// 红线: 引擎不拼 SQL，持久化只经由 AuditLedger
// ==========================================

pub mod batch_controller;
pub mod deduplicator;
pub mod error;
pub mod pipeline;
pub mod reference;
pub mod retry;
pub mod transform;
pub mod validator;

// 重导出核心类型
pub use batch_controller::{BatchController, PreviewCounts, PreviewIssue, RunReport, ValidationPreview};
pub use deduplicator::{resolve_remote, Deduplicator, LookupSettings, RemoteResolution};
pub use error::{
    EngineError, EngineResult, ErrorClass, RemoteError, TransformError, ValidationError,
    ViolationCode,
};
pub use pipeline::{TransformOutcome, TransformPipeline};
pub use reference::{resolve_references, ReferenceCache, ReferenceResolution};
pub use retry::{run_with_retry, RetryDecision, RetryPolicy};
pub use transform::{FieldTransform, TransformRegistry, BUILTIN_TRANSFORMS};
pub use validator::Validator;
