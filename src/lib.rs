// ==========================================
// 批量迁移引擎 - 核心库
// ==========================================
// 职责: 把已解析的源行转成安全、幂等、可续跑的远端写入
// 技术栈: Rust + tokio + SQLite / JSONL 账本
// ==========================================

// 初始化国际化系统
rust_i18n::i18n!("locales", fallback = "zh-CN");

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 记录与类型
pub mod domain;

// 账本仓储层 - 持久化
pub mod repository;

// 引擎层 - 校验 / 转换 / 去重 / 批次控制
pub mod engine;

// 记录源层 - 外部文件
pub mod importer;

// 配置层 - 计划与引擎参数
pub mod config;

// 远端服务契约
pub mod remote;

// 运行汇总
pub mod report;

// 数据库基础设施（连接初始化/PRAGMA 统一）
pub mod db;

// 日志系统
pub mod logging;

// 国际化
pub mod i18n;

// ==========================================
// 重导出核心类型
// ==========================================

pub use config::{EngineConfig, MigrationPlan};
pub use domain::{
    DedupeStrategy, LedgerEntry, MigrationRecord, MigrationRun, RecordState, RunStatus,
    SourceIdentity, SourceRow, ValidationSchema,
};
pub use engine::{BatchController, EngineError, EngineResult, RemoteError, RunReport};
pub use importer::{CsvRecordSource, RecordSource};
pub use remote::{InMemoryRemote, RemoteService};
pub use report::RunSummary;
pub use repository::{open_ledger, AuditLedger, FileLedger, SqliteLedger};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "批量迁移引擎";
