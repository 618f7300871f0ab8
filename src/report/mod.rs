// ==========================================
// 批量迁移引擎 - 运行报告
// ==========================================

pub mod summary;

pub use summary::{format_duration, ErrorCount, RunSummary};
