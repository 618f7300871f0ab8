// ==========================================
// 批量迁移引擎 - 记录源层
// ==========================================
// 职责: 把外部文件读成 SourceRow
// 支持: CSV（一个文件对应一个模型）
// ==========================================

pub mod error;
pub mod file_parser;
pub mod record_source_trait;

pub use error::{ImportError, ImportResult};
pub use file_parser::{file_identity, load_plan_sources, CsvRecordSource};
pub use record_source_trait::RecordSource;
