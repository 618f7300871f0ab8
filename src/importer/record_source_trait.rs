// ==========================================
// 批量迁移引擎 - 记录源 Trait
// ==========================================
// 职责: 定义上游记录源接口（不包含实现）
// 引擎只消费 SourceRow，不关心文件格式
// ==========================================

use crate::domain::record::SourceRow;
use crate::importer::error::ImportResult;

// ==========================================
// RecordSource Trait
// ==========================================
// 实现者: CsvRecordSource
pub trait RecordSource: Send + Sync {
    /// 目标模型名
    fn model(&self) -> &str;

    /// 按文件顺序产出源行
    ///
    /// # 返回
    /// - Ok(Vec<SourceRow>): 行号从 1 开始（表头不计），标识稳定
    /// - Err: 文件不存在、格式不支持、解析失败
    fn rows(&self) -> ImportResult<Vec<SourceRow>>;
}
