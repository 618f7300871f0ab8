// ==========================================
// 批量迁移引擎 - 审计账本仓储接口
// ==========================================
// 红线: 只追加；append 返回即代表已落盘
// 续跑时以账本为唯一事实来源
// ==========================================

use crate::domain::ledger::{BatchCheckpoint, LedgerEntry, MigrationRun};
use crate::domain::record::SourceIdentity;
use crate::repository::error::LedgerResult;
use std::collections::{HashMap, HashSet};

/// 审计账本
///
/// 所有方法同步执行；调用方在记录终态确定后立即写入。
pub trait AuditLedger: Send + Sync {
    /// 追加一条终态记录（落盘后返回）
    fn append(&self, entry: &LedgerEntry) -> LedgerResult<()>;

    /// 按写入顺序读取某次运行的全部条目
    fn entries(&self, run_id: &str) -> LedgerResult<Vec<LedgerEntry>>;

    /// 某次运行已到达终态的记录集合
    fn load(&self, run_id: &str) -> LedgerResult<CompletedSet> {
        Ok(CompletedSet::from_entries(self.entries(run_id)?))
    }

    /// 批次完成标记（重复标记幂等）
    fn mark_checkpoint(&self, checkpoint: &BatchCheckpoint) -> LedgerResult<()>;

    fn checkpoints(&self, run_id: &str) -> LedgerResult<Vec<BatchCheckpoint>>;

    /// 保存运行元数据（覆盖旧版本）
    fn save_run(&self, run: &MigrationRun) -> LedgerResult<()>;

    fn load_run(&self, run_id: &str) -> LedgerResult<Option<MigrationRun>>;
}

// ==========================================
// CompletedSet - 已完成记录集合
// ==========================================
#[derive(Debug, Clone, Default)]
pub struct CompletedSet {
    entries: HashMap<SourceIdentity, LedgerEntry>,
}

impl CompletedSet {
    /// 同一标识出现多次时保留第一条
    pub fn from_entries(entries: impl IntoIterator<Item = LedgerEntry>) -> Self {
        let mut map = HashMap::new();
        for entry in entries {
            map.entry(entry.source_identity.clone()).or_insert(entry);
        }
        Self { entries: map }
    }

    pub fn get(&self, identity: &SourceIdentity) -> Option<&LedgerEntry> {
        self.entries.get(identity)
    }

    pub fn contains(&self, identity: &SourceIdentity) -> bool {
        self.entries.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// (model, batch_seq) 集合
pub fn checkpoint_set(checkpoints: &[BatchCheckpoint]) -> HashSet<(String, u32)> {
    checkpoints
        .iter()
        .map(|c| (c.model.clone(), c.batch_seq))
        .collect()
}
