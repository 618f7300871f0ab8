// ==========================================
// 批量迁移引擎 - 审计账本领域模型
// ==========================================
// 红线: 账本只追加，不修改，不删除
// 用途: 审计追踪 / 断点续跑的唯一事实来源
// ==========================================

use crate::domain::record::{DedupeKey, MigrationRecord, SourceIdentity};
use crate::domain::types::{RecordState, RemoteId, RunStatus, WriteAction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==========================================
// LedgerEntry - 单条记录的终态结果
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub recorded_at: DateTime<Utc>,
    pub run_id: String,
    pub model: String,
    pub source_identity: SourceIdentity,
    pub row_number: usize,
    pub dedupe_key: Option<DedupeKey>,
    pub state: RecordState,
    pub action: Option<WriteAction>,
    pub remote_id: Option<RemoteId>,
    pub error_message: Option<String>,
    /// 批前决定的记录（INVALID / 批内重复）为 None
    pub batch_seq: Option<u32>,
}

impl LedgerEntry {
    pub fn from_record(run_id: &str, record: &MigrationRecord) -> Self {
        Self {
            recorded_at: Utc::now(),
            run_id: run_id.to_string(),
            model: record.model.clone(),
            source_identity: record.identity.clone(),
            row_number: record.row_number,
            dedupe_key: record.dedupe_key.clone(),
            state: record.state,
            action: record.write_action(),
            remote_id: record.remote_id,
            error_message: record.error_message(),
            batch_seq: record.batch_seq,
        }
    }
}

// ==========================================
// BatchCheckpoint - 批次完成标记
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCheckpoint {
    pub run_id: String,
    pub model: String,
    pub batch_seq: u32,
    pub record_count: usize,
    pub completed_at: DateTime<Utc>,
}

impl BatchCheckpoint {
    pub fn new(run_id: &str, model: &str, batch_seq: u32, record_count: usize) -> Self {
        Self {
            run_id: run_id.to_string(),
            model: model.to_string(),
            batch_seq,
            record_count,
            completed_at: Utc::now(),
        }
    }
}

// ==========================================
// RunCounters - 运行计数（由账本汇总）
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub total: usize,
    pub invalid: usize,
    pub duplicate_skipped: usize,
    pub imported: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
}

impl RunCounters {
    pub fn add(&mut self, entry: &LedgerEntry) {
        self.total += 1;
        match entry.state {
            RecordState::Invalid => self.invalid += 1,
            RecordState::DuplicateSkipped => self.duplicate_skipped += 1,
            RecordState::Imported => {
                self.imported += 1;
                match entry.action {
                    Some(WriteAction::Update) => self.updated += 1,
                    _ => self.created += 1,
                }
            }
            RecordState::Failed => self.failed += 1,
            _ => {}
        }
    }

    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Self {
        let mut counters = Self::default();
        for entry in entries {
            counters.add(entry);
        }
        counters
    }
}

// ==========================================
// MigrationRun - 运行元数据
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRun {
    pub run_id: String,
    pub plan_name: String,
    pub plan_fingerprint: String,
    pub models: Vec<String>,
    pub status: RunStatus,
    pub abort_reason: Option<String>,
    pub counters: RunCounters,
    #[serde(default)]
    pub models_completed: Vec<String>,
    #[serde(default)]
    pub resume_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationRun {
    pub fn start(plan_name: &str, plan_fingerprint: &str, models: Vec<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            plan_name: plan_name.to_string(),
            plan_fingerprint: plan_fingerprint.to_string(),
            models,
            status: RunStatus::Running,
            abort_reason: None,
            counters: RunCounters::default(),
            models_completed: Vec::new(),
            resume_count: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// 耗时（秒），未结束时为 None
    pub fn duration_secs(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_seconds().max(0))
    }
}
