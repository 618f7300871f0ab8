// ==========================================
// 批量迁移引擎 - 领域类型定义
// ==========================================
// 职责: 记录生命周期状态 / 去重策略 / 写入动作 / 运行状态
// 序列化格式与账本存储保持一致
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 远端记录 ID
pub type RemoteId = i64;

// ==========================================
// 记录状态 (Record State)
// ==========================================
// 红线: 终态只有四种，且每条记录在一次运行中只能到达一次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordState {
    Pending,          // 待处理
    Valid,            // 校验通过
    UniqueOrUpdate,   // 去重通过，待写入
    Invalid,          // 校验失败（终态）
    DuplicateSkipped, // 重复跳过（终态）
    Imported,         // 已写入远端（终态）
    Failed,           // 写入失败（终态）
}

impl RecordState {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordState::Invalid
                | RecordState::DuplicateSkipped
                | RecordState::Imported
                | RecordState::Failed
        )
    }

    /// 状态迁移是否合法
    ///
    /// UniqueOrUpdate -> DuplicateSkipped 对应远端去重命中 skip 策略
    pub fn can_transition_to(&self, next: RecordState) -> bool {
        use RecordState::*;
        matches!(
            (self, next),
            (Pending, Valid)
                | (Pending, Invalid)
                | (Valid, DuplicateSkipped)
                | (Valid, UniqueOrUpdate)
                | (UniqueOrUpdate, DuplicateSkipped)
                | (UniqueOrUpdate, Imported)
                | (UniqueOrUpdate, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Pending => "PENDING",
            RecordState::Valid => "VALID",
            RecordState::UniqueOrUpdate => "UNIQUE_OR_UPDATE",
            RecordState::Invalid => "INVALID",
            RecordState::DuplicateSkipped => "DUPLICATE_SKIPPED",
            RecordState::Imported => "IMPORTED",
            RecordState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RecordState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RecordState::Pending),
            "VALID" => Ok(RecordState::Valid),
            "UNIQUE_OR_UPDATE" => Ok(RecordState::UniqueOrUpdate),
            "INVALID" => Ok(RecordState::Invalid),
            "DUPLICATE_SKIPPED" => Ok(RecordState::DuplicateSkipped),
            "IMPORTED" => Ok(RecordState::Imported),
            "FAILED" => Ok(RecordState::Failed),
            other => Err(format!("未知记录状态: {}", other)),
        }
    }
}

// ==========================================
// 去重策略 (Dedupe Strategy)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupeStrategy {
    #[default]
    Skip,   // 跳过重复
    Update, // 更新已有记录
    Create, // 照常创建
}

impl fmt::Display for DedupeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupeStrategy::Skip => write!(f, "skip"),
            DedupeStrategy::Update => write!(f, "update"),
            DedupeStrategy::Create => write!(f, "create"),
        }
    }
}

// ==========================================
// 写入动作 (Write Action)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAction {
    Create,
    Update,
}

impl WriteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteAction::Create => "create",
            WriteAction::Update => "update",
        }
    }
}

impl fmt::Display for WriteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WriteAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(WriteAction::Create),
            "update" => Ok(WriteAction::Update),
            other => Err(format!("未知写入动作: {}", other)),
        }
    }
}

// ==========================================
// 运行状态 (Run Status)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,     // 执行中
    Completed,   // 已完成
    Aborted,     // 致命错误中止
    Interrupted, // 人工停止，可续跑
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Aborted => "ABORTED",
            RunStatus::Interrupted => "INTERRUPTED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 账本后端 / 退避曲线
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Jsonl,
    Sqlite,
}

impl FromStr for LedgerBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "jsonl" => Ok(LedgerBackend::Jsonl),
            "sqlite" => Ok(LedgerBackend::Sqlite),
            other => Err(format!("未知账本后端: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffCurve {
    Constant,
    Linear,
    #[default]
    Exponential,
}

impl FromStr for BackoffCurve {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "constant" => Ok(BackoffCurve::Constant),
            "linear" => Ok(BackoffCurve::Linear),
            "exponential" => Ok(BackoffCurve::Exponential),
            other => Err(format!("未知退避曲线: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(RecordState::Invalid.is_terminal());
        assert!(RecordState::DuplicateSkipped.is_terminal());
        assert!(RecordState::Imported.is_terminal());
        assert!(RecordState::Failed.is_terminal());
        assert!(!RecordState::Pending.is_terminal());
        assert!(!RecordState::Valid.is_terminal());
        assert!(!RecordState::UniqueOrUpdate.is_terminal());
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        let all = [
            RecordState::Pending,
            RecordState::Valid,
            RecordState::UniqueOrUpdate,
            RecordState::Invalid,
            RecordState::DuplicateSkipped,
            RecordState::Imported,
            RecordState::Failed,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all.iter() {
                assert!(!from.can_transition_to(*to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_lifecycle_edges() {
        assert!(RecordState::Pending.can_transition_to(RecordState::Valid));
        assert!(RecordState::Valid.can_transition_to(RecordState::UniqueOrUpdate));
        assert!(RecordState::UniqueOrUpdate.can_transition_to(RecordState::Imported));
        assert!(!RecordState::Pending.can_transition_to(RecordState::Imported));
        assert!(!RecordState::Valid.can_transition_to(RecordState::Failed));
    }

    #[test]
    fn test_state_string_roundtrip_matches_serde() {
        let json = serde_json::to_string(&RecordState::DuplicateSkipped).unwrap();
        assert_eq!(json, "\"DUPLICATE_SKIPPED\"");
        assert_eq!(
            "DUPLICATE_SKIPPED".parse::<RecordState>().unwrap(),
            RecordState::DuplicateSkipped
        );
        assert!("nope".parse::<RecordState>().is_err());
    }

    #[test]
    fn test_strategy_default_is_skip() {
        assert_eq!(DedupeStrategy::default(), DedupeStrategy::Skip);
        let s: DedupeStrategy = serde_json::from_str("\"update\"").unwrap();
        assert_eq!(s, DedupeStrategy::Update);
    }
}
