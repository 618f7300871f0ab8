// ==========================================
// 批量迁移引擎 - 迁移记录领域模型
// ==========================================
// 职责: 源行 / 迁移记录 / 去重键 / 写入意图
// 红线: 状态迁移只能经由 transition()，非法迁移直接拒绝
// ==========================================

use crate::domain::types::{RecordState, RemoteId, WriteAction};
use crate::domain::validation::{join_violations, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// 字段名 -> 值（有序，保证序列化和指纹稳定）
pub type FieldValues = BTreeMap<String, Value>;

// ==========================================
// SourceIdentity - 源记录稳定标识
// ==========================================
// 格式: "<文件标识>#<行号>"，同一输入多次运行结果一致
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceIdentity(String);

impl SourceIdentity {
    pub fn new(file_identity: &str, row_number: usize) -> Self {
        Self(format!("{}#{}", file_identity, row_number))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ==========================================
// SourceRow - 上游解析后的原始行
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    pub model: String,
    pub identity: SourceIdentity,
    pub row_number: usize,
    pub fields: FieldValues,
}

impl SourceRow {
    pub fn new(
        model: impl Into<String>,
        identity: SourceIdentity,
        row_number: usize,
        fields: FieldValues,
    ) -> Self {
        Self {
            model: model.into(),
            identity,
            row_number,
            fields,
        }
    }
}

// ==========================================
// DedupeKey - 归一化去重键
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupeKey(String);

impl DedupeKey {
    /// 由配置的键字段计算去重键
    ///
    /// 规则:
    /// - 空值字段不参与
    /// - 值去首尾空白，非大小写敏感时转小写
    /// - "field:value" 排序后以 "|" 拼接
    /// - 没有任何非空分量时返回 None（该记录不参与去重）
    pub fn derive(values: &FieldValues, key_fields: &[String], case_sensitive: bool) -> Option<Self> {
        let mut parts: Vec<String> = key_fields
            .iter()
            .filter_map(|field| {
                let text = values.get(field).and_then(key_component_text)?;
                let text = if case_sensitive { text } else { text.to_lowercase() };
                Some(format!("{}:{}", field, text))
            })
            .collect();

        if parts.is_empty() {
            return None;
        }

        parts.sort();
        Some(Self(parts.join("|")))
    }

    /// 从账本中已归一化的文本恢复
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 取字段值参与去重的文本形式（去空白，空值返回 None）
pub fn key_component_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

// ==========================================
// WriteIntent - 写入意图
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WriteIntent {
    #[default]
    Create,
    /// 更新已存在的远端记录
    Update(RemoteId),
    /// 批内重复（update 策略）: 更新首条记录最终得到的远端 ID
    UpdateLeader(SourceIdentity),
}

/// 非法状态迁移
#[derive(Error, Debug, Clone, PartialEq)]
#[error("无效的状态转换 (identity={identity}): from={from} to={to}")]
pub struct StateTransitionError {
    pub identity: String,
    pub from: RecordState,
    pub to: RecordState,
}

// ==========================================
// MigrationRecord - 引擎内的迁移记录
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRecord {
    pub identity: SourceIdentity,
    pub model: String,
    pub row_number: usize,
    pub raw: FieldValues,
    pub values: FieldValues,
    pub state: RecordState,
    pub dedupe_key: Option<DedupeKey>,
    pub intent: WriteIntent,
    pub remote_id: Option<RemoteId>,
    pub errors: Vec<ValidationError>,
    pub error: Option<String>,
    pub batch_seq: Option<u32>,
}

impl MigrationRecord {
    pub fn pending(row: &SourceRow) -> Self {
        Self {
            identity: row.identity.clone(),
            model: row.model.clone(),
            row_number: row.row_number,
            raw: row.fields.clone(),
            values: FieldValues::new(),
            state: RecordState::Pending,
            dedupe_key: None,
            intent: WriteIntent::Create,
            remote_id: None,
            errors: Vec::new(),
            error: None,
            batch_seq: None,
        }
    }

    /// 状态迁移（非法迁移返回错误，状态不变）
    pub fn transition(&mut self, next: RecordState) -> Result<(), StateTransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(StateTransitionError {
                identity: self.identity.to_string(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// 标记为失败并记录原因
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), StateTransitionError> {
        self.transition(RecordState::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }

    /// 写入动作（仅已导入记录有值）
    pub fn write_action(&self) -> Option<WriteAction> {
        if self.state != RecordState::Imported {
            return None;
        }
        match self.intent {
            WriteIntent::Create => Some(WriteAction::Create),
            WriteIntent::Update(_) | WriteIntent::UpdateLeader(_) => Some(WriteAction::Update),
        }
    }

    /// 账本中记录的错误信息
    pub fn error_message(&self) -> Option<String> {
        if !self.errors.is_empty() {
            Some(join_violations(&self.errors))
        } else {
            self.error.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(pairs: &[(&str, Value)]) -> FieldValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_dedupe_key_sorted_and_lowercased() {
        let v = values(&[("phone", json!(" +15550100 ")), ("name", json!("Acme Corp"))]);
        let key = DedupeKey::derive(&v, &keys(&["phone", "name"]), false).unwrap();
        assert_eq!(key.as_str(), "name:acme corp|phone:+15550100");
    }

    #[test]
    fn test_dedupe_key_case_sensitive() {
        let v = values(&[("name", json!("Acme"))]);
        let key = DedupeKey::derive(&v, &keys(&["name"]), true).unwrap();
        assert_eq!(key.as_str(), "name:Acme");
    }

    #[test]
    fn test_dedupe_key_skips_empty_components() {
        let v = values(&[("name", json!("Acme")), ("phone", json!("  ")), ("vat", Value::Null)]);
        let key = DedupeKey::derive(&v, &keys(&["name", "phone", "vat"]), false).unwrap();
        assert_eq!(key.as_str(), "name:acme");
    }

    #[test]
    fn test_dedupe_key_none_when_all_empty() {
        let v = values(&[("name", json!(""))]);
        assert!(DedupeKey::derive(&v, &keys(&["name", "phone"]), false).is_none());
    }

    #[test]
    fn test_transition_rejects_illegal_edge() {
        let row = SourceRow::new("res.partner", SourceIdentity::new("a.csv@x", 1), 1, FieldValues::new());
        let mut record = MigrationRecord::pending(&row);
        let err = record.transition(RecordState::Imported).unwrap_err();
        assert_eq!(err.from, RecordState::Pending);
        assert_eq!(record.state, RecordState::Pending);

        record.transition(RecordState::Valid).unwrap();
        record.transition(RecordState::UniqueOrUpdate).unwrap();
        record.fail("boom").unwrap();
        assert_eq!(record.error_message().as_deref(), Some("boom"));
        assert!(record.transition(RecordState::Imported).is_err());
    }

    #[test]
    fn test_write_action_follows_intent() {
        let row = SourceRow::new("m", SourceIdentity::new("f", 2), 2, FieldValues::new());
        let mut record = MigrationRecord::pending(&row);
        record.state = RecordState::Imported;
        assert_eq!(record.write_action(), Some(WriteAction::Create));
        record.intent = WriteIntent::Update(7);
        assert_eq!(record.write_action(), Some(WriteAction::Update));
    }
}
