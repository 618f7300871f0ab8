// ==========================================
// 批量迁移引擎 - 内存远端
// ==========================================
// 用途: 演练运行 / 测试
// 支持: 调用记录、故障注入、按字段模拟延迟、关闭查询能力
// ==========================================

use crate::domain::record::{key_component_text, FieldValues};
use crate::domain::types::RemoteId;
use crate::engine::error::RemoteError;
use crate::remote::{KeyPredicate, RemoteRecord, RemoteService};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    Create,
    Update,
    Search,
}

/// 调用记录（每次尝试都记一次）
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Create { model: String, values: FieldValues },
    Update { model: String, id: RemoteId, values: FieldValues },
    Search { model: String, tuples: usize },
}

impl RemoteCall {
    pub fn op(&self) -> RemoteOp {
        match self {
            RemoteCall::Create { .. } => RemoteOp::Create,
            RemoteCall::Update { .. } => RemoteOp::Update,
            RemoteCall::Search { .. } => RemoteOp::Search,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            RemoteCall::Create { model, .. }
            | RemoteCall::Update { model, .. }
            | RemoteCall::Search { model, .. } => model,
        }
    }
}

// ==========================================
// FaultRule - 故障注入规则
// ==========================================
#[derive(Debug, Clone)]
pub struct FaultRule {
    op: RemoteOp,
    model: Option<String>,
    when_field: Option<(String, String)>,
    error: RemoteError,
    /// None 表示一直生效
    remaining: Option<u32>,
}

impl FaultRule {
    pub fn on(op: RemoteOp, error: RemoteError) -> Self {
        Self {
            op,
            model: None,
            when_field: None,
            error,
            remaining: None,
        }
    }

    pub fn for_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    /// 仅当字段值（文本形式）相等时触发
    pub fn when_field(mut self, field: &str, value: &str) -> Self {
        self.when_field = Some((field.to_string(), value.to_string()));
        self
    }

    /// 触发 n 次后失效
    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, op: RemoteOp, model: &str, values: &[&FieldValues]) -> bool {
        if self.op != op || self.remaining == Some(0) {
            return false;
        }
        if let Some(m) = &self.model {
            if m != model {
                return false;
            }
        }
        match &self.when_field {
            None => true,
            Some((field, wanted)) => values.iter().any(|v| {
                v.get(field)
                    .and_then(key_component_text)
                    .map(|actual| actual.eq_ignore_ascii_case(wanted))
                    .unwrap_or(false)
            }),
        }
    }
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, BTreeMap<RemoteId, FieldValues>>,
    next_id: RemoteId,
    calls: Vec<RemoteCall>,
    faults: Vec<FaultRule>,
}

impl MemoryState {
    fn take_fault(&mut self, op: RemoteOp, model: &str, values: &[&FieldValues]) -> Option<RemoteError> {
        let rule = self.faults.iter_mut().find(|r| r.matches(op, model, values))?;
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        Some(rule.error.clone())
    }
}

// ==========================================
// InMemoryRemote
// ==========================================
pub struct InMemoryRemote {
    state: Mutex<MemoryState>,
    known_models: Option<HashSet<String>>,
    search_enabled: bool,
    latency_field: Option<String>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                next_id: 1,
                ..MemoryState::default()
            }),
            known_models: None,
            search_enabled: true,
            latency_field: None,
        }
    }

    /// 限定已知模型，其余模型返回 UnknownModel（致命）
    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.known_models = Some(models.iter().map(|m| m.to_string()).collect());
        self
    }

    /// 模拟离线模式：不提供查询能力
    pub fn without_search(mut self) -> Self {
        self.search_enabled = false;
        self
    }

    /// 写入前按该字段的毫秒数等待
    pub fn with_latency_field(mut self, field: &str) -> Self {
        self.latency_field = Some(field.to_string());
        self
    }

    pub fn inject(&self, rule: FaultRule) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.push(rule);
        }
    }

    /// 预置已有远端记录
    pub fn seed(&self, model: &str, values: FieldValues) -> RemoteId {
        match self.state.lock() {
            Ok(mut state) => {
                let id = state.next_id;
                state.next_id += 1;
                state.records.entry(model.to_string()).or_default().insert(id, values);
                id
            }
            Err(_) => 0,
        }
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn count(&self, op: RemoteOp) -> usize {
        self.calls().iter().filter(|c| c.op() == op).count()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.calls.clear();
        }
    }

    pub fn records(&self, model: &str) -> Vec<RemoteRecord> {
        self.state
            .lock()
            .map(|s| {
                s.records
                    .get(model)
                    .map(|m| {
                        m.iter()
                            .map(|(id, values)| RemoteRecord {
                                id: *id,
                                values: values.clone(),
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, RemoteError> {
        self.state
            .lock()
            .map_err(|e| RemoteError::Unreachable(format!("锁获取失败: {}", e)))
    }

    fn check_model(&self, model: &str) -> Result<(), RemoteError> {
        match &self.known_models {
            Some(models) if !models.contains(model) => Err(RemoteError::UnknownModel(model.to_string())),
            _ => Ok(()),
        }
    }

    async fn simulate_latency(&self, values: &FieldValues) {
        let Some(field) = &self.latency_field else {
            return;
        };
        let millis = values
            .get(field)
            .and_then(key_component_text)
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(ms) = millis {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[async_trait]
impl RemoteService for InMemoryRemote {
    async fn create(&self, model: &str, values: &FieldValues) -> Result<RemoteId, RemoteError> {
        self.simulate_latency(values).await;

        let mut state = self.lock()?;
        state.calls.push(RemoteCall::Create {
            model: model.to_string(),
            values: values.clone(),
        });
        if let Some(err) = state.take_fault(RemoteOp::Create, model, &[values]) {
            return Err(err);
        }
        self.check_model(model)?;

        let id = state.next_id;
        state.next_id += 1;
        state
            .records
            .entry(model.to_string())
            .or_default()
            .insert(id, values.clone());
        Ok(id)
    }

    async fn update(&self, model: &str, id: RemoteId, values: &FieldValues) -> Result<(), RemoteError> {
        self.simulate_latency(values).await;

        let mut state = self.lock()?;
        state.calls.push(RemoteCall::Update {
            model: model.to_string(),
            id,
            values: values.clone(),
        });
        if let Some(err) = state.take_fault(RemoteOp::Update, model, &[values]) {
            return Err(err);
        }
        self.check_model(model)?;

        let existing = state
            .records
            .get_mut(model)
            .and_then(|m| m.get_mut(&id))
            .ok_or_else(|| RemoteError::RecordNotFound {
                model: model.to_string(),
                remote_id: id,
            })?;
        for (field, value) in values {
            existing.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn search(
        &self,
        model: &str,
        predicate: &KeyPredicate,
        fields: &[String],
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        let mut state = self.lock()?;
        state.calls.push(RemoteCall::Search {
            model: model.to_string(),
            tuples: predicate.tuples.len(),
        });

        let tuple_values: Vec<FieldValues> = predicate
            .tuples
            .iter()
            .map(|t| {
                t.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect()
            })
            .collect();
        let refs: Vec<&FieldValues> = tuple_values.iter().collect();
        if let Some(err) = state.take_fault(RemoteOp::Search, model, &refs) {
            return Err(err);
        }
        self.check_model(model)?;

        let found = state
            .records
            .get(model)
            .map(|records| {
                records
                    .iter()
                    .filter(|(_, values)| predicate.matches(values))
                    .map(|(id, values)| RemoteRecord {
                        id: *id,
                        values: if fields.is_empty() {
                            values.clone()
                        } else {
                            values
                                .iter()
                                .filter(|(k, _)| fields.contains(k))
                                .map(|(k, v)| (k.clone(), v.clone()))
                                .collect()
                        },
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(found)
    }

    fn supports_search(&self) -> bool {
        self.search_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(pairs: &[(&str, &str)]) -> FieldValues {
        pairs.iter().map(|(k, v)| (k.to_string(), json!(v))).collect()
    }

    #[tokio::test]
    async fn test_create_update_search() {
        let remote = InMemoryRemote::new();
        let id = remote.create("res.partner", &values(&[("name", "Acme")])).await.unwrap();
        remote
            .update("res.partner", id, &values(&[("city", "Paris")]))
            .await
            .unwrap();

        let predicate = KeyPredicate {
            fields: vec!["name".into()],
            case_sensitive: false,
            tuples: vec![BTreeMap::from([("name".to_string(), "acme".to_string())])],
        };
        let found = remote.search("res.partner", &predicate, &[]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
        assert_eq!(found[0].values["city"], json!("Paris"));
        assert_eq!(remote.count(RemoteOp::Create), 1);
        assert_eq!(remote.count(RemoteOp::Update), 1);
        assert_eq!(remote.count(RemoteOp::Search), 1);
    }

    #[tokio::test]
    async fn test_update_missing_record_is_permanent() {
        let remote = InMemoryRemote::new();
        let err = remote.update("m", 99, &values(&[])).await.unwrap_err();
        assert!(matches!(err, RemoteError::RecordNotFound { .. }));
    }

    #[tokio::test]
    async fn test_fault_rule_fires_limited_times() {
        let remote = InMemoryRemote::new();
        remote.inject(
            FaultRule::on(RemoteOp::Create, RemoteError::Timeout("slow".into()))
                .when_field("name", "Flaky")
                .times(1),
        );

        assert!(remote.create("m", &values(&[("name", "Flaky")])).await.is_err());
        assert!(remote.create("m", &values(&[("name", "Flaky")])).await.is_ok());
        assert!(remote.create("m", &values(&[("name", "Other")])).await.is_ok());
        assert_eq!(remote.count(RemoteOp::Create), 3);
        assert_eq!(remote.records("m").len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_model_is_fatal() {
        let remote = InMemoryRemote::new().with_models(&["res.partner"]);
        let err = remote.create("res.unknown", &values(&[])).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
