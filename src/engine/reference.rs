// ==========================================
// 批量迁移引擎 - 引用解析
// ==========================================
// 引用字段的文本值替换为目标模型记录的远端 ID
// 查找顺序: 运行内缓存（本次运行已导入的记录）-> 远端查询
// 红线: 解析不到的引用使记录 FAILED，不写入悬空引用
// ==========================================

use crate::config::plan::MigrationPlan;
use crate::domain::record::{key_component_text, FieldValues, MigrationRecord};
use crate::domain::schema::{ReferenceRule, ValidationSchema};
use crate::domain::types::{RecordState, RemoteId};
use crate::engine::deduplicator::LookupSettings;
use crate::engine::error::EngineResult;
use crate::engine::retry::run_with_retry;
use crate::remote::{KeyPredicate, RemoteService};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ReferenceKey {
    model: String,
    field: String,
    value: String,
}

impl ReferenceKey {
    fn new(model: &str, field: &str, text: &str) -> Self {
        Self {
            model: model.to_string(),
            field: field.to_string(),
            value: text.to_lowercase(),
        }
    }
}

/// 引用字段中需要解析的文本；数字视为已是远端 ID
fn reference_text(value: &Value) -> Option<String> {
    match value {
        Value::Number(_) => None,
        other => key_component_text(other),
    }
}

// ==========================================
// ReferenceCache - 运行内引用缓存
// ==========================================
#[derive(Debug, Default)]
pub struct ReferenceCache {
    /// 被引用模型 -> 计划中用到的查找字段
    targets: HashMap<String, BTreeSet<String>>,
    ids: HashMap<ReferenceKey, RemoteId>,
}

impl ReferenceCache {
    pub fn for_plan(plan: &MigrationPlan) -> Self {
        let mut targets: HashMap<String, BTreeSet<String>> = HashMap::new();
        for schema in plan.ordered_models() {
            for rule in schema.references.values() {
                targets
                    .entry(rule.model.clone())
                    .or_default()
                    .insert(rule.search_field.clone());
            }
        }
        Self {
            targets,
            ids: HashMap::new(),
        }
    }

    /// 该模型是否被其他字段引用
    pub fn is_target(&self, model: &str) -> bool {
        self.targets.contains_key(model)
    }

    /// 记下已导入记录（同一查找值先到先得）
    pub fn remember(&mut self, model: &str, values: &FieldValues, id: RemoteId) {
        let Some(fields) = self.targets.get(model) else {
            return;
        };
        for field in fields {
            if let Some(text) = values.get(field).and_then(key_component_text) {
                self.ids
                    .entry(ReferenceKey::new(model, field, &text))
                    .or_insert(id);
            }
        }
    }

    pub fn get(&self, rule: &ReferenceRule, text: &str) -> Option<RemoteId> {
        self.ids
            .get(&ReferenceKey::new(&rule.model, &rule.search_field, text))
            .copied()
    }

    fn insert(&mut self, key: ReferenceKey, id: RemoteId) {
        self.ids
            .entry(key)
            .and_modify(|existing| *existing = (*existing).min(id))
            .or_insert(id);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// 一批引用解析的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceResolution {
    pub lookups: usize,
    pub resolved: usize,
    pub failed: usize,
}

/// 解析一批待写入记录的引用字段
///
/// 缓存未命中的查找值去重后并发查询远端，多条命中取最小 ID。
/// 致命错误原样返回；查不到或查询失败的记录置空该字段并标记 FAILED。
pub async fn resolve_references(
    remote: &dyn RemoteService,
    schema: &ValidationSchema,
    records: &mut [MigrationRecord],
    cache: &mut ReferenceCache,
    settings: &LookupSettings,
) -> EngineResult<ReferenceResolution> {
    let mut resolution = ReferenceResolution::default();
    if schema.references.is_empty() {
        return Ok(resolution);
    }

    let mut misses: BTreeMap<ReferenceKey, String> = BTreeMap::new();
    for record in records.iter() {
        if record.state != RecordState::UniqueOrUpdate {
            continue;
        }
        for (field, rule) in &schema.references {
            let Some(text) = record.values.get(field).and_then(reference_text) else {
                continue;
            };
            if cache.get(rule, &text).is_none() {
                misses
                    .entry(ReferenceKey::new(&rule.model, &rule.search_field, &text))
                    .or_insert(text);
            }
        }
    }

    let mut failures: HashMap<ReferenceKey, String> = HashMap::new();
    if !misses.is_empty() && remote.supports_search() {
        let lookups = misses.iter().map(|(key, text)| {
            let predicate = KeyPredicate {
                fields: vec![key.field.clone()],
                case_sensitive: false,
                tuples: vec![BTreeMap::from([(key.field.clone(), text.clone())])],
            };
            let fields = vec![key.field.clone()];
            async move {
                let (predicate, fields) = (&predicate, fields.as_slice());
                let result = run_with_retry(&settings.retry, "reference", move || {
                    remote.search(&key.model, predicate, fields)
                })
                .await;
                (key.clone(), result)
            }
        });
        let results: Vec<_> = stream::iter(lookups)
            .buffer_unordered(settings.concurrency)
            .collect()
            .await;

        for (key, result) in results {
            resolution.lookups += 1;
            match result {
                Ok(found) => {
                    if let Some(id) = found.iter().map(|r| r.id).min() {
                        cache.insert(key, id);
                    }
                }
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    warn!(model = %key.model, value = %key.value, error = %err, "引用查询失败，相关记录标记失败");
                    failures.insert(key, err.to_string());
                }
            }
        }
    }

    for record in records.iter_mut() {
        if record.state != RecordState::UniqueOrUpdate {
            continue;
        }
        let mut problems = Vec::new();
        for (field, rule) in &schema.references {
            let Some(text) = record.values.get(field).and_then(reference_text) else {
                continue;
            };
            match cache.get(rule, &text) {
                Some(id) => {
                    record.values.insert(field.clone(), Value::from(id));
                }
                None => {
                    let key = ReferenceKey::new(&rule.model, &rule.search_field, &text);
                    let reason = match failures.get(&key) {
                        Some(err) => format!("引用查询失败: {}", err),
                        None => "未找到".to_string(),
                    };
                    problems.push(format!(
                        "引用 {} -> {}.{}='{}' {}",
                        field, rule.model, rule.search_field, text, reason
                    ));
                    record.values.insert(field.clone(), Value::Null);
                }
            }
        }

        if problems.is_empty() {
            resolution.resolved += 1;
        } else {
            record.fail(problems.join("; "))?;
            resolution.failed += 1;
        }
    }

    debug!(
        model = %schema.model,
        lookups = resolution.lookups,
        resolved = resolution.resolved,
        failed = resolution.failed,
        "引用解析完成"
    );
    Ok(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::{SourceIdentity, SourceRow};
    use crate::engine::error::{EngineError, RemoteError};
    use crate::engine::retry::RetryPolicy;
    use crate::remote::{FaultRule, InMemoryRemote, RemoteOp};
    use serde_json::json;

    fn schema() -> ValidationSchema {
        let mut schema = ValidationSchema::new("crm.lead");
        schema.references.insert(
            "partner_id".to_string(),
            ReferenceRule {
                model: "res.partner".to_string(),
                search_field: "name".to_string(),
            },
        );
        schema
    }

    fn plan() -> MigrationPlan {
        MigrationPlan::from_json_str(
            r#"{"name": "leads", "models": [
                {"model": "res.partner"},
                {"model": "crm.lead", "references": {"partner_id": {"model": "res.partner", "search_field": "name"}}}
            ]}"#,
        )
        .unwrap()
    }

    fn lead(row: usize, partner: Value) -> MigrationRecord {
        let fields: FieldValues = [("partner_id".to_string(), partner)].into_iter().collect();
        let source = SourceRow::new("crm.lead", SourceIdentity::new("l.csv@1", row), row, fields.clone());
        let mut record = MigrationRecord::pending(&source);
        record.values = fields;
        record.state = RecordState::UniqueOrUpdate;
        record
    }

    fn settings() -> LookupSettings {
        LookupSettings {
            batch_size: 10,
            concurrency: 2,
            retry: RetryPolicy::immediate(2),
        }
    }

    fn name(value: &str) -> FieldValues {
        [("name".to_string(), json!(value))].into_iter().collect()
    }

    #[test]
    fn test_cache_remembers_only_referenced_models() {
        let mut cache = ReferenceCache::for_plan(&plan());
        assert!(cache.is_target("res.partner"));
        assert!(!cache.is_target("crm.lead"));

        cache.remember("crm.lead", &name("Deal"), 9);
        assert!(cache.is_empty());

        cache.remember("res.partner", &name(" Acme "), 3);
        cache.remember("res.partner", &name("acme"), 4);
        let rule = &schema().references["partner_id"];
        assert_eq!(cache.get(rule, "ACME"), Some(3));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_makes_no_remote_call() {
        let remote = InMemoryRemote::new();
        let mut cache = ReferenceCache::for_plan(&plan());
        cache.remember("res.partner", &name("Acme"), 7);

        let mut records = vec![lead(1, json!("acme")), lead(2, json!(12)), lead(3, Value::Null)];
        let resolution = resolve_references(&remote, &schema(), &mut records, &mut cache, &settings())
            .await
            .unwrap();

        assert_eq!(resolution.resolved, 3);
        assert_eq!(records[0].values["partner_id"], json!(7));
        assert_eq!(records[1].values["partner_id"], json!(12));
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_remote_lookup_fills_cache_and_unknown_fails() {
        let remote = InMemoryRemote::new();
        remote.seed("res.partner", name("Globex"));
        let low = remote.seed("res.partner", name("Initech"));
        remote.seed("res.partner", name("INITECH"));
        let mut cache = ReferenceCache::for_plan(&plan());

        let mut records = vec![
            lead(1, json!("initech")),
            lead(2, json!("Initech ")),
            lead(3, json!("Ghost")),
        ];
        let resolution = resolve_references(&remote, &schema(), &mut records, &mut cache, &settings())
            .await
            .unwrap();

        assert_eq!(resolution.lookups, 2);
        assert_eq!(resolution.failed, 1);
        assert_eq!(records[0].values["partner_id"], json!(low));
        assert_eq!(records[1].values["partner_id"], json!(low));
        assert_eq!(records[2].state, RecordState::Failed);
        assert_eq!(records[2].values["partner_id"], Value::Null);
        assert!(records[2].error.as_deref().unwrap_or("").contains("Ghost"));
        assert_eq!(remote.count(RemoteOp::Search), 2);
    }

    #[tokio::test]
    async fn test_offline_remote_fails_unresolved_references() {
        let remote = InMemoryRemote::new().without_search();
        let mut cache = ReferenceCache::for_plan(&plan());
        let mut records = vec![lead(1, json!("Acme"))];

        resolve_references(&remote, &schema(), &mut records, &mut cache, &settings())
            .await
            .unwrap();
        assert_eq!(records[0].state, RecordState::Failed);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reference_lookup_errors() {
        let remote = InMemoryRemote::new();
        remote.inject(FaultRule::on(RemoteOp::Search, RemoteError::Timeout("slow".into())));
        let mut cache = ReferenceCache::for_plan(&plan());
        let mut records = vec![lead(1, json!("Acme"))];
        resolve_references(&remote, &schema(), &mut records, &mut cache, &settings())
            .await
            .unwrap();
        assert_eq!(records[0].state, RecordState::Failed);
        assert!(records[0].error.as_deref().unwrap_or("").contains("引用查询失败"));

        let fatal = InMemoryRemote::new();
        fatal.inject(FaultRule::on(
            RemoteOp::Search,
            RemoteError::AuthenticationFailed("expired".into()),
        ));
        let mut records = vec![lead(1, json!("Acme"))];
        let err = resolve_references(&fatal, &schema(), &mut records, &mut cache, &settings())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Remote(RemoteError::AuthenticationFailed(_))));
        assert_eq!(records[0].state, RecordState::UniqueOrUpdate);
    }
}
