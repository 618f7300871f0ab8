// ==========================================
// 批量迁移引擎 - 去重器
// ==========================================
// 第一层: 本次运行内（按模型记录首条出现的去重键）
// 第二层: 远端已有记录（每批写入前分块查询）
// 红线: 远端查询失败时相关记录直接失败，不做未经检查的创建
// ==========================================

use crate::config::engine_config::EngineConfig;
use crate::domain::record::{key_component_text, DedupeKey, MigrationRecord, SourceIdentity, WriteIntent};
use crate::domain::schema::DedupeConfig;
use crate::domain::types::{DedupeStrategy, RecordState, RemoteId};
use crate::engine::error::EngineResult;
use crate::engine::retry::{run_with_retry, RetryPolicy};
use crate::remote::{KeyPredicate, RemoteService};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

// ==========================================
// 第一层: 运行内去重
// ==========================================
#[derive(Debug, Default)]
pub struct Deduplicator {
    /// model -> 去重键 -> 首条记录
    seen: HashMap<String, HashMap<DedupeKey, SourceIdentity>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记去重键；已被其他记录占用时返回首条记录标识
    pub fn register(
        &mut self,
        model: &str,
        key: &DedupeKey,
        identity: &SourceIdentity,
    ) -> Option<SourceIdentity> {
        let keys = self.seen.entry(model.to_string()).or_default();
        match keys.get(key) {
            Some(first) if first != identity => Some(first.clone()),
            Some(_) => None,
            None => {
                keys.insert(key.clone(), identity.clone());
                None
            }
        }
    }

    pub fn leader_of(&self, model: &str, key: &DedupeKey) -> Option<&SourceIdentity> {
        self.seen.get(model).and_then(|keys| keys.get(key))
    }

    /// 对 VALID 记录做运行内去重
    ///
    /// skip -> DUPLICATE_SKIPPED；update -> 跟随首条记录更新；create -> 不处理
    pub fn check_batch(&mut self, record: &mut MigrationRecord, cfg: &DedupeConfig) -> EngineResult<()> {
        if !cfg.match_batch || record.state != RecordState::Valid {
            return Ok(());
        }
        let Some(key) = record.dedupe_key.clone() else {
            return Ok(());
        };
        let Some(leader) = self.register(&record.model, &key, &record.identity) else {
            return Ok(());
        };

        match cfg.strategy {
            DedupeStrategy::Skip => {
                record.error = Some(format!("与 {} 重复（运行内）", leader));
                record.transition(RecordState::DuplicateSkipped)?;
            }
            DedupeStrategy::Update => {
                record.intent = WriteIntent::UpdateLeader(leader);
            }
            DedupeStrategy::Create => {}
        }
        Ok(())
    }
}

// ==========================================
// 第二层: 远端已有记录
// ==========================================

/// 远端查询参数
#[derive(Debug, Clone)]
pub struct LookupSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl LookupSettings {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            batch_size: cfg.lookup_batch_size.max(1),
            concurrency: cfg.lookup_concurrency.max(1),
            retry: RetryPolicy::from_config(cfg),
        }
    }
}

/// 一批远端去重的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteResolution {
    pub lookups: usize,
    pub matched: usize,
    pub failed: usize,
}

fn key_tuple(record: &MigrationRecord, cfg: &DedupeConfig) -> BTreeMap<String, String> {
    cfg.keys
        .iter()
        .filter_map(|field| {
            let text = record.values.get(field).and_then(key_component_text)?;
            let text = if cfg.case_sensitive { text } else { text.to_lowercase() };
            Some((field.clone(), text))
        })
        .collect()
}

/// 对一批待写入记录做远端去重
///
/// 只查询意图为 Create 且有去重键的记录；多个远端命中取最小 ID。
/// 致命错误原样返回（由调用方中止运行），其他查询失败使相关记录 FAILED。
pub async fn resolve_remote(
    remote: &dyn RemoteService,
    model: &str,
    cfg: &DedupeConfig,
    records: &mut [MigrationRecord],
    settings: &LookupSettings,
) -> EngineResult<RemoteResolution> {
    let mut resolution = RemoteResolution::default();
    if cfg.strategy == DedupeStrategy::Create || !cfg.match_remote || !remote.supports_search() {
        return Ok(resolution);
    }

    let mut seen = HashSet::new();
    let mut wanted: Vec<(DedupeKey, BTreeMap<String, String>)> = Vec::new();
    for record in records.iter() {
        if record.state != RecordState::UniqueOrUpdate || record.intent != WriteIntent::Create {
            continue;
        }
        if let Some(key) = &record.dedupe_key {
            if seen.insert(key.clone()) {
                wanted.push((key.clone(), key_tuple(record, cfg)));
            }
        }
    }
    if wanted.is_empty() {
        return Ok(resolution);
    }

    let fields = cfg.keys.as_slice();
    let lookups = wanted.chunks(settings.batch_size).map(|chunk| {
        let predicate = KeyPredicate {
            fields: cfg.keys.clone(),
            case_sensitive: cfg.case_sensitive,
            tuples: chunk.iter().map(|(_, tuple)| tuple.clone()).collect(),
        };
        let keys: HashSet<DedupeKey> = chunk.iter().map(|(key, _)| key.clone()).collect();
        async move {
            let predicate = &predicate;
            let result = run_with_retry(&settings.retry, "search", move || {
                remote.search(model, predicate, fields)
            })
            .await;
            (keys, result)
        }
    });
    let results: Vec<_> = stream::iter(lookups)
        .buffer_unordered(settings.concurrency)
        .collect()
        .await;

    let mut matches: HashMap<DedupeKey, RemoteId> = HashMap::new();
    let mut failures: HashMap<DedupeKey, String> = HashMap::new();
    for (keys, result) in results {
        resolution.lookups += 1;
        match result {
            Ok(found) => {
                for existing in found {
                    let Some(key) = DedupeKey::derive(&existing.values, &cfg.keys, cfg.case_sensitive)
                    else {
                        continue;
                    };
                    if keys.contains(&key) {
                        matches
                            .entry(key)
                            .and_modify(|id| *id = (*id).min(existing.id))
                            .or_insert(existing.id);
                    }
                }
            }
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                warn!(model, keys = keys.len(), error = %err, "远端去重查询失败，相关记录标记失败");
                for key in keys {
                    failures.insert(key, err.to_string());
                }
            }
        }
    }

    for record in records.iter_mut() {
        if record.state != RecordState::UniqueOrUpdate || record.intent != WriteIntent::Create {
            continue;
        }
        let Some(key) = record.dedupe_key.clone() else {
            continue;
        };

        if let Some(reason) = failures.get(&key) {
            record.fail(format!("远端去重查询失败: {}", reason))?;
            resolution.failed += 1;
            continue;
        }

        if let Some(id) = matches.get(&key).copied() {
            resolution.matched += 1;
            match cfg.strategy {
                DedupeStrategy::Skip => {
                    record.remote_id = Some(id);
                    record.error = Some(format!("远端已存在记录 id={}", id));
                    record.transition(RecordState::DuplicateSkipped)?;
                }
                DedupeStrategy::Update => record.intent = WriteIntent::Update(id),
                DedupeStrategy::Create => {}
            }
        }
    }

    debug!(
        model,
        lookups = resolution.lookups,
        matched = resolution.matched,
        failed = resolution.failed,
        "远端去重完成"
    );
    Ok(resolution)
}
