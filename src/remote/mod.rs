// ==========================================
// 批量迁移引擎 - 远端服务契约
// ==========================================
// 只定义调用契约：create / update / search
// 传输与认证由外部实现，错误统一映射为 RemoteError
// ==========================================

pub mod memory;

use crate::domain::record::{key_component_text, FieldValues};
use crate::domain::types::RemoteId;
use crate::engine::error::RemoteError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use memory::{FaultRule, InMemoryRemote, RemoteCall, RemoteOp};

/// 远端返回的记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: RemoteId,
    pub values: FieldValues,
}

/// 去重查询条件：任一元组的全部字段相等即命中
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPredicate {
    pub fields: Vec<String>,
    pub case_sensitive: bool,
    pub tuples: Vec<BTreeMap<String, String>>,
}

impl KeyPredicate {
    /// 按与去重键相同的规则比较（去空白，非大小写敏感时忽略大小写）
    pub fn matches(&self, values: &FieldValues) -> bool {
        self.tuples.iter().any(|tuple| {
            !tuple.is_empty()
                && tuple.iter().all(|(field, wanted)| {
                    match values.get(field).and_then(key_component_text) {
                        Some(actual) if self.case_sensitive => actual == *wanted,
                        Some(actual) => actual.to_lowercase() == wanted.to_lowercase(),
                        None => false,
                    }
                })
        })
    }
}

#[async_trait]
pub trait RemoteService: Send + Sync {
    /// 创建记录，返回远端 ID
    async fn create(&self, model: &str, values: &FieldValues) -> Result<RemoteId, RemoteError>;

    /// 更新已有记录
    async fn update(&self, model: &str, id: RemoteId, values: &FieldValues) -> Result<(), RemoteError>;

    /// 按键查询已有记录
    async fn search(
        &self,
        model: &str,
        predicate: &KeyPredicate,
        fields: &[String],
    ) -> Result<Vec<RemoteRecord>, RemoteError>;

    /// 离线模式下没有查询能力，远端去重整体跳过
    fn supports_search(&self) -> bool {
        true
    }
}
