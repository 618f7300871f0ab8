// ==========================================
// 批量迁移引擎 - 迁移计划
// ==========================================
// 一个计划 = 引擎参数 + 若干模型 Schema
// 计划指纹用于续跑时判断批次划分是否仍然成立
// ==========================================

use crate::config::engine_config::EngineConfig;
use crate::config::error::{ConfigError, ConfigResult};
use crate::domain::schema::ValidationSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub name: String,
    #[serde(default)]
    pub engine: EngineConfig,
    pub models: Vec<ValidationSchema>,
}

/// 参与指纹计算的部分（批次划分相关）
#[derive(Serialize)]
struct FingerprintView<'a> {
    name: &'a str,
    chunk_size: usize,
    models: &'a [ValidationSchema],
}

impl MigrationPlan {
    pub fn from_json_str(raw: &str) -> ConfigResult<Self> {
        let plan: MigrationPlan = serde_json::from_str(raw)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    /// 结构校验（正则与转换名由管线构建时校验）
    pub fn validate(&self) -> ConfigResult<()> {
        self.engine.validate()?;

        if self.models.is_empty() {
            return Err(ConfigError::InvalidPlan("计划中没有任何模型".to_string()));
        }

        let mut seen = HashSet::new();
        for schema in &self.models {
            if schema.model.trim().is_empty() {
                return Err(ConfigError::InvalidPlan("模型名不能为空".to_string()));
            }
            if !seen.insert(schema.model.as_str()) {
                return Err(ConfigError::InvalidPlan(format!("模型重复: {}", schema.model)));
            }
            if let Some(dedupe) = &schema.dedupe {
                if dedupe.keys.is_empty() {
                    return Err(ConfigError::InvalidPlan(format!(
                        "模型 {} 的去重键为空",
                        schema.model
                    )));
                }
            }
            for (field, rule) in &schema.references {
                if rule.model.trim().is_empty() || rule.search_field.trim().is_empty() {
                    return Err(ConfigError::InvalidPlan(format!(
                        "模型 {} 的引用字段 {} 缺少目标模型或查找字段",
                        schema.model, field
                    )));
                }
            }
        }
        Ok(())
    }

    /// 启用的模型，按优先级升序（同优先级保持声明顺序）
    pub fn ordered_models(&self) -> Vec<&ValidationSchema> {
        let mut models: Vec<&ValidationSchema> = self.models.iter().filter(|m| m.enabled).collect();
        models.sort_by_key(|m| m.priority);
        models
    }

    pub fn model(&self, name: &str) -> Option<&ValidationSchema> {
        self.models.iter().find(|m| m.model == name)
    }

    /// 计划指纹（SHA-256 十六进制）
    pub fn fingerprint(&self) -> String {
        let view = FingerprintView {
            name: &self.name,
            chunk_size: self.engine.chunk_size,
            models: &self.models,
        };
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}
