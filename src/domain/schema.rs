// ==========================================
// 批量迁移引擎 - 模型校验 Schema
// ==========================================
// 每个目标模型一份，数据驱动，以模型名为键
// 新增模型只需新增配置，不需要新增代码
// ==========================================

use crate::domain::record::FieldValues;
use crate::domain::types::DedupeStrategy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_MODEL_PRIORITY: i32 = 100;

fn default_true() -> bool {
    true
}

fn default_priority() -> i32 {
    DEFAULT_MODEL_PRIORITY
}

/// 字段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    Email,
    Phone,
    Url,
}

/// 单字段规则
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldRule {
    pub required: bool,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
}

/// 字段级转换步骤（按声明顺序执行）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformStep {
    pub field: String,
    pub transform: String,
}

/// 去重配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupeConfig {
    pub keys: Vec<String>,
    #[serde(default)]
    pub strategy: DedupeStrategy,
    #[serde(default)]
    pub case_sensitive: bool,
    /// 本次运行内去重
    #[serde(default = "default_true")]
    pub match_batch: bool,
    /// 远端已有记录去重
    #[serde(default = "default_true")]
    pub match_remote: bool,
}

/// 引用字段规则：文本值按目标模型的查找字段解析为远端 ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRule {
    pub model: String,
    pub search_field: String,
}

// ==========================================
// ValidationSchema - 模型 Schema
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSchema {
    pub model: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 源文件路径（相对计划文件目录）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// 源列名 -> 字段名
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub skip_fields: Vec<String>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldRule>,
    #[serde(default)]
    pub defaults: FieldValues,
    #[serde(default)]
    pub transforms: Vec<TransformStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe: Option<DedupeConfig>,
    /// 字段名 -> 引用规则
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub references: BTreeMap<String, ReferenceRule>,
}

impl ValidationSchema {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            priority: DEFAULT_MODEL_PRIORITY,
            enabled: true,
            source: None,
            mapping: BTreeMap::new(),
            skip_fields: Vec::new(),
            required: Vec::new(),
            fields: BTreeMap::new(),
            defaults: FieldValues::new(),
            transforms: Vec::new(),
            dedupe: None,
            references: BTreeMap::new(),
        }
    }

    pub fn is_required(&self, field: &str) -> bool {
        self.required.iter().any(|f| f == field)
            || self.fields.get(field).map(|r| r.required).unwrap_or(false)
    }

    /// 所有需要检查的字段（必填列表 + 规则字段）
    pub fn checked_fields(&self) -> BTreeSet<&str> {
        self.required
            .iter()
            .map(String::as_str)
            .chain(self.fields.keys().map(String::as_str))
            .collect()
    }

    pub fn is_skipped(&self, field: &str) -> bool {
        self.skip_fields.iter().any(|f| f == field)
    }
}
