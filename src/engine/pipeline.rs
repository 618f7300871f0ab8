// ==========================================
// 批量迁移引擎 - 转换管线
// ==========================================
// 顺序:
// 0. 列映射 / 跳过字段 / 空白清理
// 1. 缺省值填充
// 2. 按声明顺序执行字段转换
// 3. 交给校验器
// 红线: 转换失败置空并记违规（fail-closed）
// ==========================================

use crate::config::error::{ConfigError, ConfigResult};
use crate::config::plan::MigrationPlan;
use crate::domain::record::{DedupeKey, FieldValues, MigrationRecord, SourceRow};
use crate::domain::schema::ValidationSchema;
use crate::domain::types::RecordState;
use crate::domain::validation::{ValidationError, ViolationCode};
use crate::engine::error::EngineResult;
use crate::engine::transform::{collapse_whitespace, TransformRegistry};
use crate::engine::validator::Validator;
use serde_json::Value;
use std::collections::HashSet;
use tracing::trace;

/// 管线输出
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutcome {
    pub values: FieldValues,
    pub errors: Vec<ValidationError>,
}

impl TransformOutcome {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct TransformPipeline {
    registry: TransformRegistry,
    validator: Validator,
}

impl TransformPipeline {
    pub fn new(plan: &MigrationPlan) -> ConfigResult<Self> {
        let registry = TransformRegistry::new(&plan.engine.default_country_code)?;
        Self::with_registry(plan, registry)
    }

    /// 使用带自定义转换的注册表构建；未知转换名在此处报错
    pub fn with_registry(plan: &MigrationPlan, registry: TransformRegistry) -> ConfigResult<Self> {
        for schema in &plan.models {
            for step in &schema.transforms {
                if !registry.contains(&step.transform) {
                    return Err(ConfigError::UnknownTransform {
                        model: schema.model.clone(),
                        field: step.field.clone(),
                        transform: step.transform.clone(),
                    });
                }
            }
        }

        Ok(Self {
            validator: Validator::new(plan)?,
            registry,
        })
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    /// 映射 + 清理 + 缺省 + 转换 + 校验
    pub fn apply(&self, raw: &FieldValues, schema: &ValidationSchema) -> TransformOutcome {
        let mut values = map_columns(raw, schema);

        for (field, default) in &schema.defaults {
            let missing = values.get(field).map(Value::is_null).unwrap_or(true);
            if missing {
                values.insert(field.clone(), default.clone());
            }
        }

        let mut errors = Vec::new();
        let mut failed_fields = HashSet::new();
        for step in &schema.transforms {
            let current = match values.get(&step.field) {
                Some(v) if !v.is_null() => v.clone(),
                _ => continue,
            };

            match self.registry.apply(&step.transform, &current) {
                Ok(next) => {
                    values.insert(step.field.clone(), next);
                }
                Err(err) => {
                    trace!(field = %step.field, transform = %step.transform, "转换失败，字段置空");
                    values.insert(step.field.clone(), Value::Null);
                    failed_fields.insert(step.field.clone());
                    errors.push(ValidationError::new(
                        &step.field,
                        ViolationCode::TransformFailed,
                        err.to_string(),
                        Some(err.value.clone()),
                    ));
                }
            }
        }

        if let Err(violations) = self.validator.validate(&values, schema) {
            errors.extend(
                violations
                    .into_iter()
                    .filter(|v| !failed_fields.contains(&v.field)),
            );
        }

        TransformOutcome { values, errors }
    }

    /// 源行 -> 迁移记录（VALID 或 INVALID）
    pub fn prepare(&self, row: &SourceRow, schema: &ValidationSchema) -> EngineResult<MigrationRecord> {
        let mut record = MigrationRecord::pending(row);
        let outcome = self.apply(&row.fields, schema);
        record.values = outcome.values;

        if outcome.errors.is_empty() {
            record.dedupe_key = schema
                .dedupe
                .as_ref()
                .and_then(|d| DedupeKey::derive(&record.values, &d.keys, d.case_sensitive));
            record.transition(RecordState::Valid)?;
        } else {
            record.errors = outcome.errors;
            record.transition(RecordState::Invalid)?;
        }
        Ok(record)
    }
}

/// 列映射 / 跳过字段 / 空白清理（空白串 -> Null）
fn map_columns(raw: &FieldValues, schema: &ValidationSchema) -> FieldValues {
    let mut values = FieldValues::new();
    for (column, value) in raw {
        if schema.is_skipped(column) {
            continue;
        }
        let field = schema.mapping.get(column).unwrap_or(column);
        if schema.is_skipped(field) {
            continue;
        }

        let cleaned = match value {
            Value::String(s) => {
                let collapsed = collapse_whitespace(s);
                if collapsed.is_empty() {
                    Value::Null
                } else {
                    Value::String(collapsed)
                }
            }
            other => other.clone(),
        };

        // 多列映射到同一字段时，保留第一个非空值
        let occupied = values.get(field).map(|v| !v.is_null()).unwrap_or(false);
        if !occupied {
            values.insert(field.clone(), cleaned);
        }
    }
    values
}
