// ==========================================
// 批量迁移引擎 - 字段校验器
// ==========================================
// 职责: 按模型 Schema 校验单条记录
// 红线: 纯函数，无 I/O；收集全部违规而不是遇错即停
// ==========================================

use crate::config::error::{ConfigError, ConfigResult};
use crate::config::plan::MigrationPlan;
use crate::domain::record::FieldValues;
use crate::domain::schema::{FieldRule, FieldType, ValidationSchema};
use crate::domain::validation::{ValidationError, ViolationCode};
use crate::engine::transform::{display_text, EMAIL_PATTERN};
use chrono::NaiveDate;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

const URL_PATTERN: &str = r"^https?://[^\s]+$";
const MIN_PHONE_DIGITS: usize = 7;

pub struct Validator {
    email: Regex,
    url: Regex,
    /// (model, field) -> 编译后的 pattern
    patterns: HashMap<(String, String), Regex>,
}

impl Validator {
    /// 预编译计划中所有字段的 pattern
    pub fn new(plan: &MigrationPlan) -> ConfigResult<Self> {
        Self::for_schemas(&plan.models)
    }

    pub fn for_schemas(schemas: &[ValidationSchema]) -> ConfigResult<Self> {
        let builtin = |pattern: &str| {
            Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                model: "*".to_string(),
                field: "*".to_string(),
                message: e.to_string(),
            })
        };

        let mut patterns = HashMap::new();
        for schema in schemas {
            for (field, rule) in &schema.fields {
                if let Some(pattern) = &rule.pattern {
                    let regex = Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
                        model: schema.model.clone(),
                        field: field.clone(),
                        message: e.to_string(),
                    })?;
                    patterns.insert((schema.model.clone(), field.clone()), regex);
                }
            }
        }

        Ok(Self {
            email: builtin(EMAIL_PATTERN)?,
            url: builtin(URL_PATTERN)?,
            patterns,
        })
    }

    /// 校验一条记录，返回全部违规
    pub fn validate(
        &self,
        values: &FieldValues,
        schema: &ValidationSchema,
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        for field in schema.checked_fields() {
            let value = values.get(field).unwrap_or(&Value::Null);

            if is_blank(value) {
                if schema.is_required(field) {
                    errors.push(ValidationError::required_missing(field));
                }
                continue;
            }

            if let Some(rule) = schema.fields.get(field) {
                self.check_rule(&schema.model, field, value, rule, &mut errors);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn check_rule(
        &self,
        model: &str,
        field: &str,
        value: &Value,
        rule: &FieldRule,
        errors: &mut Vec<ValidationError>,
    ) {
        let text = display_text(value);

        if let Some(field_type) = rule.field_type {
            if let Some(err) = self.check_type(field, value, &text, field_type) {
                errors.push(err);
                return;
            }
        }

        if let Some(pattern) = &rule.pattern {
            match self.patterns.get(&(model.to_string(), field.to_string())) {
                Some(regex) if regex.is_match(&text) => {}
                Some(_) => errors.push(ValidationError::new(
                    field,
                    ViolationCode::InvalidFormat,
                    format!("不匹配格式 {}", pattern),
                    Some(text.clone()),
                )),
                None => match Regex::new(pattern) {
                    Ok(regex) if regex.is_match(&text) => {}
                    _ => errors.push(ValidationError::new(
                        field,
                        ViolationCode::InvalidFormat,
                        format!("不匹配格式 {}", pattern),
                        Some(text.clone()),
                    )),
                },
            }
        }

        if rule.min.is_some() || rule.max.is_some() {
            match as_number(value) {
                Some(n) => {
                    let below = rule.min.map(|min| n < min).unwrap_or(false);
                    let above = rule.max.map(|max| n > max).unwrap_or(false);
                    if below || above {
                        errors.push(ValidationError::new(
                            field,
                            ViolationCode::OutOfRange,
                            format!("超出范围 [{:?}, {:?}]", rule.min, rule.max),
                            Some(text.clone()),
                        ));
                    }
                }
                None => errors.push(ValidationError::new(
                    field,
                    ViolationCode::InvalidType,
                    "期望数值",
                    Some(text.clone()),
                )),
            }
        }

        if let Some(max_length) = rule.max_length {
            if text.chars().count() > max_length {
                errors.push(ValidationError::new(
                    field,
                    ViolationCode::TooLong,
                    format!("长度超过 {}", max_length),
                    Some(text.clone()),
                ));
            }
        }

        if let Some(choices) = &rule.choices {
            if !choices.iter().any(|c| c == &text) {
                errors.push(ValidationError::new(
                    field,
                    ViolationCode::NotInChoices,
                    format!("不在可选值 {:?} 中", choices),
                    Some(text),
                ));
            }
        }
    }

    fn check_type(
        &self,
        field: &str,
        value: &Value,
        text: &str,
        field_type: FieldType,
    ) -> Option<ValidationError> {
        let (ok, code, expected) = match field_type {
            FieldType::String => (
                matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)),
                ViolationCode::InvalidType,
                "string",
            ),
            FieldType::Integer => (
                value.as_i64().is_some()
                    || value.as_u64().is_some()
                    || value.as_str().map(|s| s.trim().parse::<i64>().is_ok()).unwrap_or(false),
                ViolationCode::InvalidType,
                "integer",
            ),
            FieldType::Float => (as_number(value).is_some(), ViolationCode::InvalidType, "float"),
            FieldType::Boolean => (
                value.is_boolean()
                    || matches!(text.trim().to_lowercase().as_str(), "true" | "false"),
                ViolationCode::InvalidType,
                "boolean",
            ),
            FieldType::Date => (
                NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").is_ok(),
                ViolationCode::InvalidFormat,
                "date (YYYY-MM-DD)",
            ),
            FieldType::Email => (
                self.email.is_match(text.trim()),
                ViolationCode::InvalidFormat,
                "email",
            ),
            FieldType::Phone => (is_phone(text), ViolationCode::InvalidFormat, "phone"),
            FieldType::Url => (self.url.is_match(text.trim()), ViolationCode::InvalidFormat, "url"),
        };

        if ok {
            None
        } else {
            Some(ValidationError::new(
                field,
                code,
                format!("期望 {}", expected),
                Some(text.to_string()),
            ))
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn is_phone(text: &str) -> bool {
    let allowed = text
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '+' | '-' | '.' | '(' | ')'));
    let digits = text.chars().filter(|c| c.is_ascii_digit()).count();
    allowed && digits >= MIN_PHONE_DIGITS
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ValidationSchema {
        serde_json::from_str(
            r#"{
                "model": "res.partner",
                "required": ["name"],
                "fields": {
                    "email": {"type": "email"},
                    "phone": {"type": "phone"},
                    "website": {"type": "url"},
                    "ref": {"pattern": "^C-[0-9]{4}$"},
                    "credit": {"type": "float", "min": 0, "max": 10000},
                    "code": {"max_length": 5},
                    "kind": {"choices": ["company", "person"]},
                    "since": {"type": "date"}
                }
            }"#,
        )
        .unwrap()
    }

    fn values(pairs: &[(&str, Value)]) -> FieldValues {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn codes(errors: &[ValidationError]) -> Vec<(String, ViolationCode)> {
        errors.iter().map(|e| (e.field.clone(), e.code)).collect()
    }

    #[test]
    fn test_valid_record() {
        let s = schema();
        let v = Validator::for_schemas(std::slice::from_ref(&s)).unwrap();
        let record = values(&[
            ("name", json!("Acme")),
            ("email", json!("info@acme.com")),
            ("phone", json!("+1 (555) 010-0100")),
            ("website", json!("https://acme.com")),
            ("ref", json!("C-0042")),
            ("credit", json!(500)),
            ("code", json!("AB")),
            ("kind", json!("company")),
            ("since", json!("2020-01-31")),
        ]);
        assert!(v.validate(&record, &s).is_ok());
    }

    #[test]
    fn test_collects_all_violations() {
        let s = schema();
        let v = Validator::for_schemas(std::slice::from_ref(&s)).unwrap();
        let record = values(&[
            ("name", json!("   ")),
            ("email", json!("nope")),
            ("phone", json!("12")),
            ("ref", json!("X-1")),
            ("credit", json!("-5")),
            ("code", json!("TOOLONG")),
            ("kind", json!("robot")),
            ("since", json!("31/01/2020")),
        ]);
        let errors = v.validate(&record, &s).unwrap_err();
        let got = codes(&errors);
        assert!(got.contains(&("name".to_string(), ViolationCode::RequiredFieldMissing)));
        assert!(got.contains(&("email".to_string(), ViolationCode::InvalidFormat)));
        assert!(got.contains(&("phone".to_string(), ViolationCode::InvalidFormat)));
        assert!(got.contains(&("ref".to_string(), ViolationCode::InvalidFormat)));
        assert!(got.contains(&("credit".to_string(), ViolationCode::OutOfRange)));
        assert!(got.contains(&("code".to_string(), ViolationCode::TooLong)));
        assert!(got.contains(&("kind".to_string(), ViolationCode::NotInChoices)));
        assert!(got.contains(&("since".to_string(), ViolationCode::InvalidFormat)));
        assert_eq!(errors.len(), 8);
    }

    #[test]
    fn test_missing_optional_fields_are_not_checked() {
        let s = schema();
        let v = Validator::for_schemas(std::slice::from_ref(&s)).unwrap();
        let record = values(&[("name", json!("Acme")), ("email", Value::Null)]);
        assert!(v.validate(&record, &s).is_ok());
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let mut s = schema();
        s.fields.get_mut("ref").unwrap().pattern = Some("([".to_string());
        match Validator::for_schemas(&[s]) {
            Err(ConfigError::InvalidPattern { field, .. }) => assert_eq!(field, "ref"),
            other => panic!("unexpected: {:?}", other.err()),
        }
    }
}
