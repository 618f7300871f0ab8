// ==========================================
// 批量迁移引擎 - 字段校验违规
// ==========================================
// 校验器与转换管线共用的违规描述
// 一条记录可以同时携带多个违规
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 违规代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationCode {
    RequiredFieldMissing,
    InvalidType,
    InvalidFormat,
    OutOfRange,
    TooLong,
    NotInChoices,
    TransformFailed,
}

impl ViolationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationCode::RequiredFieldMissing => "REQUIRED_FIELD_MISSING",
            ViolationCode::InvalidType => "INVALID_TYPE",
            ViolationCode::InvalidFormat => "INVALID_FORMAT",
            ViolationCode::OutOfRange => "OUT_OF_RANGE",
            ViolationCode::TooLong => "TOO_LONG",
            ViolationCode::NotInChoices => "NOT_IN_CHOICES",
            ViolationCode::TransformFailed => "TRANSFORM_FAILED",
        }
    }
}

impl fmt::Display for ViolationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 单个字段违规
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{field} [{code}]: {message}")]
pub struct ValidationError {
    pub field: String,
    pub code: ViolationCode,
    pub message: String,
    pub value: Option<String>,
}

impl ValidationError {
    pub fn new(
        field: impl Into<String>,
        code: ViolationCode,
        message: impl Into<String>,
        value: Option<String>,
    ) -> Self {
        Self {
            field: field.into(),
            code,
            message: message.into(),
            value,
        }
    }

    pub fn required_missing(field: &str) -> Self {
        Self::new(field, ViolationCode::RequiredFieldMissing, "必填字段缺失", None)
    }

    pub fn transform_failed(field: &str, message: impl Into<String>, value: String) -> Self {
        Self::new(field, ViolationCode::TransformFailed, message, Some(value))
    }
}

/// 把多条违规拼成账本可读的一行
pub fn join_violations(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
