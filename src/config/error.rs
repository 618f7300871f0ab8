// ==========================================
// 批量迁移引擎 - 配置层错误类型
// ==========================================
// 工具: thiserror 派生宏
// 配置错误在处理任何记录之前暴露
// ==========================================

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("配置值超出范围 (key: {key}, value: {value}): 允许范围 [{min}, {max}]")]
    OutOfRange {
        key: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("配置值格式错误 (key: {key}, value: {value}): {message}")]
    InvalidValue {
        key: String,
        value: String,
        message: String,
    },

    #[error("迁移计划无效: {0}")]
    InvalidPlan(String),

    #[error("正则表达式无效 (model={model}, field={field}): {message}")]
    InvalidPattern {
        model: String,
        field: String,
        message: String,
    },

    #[error("未知转换 (model={model}, field={field}): {transform}")]
    UnknownTransform {
        model: String,
        field: String,
        transform: String,
    },

    #[error("配置文件读取失败: {0}")]
    ReadError(String),

    #[error("配置解析失败: {0}")]
    ParseError(String),

    #[error("配置存储失败: {0}")]
    StoreError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::ReadError(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

impl From<rusqlite::Error> for ConfigError {
    fn from(err: rusqlite::Error) -> Self {
        ConfigError::StoreError(err.to_string())
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
