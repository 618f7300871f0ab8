// ==========================================
// 批量迁移引擎 - 配置层
// ==========================================
// 职责: 迁移计划 / 引擎参数 / 持久化覆写
// 存储: 计划为 JSON 文件，覆写在 config_kv 表
// ==========================================

pub mod config_manager;
pub mod engine_config;
pub mod error;
pub mod plan;

pub use config_manager::{config_keys, ConfigManager};
pub use engine_config::{default_state_dir, EngineConfig, STATE_DIR_ENV};
pub use error::{ConfigError, ConfigResult};
pub use plan::MigrationPlan;
