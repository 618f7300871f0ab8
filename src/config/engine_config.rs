// ==========================================
// 批量迁移引擎 - 引擎参数
// ==========================================
// 职责: 分批 / 重试退避 / 并发 / 去重查询 / 账本位置
// 默认值与原迁移工具保持一致
// ==========================================

use crate::config::error::{ConfigError, ConfigResult};
use crate::domain::types::{BackoffCurve, LedgerBackend};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 覆盖默认账本目录的环境变量
pub const STATE_DIR_ENV: &str = "BULK_MIGRATOR_STATE_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 每批记录数
    pub chunk_size: usize,
    /// 单条写入最多尝试次数（含首次）
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub backoff: BackoffCurve,
    /// 批内并发写入
    pub parallel: bool,
    pub max_workers: usize,
    /// 远端去重每次查询的键数量
    pub lookup_batch_size: usize,
    pub lookup_concurrency: usize,
    /// 电话号码缺省国家码
    pub default_country_code: String,
    pub ledger_backend: LedgerBackend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_dir: Option<PathBuf>,
    /// JSONL 账本同时写 CSV 镜像
    pub csv_mirror: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            retry_attempts: 3,
            retry_base_delay_ms: 2_000,
            retry_max_delay_ms: 60_000,
            backoff: BackoffCurve::Exponential,
            parallel: false,
            max_workers: 4,
            lookup_batch_size: 200,
            lookup_concurrency: 2,
            default_country_code: "+1".to_string(),
            ledger_backend: LedgerBackend::Jsonl,
            ledger_dir: None,
            csv_mirror: true,
        }
    }
}

fn check_range<T>(key: &str, value: T, min: T, max: T) -> ConfigResult<()>
where
    T: PartialOrd + ToString,
{
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            key: key.to_string(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        });
    }
    Ok(())
}

impl EngineConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        check_range("chunk_size", self.chunk_size, 1, 5_000)?;
        check_range("retry_attempts", self.retry_attempts, 1, 10)?;
        check_range("retry_base_delay_ms", self.retry_base_delay_ms, 0, 60_000)?;
        check_range("retry_max_delay_ms", self.retry_max_delay_ms, 0, 3_600_000)?;
        check_range("max_workers", self.max_workers, 1, 16)?;
        check_range("lookup_batch_size", self.lookup_batch_size, 1, 5_000)?;
        check_range("lookup_concurrency", self.lookup_concurrency, 1, 16)?;

        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "retry_max_delay_ms".to_string(),
                value: self.retry_max_delay_ms.to_string(),
                message: "不能小于 retry_base_delay_ms".to_string(),
            });
        }

        let cc = self.default_country_code.trim();
        if !cc.starts_with('+') || cc.len() < 2 || !cc[1..].chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::InvalidValue {
                key: "default_country_code".to_string(),
                value: self.default_country_code.clone(),
                message: "期望形如 +1 / +86".to_string(),
            });
        }
        Ok(())
    }

    /// 批内写入并发数（未开启并行时为 1）
    pub fn workers(&self) -> usize {
        if self.parallel {
            self.max_workers.max(1)
        } else {
            1
        }
    }

    /// 账本根目录（显式配置优先）
    pub fn resolved_ledger_dir(&self) -> PathBuf {
        self.ledger_dir.clone().unwrap_or_else(default_state_dir)
    }
}

/// 默认账本目录
///
/// 优先级: 环境变量 > 用户数据目录 > 当前目录下 migration_state
pub fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    match dirs::data_local_dir() {
        Some(base) => base.join("bulk-migrator").join("runs"),
        None => PathBuf::from("migration_state"),
    }
}
