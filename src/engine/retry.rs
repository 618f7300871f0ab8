// ==========================================
// 批量迁移引擎 - 重试与退避
// ==========================================
// 状态机: 尝试 -> (成功 | 临时错误 -> 等待 -> 再尝试 | 永久错误 -> 放弃 | 致命 -> 中止)
// 退避曲线与上限可配置
// ==========================================

use crate::config::engine_config::EngineConfig;
use crate::domain::types::BackoffCurve;
use crate::engine::error::{ErrorClass, RemoteError};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最多尝试次数（含首次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub curve: BackoffCurve,
}

/// 一次失败后的决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
    Abort,
}

impl RetryPolicy {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            max_attempts: cfg.retry_attempts.max(1),
            base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            max_delay: Duration::from_millis(cfg.retry_max_delay_ms),
            curve: cfg.backoff,
        }
    }

    /// 不等待的策略（测试 / 演练）
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            curve: BackoffCurve::Constant,
        }
    }

    /// 第 attempt 次失败后的等待时间（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        let delay = match self.curve {
            BackoffCurve::Constant => self.base_delay,
            BackoffCurve::Linear => self.base_delay.saturating_mul(n),
            BackoffCurve::Exponential => {
                let factor = 2u32.saturating_pow((n - 1).min(31));
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    pub fn decide(&self, attempt: u32, err: &RemoteError) -> RetryDecision {
        match err.class() {
            ErrorClass::Fatal => RetryDecision::Abort,
            ErrorClass::Permanent => RetryDecision::GiveUp,
            ErrorClass::Transient if attempt >= self.max_attempts => RetryDecision::GiveUp,
            ErrorClass::Transient => {
                let delay = match err.retry_after_ms() {
                    Some(ms) => Duration::from_millis(ms).min(self.max_delay.max(self.base_delay)),
                    None => self.delay_for(attempt),
                };
                RetryDecision::Retry { delay }
            }
        }
    }
}

/// 带重试执行远端调用
///
/// 临时错误按策略重试；永久/致命错误立即返回。
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => match policy.decide(attempt, &err) {
                RetryDecision::Retry { delay } => {
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "远端临时错误，等待后重试"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                RetryDecision::GiveUp | RetryDecision::Abort => return Err(err),
            },
        }
    }
}
