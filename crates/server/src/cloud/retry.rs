/// 云 API 调用重试
///
/// 瞬时错误按指数退避重试，直到用完尝试次数；每次尝试都有超时

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::{CloudError, CloudResult};
use crate::config::RetrySettings;
use crate::metrics;

/// 指数退避重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 总尝试次数（含第一次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
    /// 抖动比例 (0.0 到 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: settings.base_delay(),
            max_delay: settings.max_delay(),
            attempt_timeout: settings.attempt_timeout(),
            jitter: 0.2,
        }
    }

    /// 第 attempt 次失败后的等待时间（attempt 从 0 开始）
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(16) as i32);
        let delay = delay.min(self.max_delay.as_millis() as f64);

        let jitter = if self.jitter > 0.0 {
            let range = delay * self.jitter;
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }

    /// 执行一次云调用，瞬时错误自动重试
    ///
    /// 超时的尝试可能已在云端生效，创建类调用必须在各次尝试间复用同一个幂等键
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> CloudResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CloudResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.attempt_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(CloudError::Timeout(format!(
                    "{} 超过 {:?} 未返回",
                    operation, self.attempt_timeout
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay(attempt);
                    attempt += 1;
                    metrics::record_cloud_retry(operation);
                    warn!(
                        "云 API 调用失败，准备重试: operation={}, attempt={}/{}, delay={:?}, error={}",
                        operation, attempt, self.max_attempts, delay, err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
