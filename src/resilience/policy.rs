//! 重试策略：有界次数 + 指数退避
//!
//! 第 k 次重试（从 1 开始）前的等待为 `min(initial_delay · factor^(k-1), max_delay)`。
//! 总线重连使用同一形状。

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 重试策略配置（时间单位：毫秒）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// 总尝试次数（含首次）
    pub attempts: u32,
    #[serde(alias = "initial_delay", alias = "initialdelay")]
    pub initial_delay: u64,
    pub factor: f64,
    #[serde(alias = "max_delay", alias = "maxdelay")]
    pub max_delay: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: 1000,
            factor: 2.0,
            max_delay: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, initial_delay: u64, factor: f64, max_delay: u64) -> Self {
        Self {
            attempts,
            initial_delay,
            factor,
            max_delay,
        }
    }

    /// 第 retry 次重试前的等待（retry 从 1 开始；0 视为 1）
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1) as i32;
        let raw = self.initial_delay as f64 * self.factor.max(1.0).powi(exp);
        let capped = raw.min(self.max_delay as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// 最多可重试次数
    pub fn max_retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    /// 全部重试等待序列
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_retries()).map(move |k| self.delay_for(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_by_factor() {
        let policy = RetryPolicy::new(3, 10, 2.0, 100);
        let delays: Vec<u64> = policy.delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![10, 20]);
    }

    #[test]
    fn test_delays_bounded_by_max() {
        let policy = RetryPolicy::new(8, 10, 2.0, 100);
        let delays: Vec<u64> = policy.delays().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 100, 100, 100]);
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[test]
    fn test_single_attempt_has_no_retries() {
        let policy = RetryPolicy::new(1, 10, 2.0, 100);
        assert_eq!(policy.max_retries(), 0);
        assert_eq!(policy.delays().count(), 0);
    }

    #[test]
    fn test_deserialize_camel_case() {
        let policy: RetryPolicy = serde_json::from_value(serde_json::json!({
            "attempts": 3, "initialDelay": 10, "factor": 2, "maxDelay": 100
        }))
        .unwrap();
        assert_eq!(policy, RetryPolicy::new(3, 10, 2.0, 100));
    }
}
