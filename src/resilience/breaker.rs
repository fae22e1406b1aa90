//! 熔断器：按依赖名维护 closed / open / half_open 状态
//!
//! - closed：连续失败达到阈值 → open（冷却 cooldown）
//! - open：冷却结束后第一个调用者转入 half_open 并作为唯一试探调用放行
//! - half_open：试探调用成功 → closed；失败 → 重新 open；试探调用被取消或丢弃 → 仍为 half_open，下一个调用者成为试探调用
//!
//! 放行结果以 [`Permit`] 返回，未结算就被丢弃时在 Drop 中归还试探调用名额。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::core::RuntimeError;

/// 熔断状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// 熔断器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// 连续失败多少次后打开
    pub failure_threshold: u32,
    /// 打开后冷却时间（毫秒）
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone)]
struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    /// half_open 时试探调用是否已放行
    trial_in_flight: bool,
}

impl Default for Breaker {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            open_until: None,
            trial_in_flight: false,
        }
    }
}

/// 熔断器快照（用于指标）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
}

/// 一次放行；通过 succeed / fail / release 结算
#[must_use = "a permit must be settled or dropped"]
#[derive(Debug)]
pub struct Permit<'a> {
    breakers: &'a CircuitBreakers,
    service: String,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    /// 是否为 half_open 试探调用
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breakers.record_success(&self.service);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breakers.record_failure(&self.service);
    }

    /// 调用未得出结论（取消）：不计成功也不计失败
    pub fn release(mut self) {
        self.settled = true;
        self.breakers.release_trial(&self.service, self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breakers.release_trial(&self.service, self.trial);
        }
    }
}

/// 所有依赖的熔断器（共享可变状态，写入串行化；临界区内不跨 await）
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.config.cooldown_ms)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Breaker>> {
        self.breakers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 请求放行：open 时返回 CircuitOpen；冷却结束时只放行一个试探调用
    pub fn acquire(&self, service: &str) -> Result<Permit<'_>, RuntimeError> {
        let mut breakers = self.table();
        let breaker = breakers.entry(service.to_string()).or_default();
        let trial = match breaker.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let cooled = breaker.open_until.map(|t| Instant::now() >= t).unwrap_or(true);
                if !cooled {
                    return Err(RuntimeError::CircuitOpen(service.to_string()));
                }
                breaker.state = BreakerState::HalfOpen;
                breaker.trial_in_flight = true;
                tracing::info!(service, "circuit half-open, admitting trial call");
                true
            }
            BreakerState::HalfOpen => {
                if breaker.trial_in_flight {
                    return Err(RuntimeError::CircuitOpen(service.to_string()));
                }
                breaker.trial_in_flight = true;
                true
            }
        };
        Ok(Permit {
            breakers: self,
            service: service.to_string(),
            trial,
            settled: false,
        })
    }

    /// 只检查不占用试探调用
    pub fn check(&self, service: &str) -> Result<(), RuntimeError> {
        let breakers = self.table();
        match breakers.get(service) {
            Some(b) if b.state == BreakerState::Open => {
                let cooled = b.open_until.map(|t| Instant::now() >= t).unwrap_or(true);
                if cooled {
                    Ok(())
                } else {
                    Err(RuntimeError::CircuitOpen(service.to_string()))
                }
            }
            Some(b) if b.state == BreakerState::HalfOpen && b.trial_in_flight => {
                Err(RuntimeError::CircuitOpen(service.to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn record_success(&self, service: &str) {
        let mut breakers = self.table();
        let breaker = breakers.entry(service.to_string()).or_default();
        if breaker.state != BreakerState::Closed {
            tracing::info!(service, "circuit closed");
        }
        *breaker = Breaker::default();
    }

    pub fn record_failure(&self, service: &str) {
        let cooldown = self.cooldown();
        let threshold = self.config.failure_threshold.max(1);
        let mut breakers = self.table();
        let breaker = breakers.entry(service.to_string()).or_default();
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        let reopen = match breaker.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => breaker.consecutive_failures >= threshold,
            BreakerState::Open => false,
        };
        if reopen {
            breaker.state = BreakerState::Open;
            breaker.open_until = Some(Instant::now() + cooldown);
            breaker.trial_in_flight = false;
            tracing::warn!(
                service,
                failures = breaker.consecutive_failures,
                cooldown_ms = cooldown.as_millis() as u64,
                "circuit opened"
            );
        }
    }

    fn release_trial(&self, service: &str, trial: bool) {
        if !trial {
            return;
        }
        let mut breakers = self.table();
        if let Some(breaker) = breakers.get_mut(service) {
            if breaker.state == BreakerState::HalfOpen && breaker.trial_in_flight {
                breaker.trial_in_flight = false;
                tracing::debug!(service, "trial call abandoned, circuit stays half-open");
            }
        }
    }

    pub fn reset(&self, service: &str) {
        self.table().remove(service);
    }

    pub fn state(&self, service: &str) -> BreakerState {
        self.table()
            .get(service)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut list: Vec<BreakerSnapshot> = self
            .table()
            .iter()
            .map(|(service, b)| BreakerSnapshot {
                service: service.clone(),
                state: b.state,
                consecutive_failures: b.consecutive_failures,
            })
            .collect();
        list.sort_by(|a, b| a.service.cmp(&b.service));
        list
    }
}
