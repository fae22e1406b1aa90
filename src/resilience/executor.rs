//! 带重试与熔断的调用执行器
//!
//! 模块调用外部依赖时统一经过 Resilience::execute_with_retry：
//! 熔断打开则立即失败（不发起调用）；可重试错误按策略退避重试；致命错误立即返回。

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use super::breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreakers};
use super::policy::RetryPolicy;
use crate::core::RuntimeError;

/// 单次调用选项
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// 依赖名（熔断器按此分组）
    pub service: String,
    /// 单次尝试超时
    pub attempt_timeout: Option<Duration>,
    /// 取消信号（重试等待与调用本身都会响应）
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = Some(attempt_timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// 命名重试策略 + 熔断器
#[derive(Debug)]
pub struct Resilience {
    policies: HashMap<String, RetryPolicy>,
    breakers: CircuitBreakers,
}

impl Default for Resilience {
    fn default() -> Self {
        Self::new(HashMap::new(), BreakerConfig::default())
    }
}

impl Resilience {
    pub fn new(policies: HashMap<String, RetryPolicy>, breaker: BreakerConfig) -> Self {
        Self {
            policies,
            breakers: CircuitBreakers::new(breaker),
        }
    }

    /// 未注册的策略名回退到 "default"，再回退到内置默认值
    pub fn policy(&self, name: &str) -> RetryPolicy {
        self.policies
            .get(name)
            .or_else(|| self.policies.get("default"))
            .cloned()
            .unwrap_or_default()
    }

    pub fn register_policy(&mut self, name: impl Into<String>, policy: RetryPolicy) {
        self.policies.insert(name.into(), policy);
    }

    /// 执行 operation，按 policy_name 重试，按 options.service 熔断
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        policy_name: &str,
        options: CallOptions,
        mut operation: F,
    ) -> Result<T, RuntimeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RuntimeError>>,
    {
        let policy = self.policy(policy_name);
        let service = options.service.as_str();
        let attempts = policy.attempts.max(1);
        let cancel = options.cancel.clone().unwrap_or_default();

        let mut attempt = 1;
        loop {
            // 未结算的 permit 被丢弃（外层超时或取消）时自动归还试探调用名额
            let permit = self.breakers.acquire(service)?;

            let started = Instant::now();
            let call = operation();
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(RuntimeError::Cancelled),
                r = async {
                    match options.attempt_timeout {
                        Some(limit) => timeout(limit, call)
                            .await
                            .unwrap_or(Err(RuntimeError::Timeout(limit))),
                        None => call.await,
                    }
                } => r,
            };

            match result {
                Ok(value) => {
                    permit.succeed();
                    return Ok(value);
                }
                Err(RuntimeError::Cancelled) => {
                    // 取消不计入熔断
                    permit.release();
                    return Err(RuntimeError::Cancelled);
                }
                Err(err) if !err.is_retryable() => {
                    // 依赖已作出应答，致命错误不计入熔断
                    permit.succeed();
                    tracing::warn!(service, policy = policy_name, error = %err, "fatal error, not retrying");
                    return Err(err);
                }
                Err(err) => {
                    permit.fail();
                    if attempt >= attempts {
                        tracing::warn!(
                            service,
                            policy = policy_name,
                            attempts,
                            error = %err,
                            "retries exhausted"
                        );
                        return Err(err);
                    }
                    let delay = policy.delay_for(attempt);
                    tracing::info!(
                        service,
                        policy = policy_name,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retry scheduled"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// open 时返回 CircuitOpen
    pub async fn check_circuit_breaker(&self, service: &str) -> Result<(), RuntimeError> {
        self.breakers.check(service)
    }

    pub async fn reset_circuit_breaker(&self, service: &str) {
        self.breakers.reset(service);
        tracing::info!(service, "circuit breaker reset");
    }

    pub async fn breaker_state(&self, service: &str) -> BreakerState {
        self.breakers.state(service)
    }

    pub async fn breaker_snapshot(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn resilience(attempts: u32, threshold: u32) -> Resilience {
        let mut policies = HashMap::new();
        policies.insert("fast".to_string(), RetryPolicy::new(attempts, 5, 2.0, 20));
        Resilience::new(
            policies,
            BreakerConfig {
                failure_threshold: threshold,
                cooldown_ms: 10_000,
            },
        )
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let r = resilience(3, 10);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = r
            .execute_with_retry("fast", CallOptions::service("cms"), || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(RuntimeError::Transport("reset".into()))
                    } else {
                        Ok("published")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "published");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(r.breaker_state("cms").await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let r = resilience(5, 10);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = r
            .execute_with_retry("fast", CallOptions::service("cms"), || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(RuntimeError::Http { status: 400, message: "bad".into() })
                }
            })
            .await;
        assert!(matches!(result, Err(RuntimeError::Http { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits() {
        let r = resilience(2, 2);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let op = || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RuntimeError::Http { status: 503, message: "down".into() })
            }
        };
        let _ = r.execute_with_retry("fast", CallOptions::service("social"), op).await;
        assert_eq!(r.breaker_state("social").await, BreakerState::Open);
        let before = calls.load(Ordering::SeqCst);

        let second = r.execute_with_retry("fast", CallOptions::service("social"), op).await;
        assert!(matches!(second, Err(RuntimeError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), before);
        assert!(r.check_circuit_breaker("social").await.is_err());

        r.reset_circuit_breaker("social").await;
        assert!(r.check_circuit_breaker("social").await.is_ok());
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retryable() {
        let r = resilience(2, 10);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = r
            .execute_with_retry(
                "fast",
                CallOptions::service("slow").with_timeout(Duration::from_millis(10)),
                || {
                    let c = c.clone();
                    async move {
                        if c.fetch_add(1, Ordering::SeqCst) == 0 {
                            sleep(Duration::from_millis(200)).await;
                        }
                        Ok(7)
                    }
                },
            )
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let mut policies = HashMap::new();
        policies.insert("slow".to_string(), RetryPolicy::new(5, 10_000, 2.0, 10_000));
        let r = Resilience::new(policies, BreakerConfig::default());
        let token = CancellationToken::new();
        let t = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            t.cancel();
        });
        let result: Result<(), _> = r
            .execute_with_retry("slow", CallOptions::service("x").with_cancel(token), || async {
                Err(RuntimeError::Transport("down".into()))
            })
            .await;
        assert!(matches!(result, Err(RuntimeError::Cancelled)));
    }

    fn cooling(cooldown_ms: u64) -> Resilience {
        let mut policies = HashMap::new();
        policies.insert("once".to_string(), RetryPolicy::new(1, 5, 2.0, 20));
        Resilience::new(
            policies,
            BreakerConfig {
                failure_threshold: 1,
                cooldown_ms,
            },
        )
    }

    #[tokio::test]
    async fn test_abandoned_half_open_call_does_not_wedge_breaker() {
        let r = cooling(20);
        let _ = r
            .execute_with_retry("once", CallOptions::service("cms"), || async {
                Err::<(), _>(RuntimeError::Transport("reset".into()))
            })
            .await;
        assert_eq!(r.breaker_state("cms").await, BreakerState::Open);
        sleep(Duration::from_millis(40)).await;

        // 外层超时丢弃了正在执行的试探调用调用
        let abandoned = timeout(
            Duration::from_millis(10),
            r.execute_with_retry("once", CallOptions::service("cms"), || async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(r.breaker_state("cms").await, BreakerState::HalfOpen);
        assert!(r.check_circuit_breaker("cms").await.is_ok());

        let later = r
            .execute_with_retry("once", CallOptions::service("cms"), || async { Ok("published") })
            .await;
        assert_eq!(later.unwrap(), "published");
        assert_eq!(r.breaker_state("cms").await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_half_open_call_keeps_half_open() {
        let r = cooling(20);
        let _ = r
            .execute_with_retry("once", CallOptions::service("cms"), || async {
                Err::<(), _>(RuntimeError::Transport("reset".into()))
            })
            .await;
        sleep(Duration::from_millis(40)).await;

        let token = CancellationToken::new();
        let t = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            t.cancel();
        });
        let cancelled: Result<(), _> = r
            .execute_with_retry("once", CallOptions::service("cms").with_cancel(token), || async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(cancelled, Err(RuntimeError::Cancelled)));
        assert_eq!(r.breaker_state("cms").await, BreakerState::HalfOpen);
        assert_eq!(r.breaker_snapshot().await[0].consecutive_failures, 1);
        assert!(r.check_circuit_breaker("cms").await.is_ok());
    }
}
