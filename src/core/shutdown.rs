//! 优雅关闭处理
//!
//! 单一取消信号驱动整个运行时退出；关闭按步骤执行，每步有硬性超时，
//! 超时或失败只记入报告，后续步骤照常进行。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    /// 关闭信号 token（运行时根 token）
    shutdown_token: CancellationToken,
    /// 关闭原因广播
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// 调用方主动关闭
    Requested,
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM 信号
    Signal,
    /// 致命错误
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 获取关闭 token（用于取消正在进行的任务）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 触发关闭
    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// 订阅关闭原因
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("received Ctrl+C, initiating graceful shutdown");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("received SIGTERM, initiating graceful shutdown");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 单个步骤的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownStep {
    pub name: String,
    pub outcome: StepOutcome,
    pub elapsed_ms: u64,
}

/// 关闭报告
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub steps: Vec<ShutdownStep>,
}

impl ShutdownReport {
    fn names(&self, pred: impl Fn(&StepOutcome) -> bool) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| pred(&s.outcome))
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn completed(&self) -> Vec<&str> {
        self.names(|o| matches!(o, StepOutcome::Completed))
    }

    pub fn failed(&self) -> Vec<&str> {
        self.names(|o| matches!(o, StepOutcome::Failed(_)))
    }

    pub fn timed_out(&self) -> Vec<&str> {
        self.names(|o| matches!(o, StepOutcome::TimedOut))
    }

    pub fn is_clean(&self) -> bool {
        self.steps
            .iter()
            .all(|s| matches!(s.outcome, StepOutcome::Completed))
    }
}

/// 按顺序执行关闭步骤
pub struct ShutdownSequence {
    step_timeout: Duration,
    report: ShutdownReport,
}

impl ShutdownSequence {
    pub fn new(step_timeout: Duration) -> Self {
        Self {
            step_timeout,
            report: ShutdownReport::default(),
        }
    }

    pub async fn step<F>(&mut self, name: impl Into<String>, fut: F) -> StepOutcome
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        let name = name.into();
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.step_timeout, fut).await {
            Ok(Ok(())) => {
                tracing::info!(step = %name, "shutdown step completed");
                StepOutcome::Completed
            }
            Ok(Err(e)) => {
                tracing::warn!(step = %name, error = %e, "shutdown step failed");
                StepOutcome::Failed(format!("{e:#}"))
            }
            Err(_) => {
                tracing::warn!(step = %name, timeout_secs = self.step_timeout.as_secs(), "shutdown step timed out");
                StepOutcome::TimedOut
            }
        };
        self.report.steps.push(ShutdownStep {
            name,
            outcome: outcome.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        outcome
    }

    pub fn finish(self) -> ShutdownReport {
        self.report
    }
}
