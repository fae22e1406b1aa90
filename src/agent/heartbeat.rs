//! 心跳：周期时钟 + 命令完成后补发
//!
//! 时钟不抢占正在执行的命令：每次 tick 先等待命令锁释放再发送。

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::supervisor::Agent;

/// 运行中的心跳任务
pub struct HeartbeatTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl HeartbeatTask {
    pub fn spawn(agent: Weak<Agent>, interval: Duration, parent: &CancellationToken) -> Self {
        let token = parent.child_token();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(agent) = agent.upgrade() else { break };
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = agent.wait_idle() => {}
                }
                agent.send_heartbeat().await;
            }
        });
        Self { token, handle }
    }

    /// 取消（不等待；任务可能正等待命令锁）
    pub fn cancel(self) {
        self.token.cancel();
        drop(self.handle);
    }
}

/// 常驻内存（KB），仅 Linux 可得
pub fn resident_memory_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}
