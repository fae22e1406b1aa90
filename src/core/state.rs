//! 生命周期状态：Agent 与 Module 共用同一状态格
//!
//! initializing → initialized → running → stopped；error / unresponsive 可由任意状态进入。

use serde::{Deserialize, Serialize};

/// 生命周期状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Initializing,
    Initialized,
    Running,
    Stopped,
    Error,
    Unresponsive,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Initializing => "initializing",
            Status::Initialized => "initialized",
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Error => "error",
            Status::Unresponsive => "unresponsive",
        }
    }

    /// 是否处于故障态（只接受恢复命令）
    pub fn is_faulted(&self) -> bool {
        matches!(self, Status::Error | Status::Unresponsive)
    }

    /// 状态机是否允许从 self 迁移到 next
    pub fn can_transition_to(&self, next: Status) -> bool {
        use Status::*;
        match (self, next) {
            (_, Error) | (_, Unresponsive) => true,
            (Initializing, Initialized) => true,
            (Initialized, Running) => true,
            (Running, Stopped) | (Initialized, Stopped) | (Initializing, Stopped) => true,
            // 重新初始化：restart / recover
            (Stopped, Initializing) | (Error, Initializing) | (Unresponsive, Initializing) => true,
            (Running, Initializing) => true,
            (Error, Stopped) | (Unresponsive, Stopped) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
