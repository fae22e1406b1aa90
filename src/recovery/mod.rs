//! 恢复控制器（C6）：策略表、死信队列、故障事件消费

pub mod controller;
pub mod dlq;
pub mod strategy;

pub use controller::{
    should_retry_task, FailureReport, RecoveryAttempt, RecoveryConfig, RecoveryController,
    TaskFailure, RECOVERY_SOURCE,
};
pub use dlq::{DeadLetter, DeadLetterEntry, DeadLetterQueue};
pub use strategy::{
    default_strategy, ResolvedStrategy, Specificity, Strategy, StrategyConfig, StrategyEntry,
    StrategyTable,
};
