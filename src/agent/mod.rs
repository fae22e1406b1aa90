//! Agent（C4）：配置、命令表、心跳与监管者
//!
//! 一个 Agent 拥有一组模块、一个命令队列消费者和若干事件订阅；
//! 只通过消息总线与外界交互。

pub mod config;
pub mod handlers;
pub mod heartbeat;
pub mod supervisor;

pub use config::{AgentConfig, ModuleConfig, ModuleTable, SubscriptionConfig};
pub use handlers::{
    admits, command_fn, fallback_fn, BuiltinCommand, CommandFn, FallbackFn, HandlerContext,
    HandlerTable, Route,
};
pub use heartbeat::HeartbeatTask;
pub use supervisor::{Agent, AgentServices, CommandStat};
