//! Comb - 多智能体内容运营平台的 Agent 运行时
//!
//! 模块划分：
//! - **bus**: 消息总线（持久命令队列、主题事件、请求/回复、重连）
//! - **resilience**: 重试策略与熔断器
//! - **module**: 可插拔模块、模块注册表与生命周期句柄
//! - **agent**: Agent 监管者（生命周期、命令分派、心跳、内置恢复命令）
//! - **errors**: 错误处理器（聚合、持久化、模式检测）
//! - **recovery**: 恢复控制器（策略表、重试调度、死信队列、无响应检测）
//! - **runtime**: 运行时根（装配与有序关闭）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、状态机、关闭信号

pub mod agent;
pub mod bus;
pub mod config;
pub mod core;
pub mod errors;
pub mod module;
pub mod observability;
pub mod recovery;
pub mod resilience;
pub mod runtime;

pub use agent::{Agent, AgentConfig, AgentServices, ModuleConfig};
pub use bus::{Command, CommandReply, Event, MessageBus};
pub use config::{load_config, AppConfig};
pub use core::{RuntimeError, Severity, Status};
pub use errors::ErrorHandler;
pub use module::{Module, ModuleRegistry};
pub use recovery::{RecoveryController, Strategy, StrategyEntry};
pub use runtime::{AgentStartup, Runtime};
