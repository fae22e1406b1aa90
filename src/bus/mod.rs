//! 消息总线（C1）
//!
//! Agent 之间唯一的通信通道：定向命令队列 + topic 事件交换。

pub mod broker;
pub mod connection;
pub mod message;
pub mod queue;
pub mod topic;

pub use broker::{
    command_handler, event_handler, BusConfig, BusStats, CommandHandler, CommandOutcome,
    EventHandler, MessageBus, QueueStats,
};
pub use connection::{Connector, Declaration, LocalConnector};
pub use message::{Command, CommandReply, Event};
pub use topic::TopicPattern;
