//! 总线消息协议定义
//!
//! 命令（Command）定向投递到单个 Agent 的持久队列；事件（Event）按 topic 广播给所有匹配的订阅者。
//! 两者共用 JSON 信封：`{ id, type, timestamp, payload, source }`。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 定向命令（入队后不可变；ack 或进入死信后销毁）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    /// 目标 Agent
    pub target: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
    /// 发起方（CLI / 调度器 / 其他 Agent / recovery）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// 可选截止时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// 已重投次数
    #[serde(default)]
    pub retry_count: u32,
}

impl Command {
    pub fn new(target: impl Into<String>, command_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            command_type: command_type.into(),
            target: target.into(),
            timestamp: Utc::now(),
            payload,
            source: None,
            deadline: None,
            retry_count: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// payload.timeout（毫秒）
    pub fn timeout_ms(&self) -> Option<u64> {
        self.payload.get("timeout").and_then(|v| v.as_u64())
    }
}

/// 广播事件（只追加；消费者之间互不影响）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn new(source: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// 路由键：`source.type`
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.source, self.event_type)
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// 命令执行结果（失败时 success=false 且带 error）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 耗时（毫秒）
    pub duration: u64,
}

impl CommandReply {
    pub fn ok(id: impl Into<String>, result: Value, duration: u64) -> Self {
        Self {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
            duration,
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>, duration: u64) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            duration,
        }
    }
}
