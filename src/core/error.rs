//! 运行时错误类型与分类
//!
//! 所有组件统一返回 RuntimeError；错误可映射为 ErrorKind（聚合键的一部分）、category（恢复策略选择）、
//! code（模式检测分组）以及是否可重试（重试策略与熔断器使用）。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 可重试的故障类别（恢复控制器默认策略为 retry）
pub const RETRYABLE_CATEGORIES: [&str; 4] = ["timeout", "rate_limit", "transport", "api_unavailable"];

/// 任务层面永不重试的类别
pub const NON_RETRYABLE_TASK_CATEGORIES: [&str; 2] = ["validation", "authorization"];

pub fn is_retryable_category(category: &str) -> bool {
    RETRYABLE_CATEGORIES.contains(&category)
}

/// 运行时错误：覆盖消息总线、熔断器、模块、Agent、错误处理与恢复的全部故障
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    /// 输入不合法，永不重试
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Agent error: {message}")]
    Agent { message: String, category: String },

    #[error("Module '{module}' error: {message}")]
    Module {
        module: String,
        message: String,
        category: String,
    },

    /// 基础设施故障（总线、存储、外部依赖）
    #[error("System error: {message}")]
    System { message: String, category: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Circuit open for service '{0}'")]
    CircuitOpen(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Agent '{agent}' not ready (status: {status})")]
    AgentNotReady { agent: String, status: String },

    #[error("Message bus unavailable")]
    BusUnavailable,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl RuntimeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn agent(message: impl Into<String>, category: impl Into<String>) -> Self {
        Self::Agent {
            message: message.into(),
            category: category.into(),
        }
    }

    pub fn module(
        module: impl Into<String>,
        message: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self::Module {
            module: module.into(),
            message: message.into(),
            category: category.into(),
        }
    }

    pub fn system(message: impl Into<String>, category: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
            category: category.into(),
        }
    }

    /// 错误种类（错误记录聚合键的一部分）
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::ValidationError,
            Self::Agent { .. }
            | Self::Module { .. }
            | Self::Timeout(_)
            | Self::Cancelled
            | Self::UnknownCommand(_)
            | Self::AgentNotReady { .. } => ErrorKind::AgentError,
            Self::System { .. }
            | Self::Transport(_)
            | Self::Http { .. }
            | Self::CircuitOpen(_)
            | Self::BusUnavailable
            | Self::NotFound(_)
            | Self::Config(_) => ErrorKind::SystemError,
        }
    }

    /// 粗粒度故障类别：用于恢复策略选择
    pub fn category(&self) -> String {
        match self {
            Self::Validation { .. } => "validation".into(),
            Self::Agent { category, .. }
            | Self::Module { category, .. }
            | Self::System { category, .. } => category.clone(),
            Self::Transport(_) => "transport".into(),
            Self::Http { status: 429, .. } => "rate_limit".into(),
            Self::Http { status: 401 | 403, .. } => "authorization".into(),
            Self::Http { status, .. } if *status >= 500 => "api_unavailable".into(),
            Self::Http { .. } => "http".into(),
            Self::CircuitOpen(_) => "api_unavailable".into(),
            Self::Timeout(_) => "timeout".into(),
            Self::Cancelled => "cancelled".into(),
            Self::UnknownCommand(_) => "unknown_command".into(),
            Self::AgentNotReady { .. } => "agent_not_ready".into(),
            Self::BusUnavailable => "transport".into(),
            Self::NotFound(_) => "not_found".into(),
            Self::Config(_) => "config".into(),
        }
    }

    /// 机器可读错误码（模式检测按 code 分组）
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Agent { .. } => "AGENT_ERROR",
            Self::Module { .. } => "MODULE_ERROR",
            Self::System { .. } => "SYSTEM_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Http { .. } => "HTTP_ERROR",
            Self::CircuitOpen(_) => "CIRCUIT_OPEN",
            Self::Timeout(_) => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::UnknownCommand(_) => "UNKNOWN_COMMAND",
            Self::AgentNotReady { .. } => "AGENT_NOT_READY",
            Self::BusUnavailable => "BUS_UNAVAILABLE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// 可重试：传输/超时错误，或状态码 429 / 5xx；模块与系统错误按类别判断
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Module { category, .. } | Self::System { category, .. } | Self::Agent { category, .. } => {
                is_retryable_category(category)
            }
            _ => false,
        }
    }

    /// 不带前缀的错误描述（事件 payload 的 error 字段）
    pub fn message(&self) -> String {
        match self {
            Self::Validation { message, .. }
            | Self::Agent { message, .. }
            | Self::Module { message, .. }
            | Self::System { message, .. } => message.clone(),
            Self::Transport(message) => message.clone(),
            other => other.to_string(),
        }
    }

    /// 附加上下文字段（如 ValidationError 的 fieldName），写入错误记录与模式事件
    pub fn context(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        match self {
            Self::Validation { field: Some(f), .. } => {
                map.insert("fieldName".into(), serde_json::Value::String(f.clone()));
            }
            Self::Http { status, .. } => {
                map.insert("status".into(), serde_json::Value::from(*status));
            }
            Self::CircuitOpen(service) => {
                map.insert("service".into(), serde_json::Value::String(service.clone()));
            }
            _ => {}
        }
        map
    }
}

/// 错误种类（错误处理器发布 error.agent / error.system / error.validation）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    AgentError,
    SystemError,
    ValidationError,
}

impl ErrorKind {
    /// 对应的事件类型
    pub fn event_type(&self) -> &'static str {
        match self {
            ErrorKind::AgentError => "error.agent",
            ErrorKind::SystemError => "error.system",
            ErrorKind::ValidationError => "error.validation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::AgentError => write!(f, "AgentError"),
            ErrorKind::SystemError => write!(f, "SystemError"),
            ErrorKind::ValidationError => write!(f, "ValidationError"),
        }
    }
}

/// 严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Medium
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}
