//! Agent 配置：模块表、心跳间隔、命令超时、事件订阅
//!
//! 时间单位为秒（可为小数）；键名同时接受 snake_case 与 camelCase。
//! modules 按配置文件中的书写顺序初始化与启动。

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::bus::TopicPattern;
use crate::core::RuntimeError;

/// 默认心跳间隔（秒）
pub const DEFAULT_HEARTBEAT_INTERVAL: f64 = 30.0;
/// 默认命令超时（秒）
pub const DEFAULT_COMMAND_TIMEOUT: f64 = 60.0;

/// 单个模块配置
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 必需模块初始化或启动失败时 Agent 进入 error
    #[serde(default)]
    pub required: bool,
    /// 模块类型（注册表键）；缺省与模块 ID 相同
    #[serde(default, alias = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub settings: Value,
}

fn default_true() -> bool {
    true
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            required: false,
            kind: None,
            settings: Value::Null,
        }
    }
}

/// 保持书写顺序的模块表
#[derive(Debug, Clone, Default)]
pub struct ModuleTable(pub Vec<(String, ModuleConfig)>);

impl ModuleTable {
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ModuleConfig)> {
        self.0.iter().map(|(id, cfg)| (id, cfg))
    }

    pub fn get(&self, id: &str) -> Option<&ModuleConfig> {
        self.0.iter().find(|(k, _)| k == id).map(|(_, v)| v)
    }

    pub fn insert(&mut self, id: impl Into<String>, config: ModuleConfig) {
        let id = id.into();
        match self.0.iter_mut().find(|(k, _)| *k == id) {
            Some(entry) => entry.1 = config,
            None => self.0.push((id, config)),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for ModuleTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TableVisitor;

        impl<'de> Visitor<'de> for TableVisitor {
            type Value = ModuleTable;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of module id to module config")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut table = ModuleTable::default();
                while let Some((id, config)) = map.next_entry::<String, ModuleConfig>()? {
                    table.insert(id, config);
                }
                Ok(table)
            }
        }

        deserializer.deserialize_map(TableVisitor)
    }
}

/// 事件订阅
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    /// topic 模式（agent.* / error.#）
    pub event: String,
    #[serde(default)]
    pub description: String,
}

/// Agent 配置
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub modules: ModuleTable,
    /// 心跳间隔（秒）
    #[serde(
        default = "default_heartbeat_interval",
        alias = "heartbeatInterval",
        alias = "heartbeatinterval"
    )]
    pub heartbeat_interval: f64,
    /// 命令超时（秒）
    #[serde(
        default = "default_command_timeout",
        alias = "commandTimeout",
        alias = "commandtimeout"
    )]
    pub command_timeout: f64,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

fn default_heartbeat_interval() -> f64 {
    DEFAULT_HEARTBEAT_INTERVAL
}

fn default_command_timeout() -> f64 {
    DEFAULT_COMMAND_TIMEOUT
}

impl AgentConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: String::new(),
            modules: ModuleTable::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            subscriptions: Vec::new(),
        }
    }

    pub fn with_module(mut self, id: impl Into<String>, config: ModuleConfig) -> Self {
        self.modules.insert(id, config);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.as_secs_f64();
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout.as_secs_f64();
        self
    }

    pub fn with_subscription(mut self, pattern: impl Into<String>) -> Self {
        self.subscriptions.push(SubscriptionConfig {
            event: pattern.into(),
            description: String::new(),
        });
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        secs(self.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL)
    }

    pub fn command_timeout(&self) -> Duration {
        secs(self.command_timeout, DEFAULT_COMMAND_TIMEOUT)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.id.trim().is_empty() {
            return Err(RuntimeError::validation_field("id", "agent id is empty"));
        }
        if self.heartbeat_interval.is_nan() || self.heartbeat_interval <= 0.0 {
            return Err(RuntimeError::validation_field(
                "heartbeatInterval",
                format!("agent '{}': heartbeat interval must be positive", self.id),
            ));
        }
        if self.command_timeout.is_nan() || self.command_timeout <= 0.0 {
            return Err(RuntimeError::validation_field(
                "commandTimeout",
                format!("agent '{}': command timeout must be positive", self.id),
            ));
        }
        for sub in &self.subscriptions {
            TopicPattern::parse(&sub.event)?;
        }
        Ok(())
    }

    /// 读取单个 Agent 的 TOML 文件
    pub fn from_toml_file(path: &Path) -> Result<Self, RuntimeError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::Config(format!("{}: {e}", path.display())))?;
        let config: AgentConfig = toml::from_str(&text)
            .map_err(|e| RuntimeError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }
}

fn secs(value: f64, default: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::from_secs_f64(default)
    }
}
