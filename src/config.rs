//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `COMB__*` 覆盖（双下划线表示嵌套，如 `COMB__BUS__PREFETCH=4`）。
//! Agent 定义来自 `[[agents]]` 与 `config/agents/*.toml`（每个文件一个 Agent）。

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use crate::agent::config::{AgentConfig, DEFAULT_COMMAND_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL};
use crate::bus::BusConfig;
use crate::core::RuntimeError;
use crate::errors::ErrorsConfig;
use crate::recovery::RecoveryConfig;
use crate::resilience::{BreakerConfig, Resilience, RetryPolicy};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub bus: BusConfig,
    pub defaults: DefaultsSection,
    pub breaker: BreakerConfig,
    /// 命名重试策略（模块调用外部依赖时按名引用）
    pub retry_policies: HashMap<String, RetryPolicy>,
    pub errors: ErrorsConfig,
    pub recovery: RecoveryConfig,
    pub shutdown: ShutdownSection,
    /// 内联 Agent 定义；未写明的心跳间隔与命令超时取 [defaults]
    pub agents: Vec<Value>,
}

/// [app] 段：应用名、Agent 定义目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 每个 *.toml 文件一个 Agent；不存在时忽略
    pub agents_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            agents_dir: PathBuf::from("config/agents"),
        }
    }
}

/// [defaults] 段（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DefaultsSection {
    pub heartbeat_interval: f64,
    pub command_timeout: f64,
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// [shutdown] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownSection {
    /// 每个关闭步骤的最长等待（秒）
    pub step_timeout_secs: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            step_timeout_secs: 10,
        }
    }
}

const HEARTBEAT_KEYS: [&str; 3] = ["heartbeat_interval", "heartbeatInterval", "heartbeatinterval"];
const TIMEOUT_KEYS: [&str; 3] = ["command_timeout", "commandTimeout", "commandtimeout"];

impl AppConfig {
    /// 命名重试策略 + 熔断器
    pub fn resilience(&self) -> Resilience {
        Resilience::new(self.retry_policies.clone(), self.breaker.clone())
    }

    /// 所有 Agent 配置：先内联定义，再按文件名顺序读取 agents_dir；ID 重复时报错
    pub fn agent_configs(&self) -> Result<Vec<AgentConfig>, RuntimeError> {
        let mut raw: Vec<(String, Value)> = self
            .agents
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("agents[{i}]"), v.clone()))
            .collect();
        raw.extend(self.agent_files()?);

        let mut seen = HashSet::new();
        let mut configs = Vec::with_capacity(raw.len());
        for (origin, value) in raw {
            let config = self.agent_from_value(value, &origin)?;
            if !seen.insert(config.id.clone()) {
                return Err(RuntimeError::Config(format!(
                    "{origin}: duplicate agent id '{}'",
                    config.id
                )));
            }
            configs.push(config);
        }
        Ok(configs)
    }

    fn agent_files(&self) -> Result<Vec<(String, Value)>, RuntimeError> {
        let dir = &self.app.agents_dir;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let pattern = dir.join("*.toml");
        let pattern = pattern.to_string_lossy();
        let mut paths: Vec<PathBuf> = glob::glob(&pattern)
            .map_err(|e| RuntimeError::Config(format!("{pattern}: {e}")))?
            .filter_map(Result::ok)
            .collect();
        paths.sort();

        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| RuntimeError::Config(format!("{}: {e}", path.display())))?;
            let table: toml::Value = toml::from_str(&text)
                .map_err(|e| RuntimeError::Config(format!("{}: {e}", path.display())))?;
            let value = serde_json::to_value(table)
                .map_err(|e| RuntimeError::Config(format!("{}: {e}", path.display())))?;
            tracing::debug!(path = %path.display(), "agent definition loaded");
            out.push((path.display().to_string(), value));
        }
        Ok(out)
    }

    fn agent_from_value(&self, mut value: Value, origin: &str) -> Result<AgentConfig, RuntimeError> {
        if let Value::Object(map) = &mut value {
            if !HEARTBEAT_KEYS.iter().any(|k| map.contains_key(*k)) {
                map.insert(
                    "heartbeat_interval".into(),
                    Value::from(self.defaults.heartbeat_interval),
                );
            }
            if !TIMEOUT_KEYS.iter().any(|k| map.contains_key(*k)) {
                map.insert(
                    "command_timeout".into(),
                    Value::from(self.defaults.command_timeout),
                );
            }
        }
        let config: AgentConfig = serde_json::from_value(value)
            .map_err(|e| RuntimeError::Config(format!("{origin}: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

/// 从 config 目录加载配置，环境变量 COMB__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 COMB__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("COMB")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn from_toml(text: &str) -> AppConfig {
        config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_sections_and_defaults() {
        let config = from_toml(
            r#"
            [app]
            agents_dir = "/nonexistent/agents"

            [bus]
            prefetch = 4

            [defaults]
            heartbeat_interval = 5

            [retry_policies.llm]
            attempts = 4
            initialDelay = 200

            [errors]
            error_threshold = 3

            [[recovery.strategies]]
            agentId = "writer"
            category = "timeout"
            strategy = "restart"

            [[agents]]
            id = "writer"

            [[agents]]
            id = "editor"
            commandTimeout = 2
            "#,
        );
        assert_eq!(config.bus.prefetch, 4);
        assert_eq!(config.bus.publish_timeout_ms, 5_000);
        assert_eq!(config.retry_policies["llm"].attempts, 4);
        assert_eq!(config.retry_policies["llm"].initial_delay, 200);
        assert_eq!(config.errors.error_threshold, 3);
        assert_eq!(config.recovery.strategies[0].agent_id.as_deref(), Some("writer"));
        assert_eq!(config.shutdown.step_timeout_secs, 10);

        let agents = config.agent_configs().unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(agents[0].command_timeout(), Duration::from_secs(60));
        assert_eq!(agents[1].command_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_agent_files_are_discovered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("b_publisher.toml"),
            "id = \"publisher\"\n[modules.out]\ntype = \"echo\"\nrequired = true\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("a_writer.toml"), "id = \"writer\"\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut config = AppConfig::default();
        config.app.agents_dir = dir.path().to_path_buf();
        let agents = config.agent_configs().unwrap();
        let ids: Vec<&str> = agents.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["writer", "publisher"]);
        assert!(agents[1].modules.get("out").unwrap().required);
    }

    #[test]
    fn test_duplicate_agent_ids_rejected() {
        let mut config = AppConfig::default();
        config.app.agents_dir = PathBuf::from("/nonexistent/agents");
        config.agents = vec![
            serde_json::json!({ "id": "writer" }),
            serde_json::json!({ "id": "writer" }),
        ];
        assert!(matches!(config.agent_configs(), Err(RuntimeError::Config(_))));
    }
}
