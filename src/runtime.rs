//! 运行时根（C7）：装配总线、错误处理器、恢复控制器与各 Agent
//!
//! 启动顺序：配置 → 消息总线 → 错误处理器 → 恢复控制器 → Agent；关闭顺序相反，
//! 由同一个取消信号驱动，每步有超时。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentConfig, AgentServices};
use crate::bus::{Command, CommandReply, MessageBus};
use crate::config::AppConfig;
use crate::core::{
    RuntimeError, ShutdownManager, ShutdownReason, ShutdownReport, ShutdownSequence, Status,
};
use crate::errors::ErrorHandler;
use crate::module::ModuleRegistry;
use crate::recovery::RecoveryController;
use crate::resilience::Resilience;

/// 单个 Agent 的启动结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStartup {
    pub agent_id: String,
    pub status: Status,
    pub error: Option<String>,
}

pub struct Runtime {
    config: AppConfig,
    shutdown: Arc<ShutdownManager>,
    bus: Arc<MessageBus>,
    errors: Arc<ErrorHandler>,
    recovery: Arc<RecoveryController>,
    resilience: Arc<Resilience>,
    registry: Arc<ModuleRegistry>,
    agents: RwLock<Vec<Arc<Agent>>>,
}

impl Runtime {
    /// 装配基础服务并创建配置中的 Agent（尚未初始化，可先注册自定义命令）
    pub async fn bootstrap(config: AppConfig, registry: ModuleRegistry) -> anyhow::Result<Self> {
        let shutdown = Arc::new(ShutdownManager::new());
        let token = shutdown.token();

        if !config.bus.endpoint.starts_with("local://") {
            anyhow::bail!("unsupported bus endpoint '{}'", config.bus.endpoint);
        }
        let bus = MessageBus::new(config.bus.clone());
        bus.connect().await.context("failed to connect message bus")?;

        let errors = ErrorHandler::open(config.errors.clone(), Arc::clone(&bus))
            .await
            .context("failed to open error store")?;
        errors.start(&token).await;

        let recovery = RecoveryController::new(config.recovery.clone(), Arc::clone(&bus));
        recovery
            .start(&token)
            .await
            .context("failed to start recovery controller")?;

        let agent_configs = config
            .agent_configs()
            .context("invalid agent configuration")?;
        let runtime = Self {
            resilience: Arc::new(config.resilience()),
            config,
            shutdown,
            bus,
            errors,
            recovery,
            registry: Arc::new(registry),
            agents: RwLock::new(Vec::new()),
        };
        for agent_config in agent_configs {
            runtime.add_agent(agent_config).await?;
        }
        tracing::info!(
            name = runtime.config.app.name.as_deref().unwrap_or("comb"),
            agents = runtime.agents.read().await.len(),
            "runtime bootstrapped"
        );
        Ok(runtime)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    pub fn recovery(&self) -> &Arc<RecoveryController> {
        &self.recovery
    }

    pub fn resilience(&self) -> &Arc<Resilience> {
        &self.resilience
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    pub fn token(&self) -> CancellationToken {
        self.shutdown.token()
    }

    pub fn services(&self) -> AgentServices {
        AgentServices {
            bus: Arc::clone(&self.bus),
            errors: Arc::clone(&self.errors),
            resilience: Arc::clone(&self.resilience),
        }
    }

    /// 新增 Agent；ID 已存在时报错
    pub async fn add_agent(&self, config: AgentConfig) -> Result<Arc<Agent>, RuntimeError> {
        let mut agents = self.agents.write().await;
        if agents.iter().any(|a| a.id() == config.id) {
            return Err(RuntimeError::Config(format!(
                "duplicate agent id '{}'",
                config.id
            )));
        }
        let agent = Agent::new(
            config,
            self.services(),
            Arc::clone(&self.registry),
            &self.shutdown.token(),
        );
        agents.push(Arc::clone(&agent));
        Ok(agent)
    }

    pub async fn agent(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.read().await.iter().find(|a| a.id() == id).cloned()
    }

    pub async fn agents(&self) -> Vec<Arc<Agent>> {
        self.agents.read().await.clone()
    }

    /// 按配置顺序初始化并启动所有 Agent；单个 Agent 失败停留在 error，不影响其余
    pub async fn start_agents(&self) -> Vec<AgentStartup> {
        let agents = self.agents().await;
        let mut out = Vec::with_capacity(agents.len());
        for agent in agents {
            let result = match agent.initialize().await {
                Ok(()) => agent.start().await,
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                tracing::error!(agent = %agent.id(), error = %e, "agent failed to start");
            }
            out.push(AgentStartup {
                agent_id: agent.id().to_string(),
                status: agent.status().await,
                error: result.err().map(|e| e.to_string()),
            });
        }
        out
    }

    /// 向 Agent 发送命令并等待回复
    pub async fn request(
        &self,
        agent_id: &str,
        command_type: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<CommandReply, RuntimeError> {
        let command = Command::new(agent_id, command_type, payload);
        self.bus.request(command, timeout).await
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown.wait_for_shutdown().await;
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_with(ShutdownReason::Requested).await
    }

    /// 逆序关闭：Agent → 恢复控制器 → 错误处理器 → 总线
    pub async fn shutdown_with(&self, reason: ShutdownReason) -> ShutdownReport {
        tracing::info!(?reason, "runtime shutting down");
        self.shutdown.shutdown(reason);

        let step_timeout = Duration::from_secs(self.config.shutdown.step_timeout_secs.max(1));
        let mut seq = ShutdownSequence::new(step_timeout);
        let agents = self.agents().await;
        for agent in agents.iter().rev() {
            seq.step(format!("agent:{}", agent.id()), async {
                agent.stop().await.map_err(anyhow::Error::from)
            })
            .await;
        }
        seq.step("recovery", async {
            self.recovery.stop().await;
            Ok(())
        })
        .await;
        seq.step("errors", async {
            self.errors.stop().await;
            Ok(())
        })
        .await;
        seq.step("bus", async {
            self.bus.shutdown().await;
            Ok(())
        })
        .await;

        let report = seq.finish();
        tracing::info!(
            completed = report.completed().len(),
            failed = report.failed().len(),
            timed_out = report.timed_out().len(),
            "runtime shut down"
        );
        report
    }
}
