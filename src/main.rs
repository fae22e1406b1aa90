//! Comb - Agent 运行时进程入口
//!
//! 用法：`comb [config.toml]`。初始化日志、加载配置、装配运行时并启动所有 Agent，
//! 收到 Ctrl+C / SIGTERM 后按顺序关闭。

use std::path::PathBuf;

use anyhow::Context;
use comb::{load_config, observability, ModuleRegistry, Runtime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    let runtime = Runtime::bootstrap(config, ModuleRegistry::with_builtins())
        .await
        .context("Failed to bootstrap runtime")?;

    for startup in runtime.start_agents().await {
        match &startup.error {
            None => tracing::info!(agent = %startup.agent_id, status = %startup.status, "agent ready"),
            Some(e) => tracing::warn!(agent = %startup.agent_id, status = %startup.status, error = %e, "agent not started"),
        }
    }

    runtime.shutdown_manager().install_signal_handlers();
    runtime.wait_for_shutdown().await;

    let report = runtime.shutdown().await;
    if !report.is_clean() {
        tracing::warn!(
            failed = ?report.failed(),
            timed_out = ?report.timed_out(),
            "shutdown finished with incomplete steps"
        );
    }
    Ok(())
}
