//! 模块（C3）：Agent 持有的可插拔工作单元
//!
//! 具体模块只实现 Module 能力集（initialize / start / stop / execute / metrics）；
//! 生命周期状态、活动时间、module.* 事件与错误上报由 ModuleHandle 统一负责。

pub mod echo;
pub mod handle;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::core::RuntimeError;
use crate::resilience::{CallOptions, Resilience};

pub use echo::EchoModule;
pub use handle::ModuleHandle;
pub use registry::{ModuleFactory, ModuleRegistry};

/// 模块运行上下文（只含 ID 与服务，不持有 Agent 本身）
#[derive(Clone)]
pub struct ModuleContext {
    pub agent_id: String,
    pub module_id: String,
    pub settings: Value,
    pub resilience: Arc<Resilience>,
    pub cancel: CancellationToken,
}

impl ModuleContext {
    /// 通过熔断器 + 重试策略调用外部依赖
    pub async fn call<T, F, Fut>(
        &self,
        policy: &str,
        service: &str,
        operation: F,
    ) -> Result<T, RuntimeError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RuntimeError>>,
    {
        let options = CallOptions::service(service).with_cancel(self.cancel.clone());
        self.resilience
            .execute_with_retry(policy, options, operation)
            .await
    }

    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }
}

/// 模块能力集
///
/// 模块内部状态需自行保证并发安全（方法均为 &self）。
#[async_trait]
pub trait Module: Send + Sync {
    /// 模块类型名（注册表键）
    fn kind(&self) -> &str;

    /// 模块对外提供的操作；Agent 启动时自动注册为同名任务命令
    fn operations(&self) -> Vec<String> {
        Vec::new()
    }

    async fn initialize(&self, _ctx: &ModuleContext) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn start(&self, _ctx: &ModuleContext) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn stop(&self, _ctx: &ModuleContext) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// 执行一个操作
    async fn execute(
        &self,
        operation: &str,
        payload: Value,
        ctx: &ModuleContext,
    ) -> Result<Value, RuntimeError>;

    /// 降级方法；None 表示本模块没有该方法
    async fn fallback(
        &self,
        _method: &str,
        _data: Value,
        _ctx: &ModuleContext,
    ) -> Option<Result<Value, RuntimeError>> {
        None
    }

    /// 模块自定义指标
    fn metrics(&self) -> Result<Map<String, Value>, RuntimeError> {
        Ok(Map::new())
    }
}
