//! 模块句柄：生命周期状态机 + 活动记录 + module.* 事件
//!
//! 生命周期操作对目标状态幂等；前置状态不满足时快速失败（未 initialized 不能 start）。
//! 模块出错统一经 handle_error：记录日志与活动、发布 module.error、置 error 状态，按需重新抛出。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{Module, ModuleContext};
use crate::bus::MessageBus;
use crate::core::{RuntimeError, Status};

#[derive(Debug)]
struct ModuleState {
    status: Status,
    last_activity: Option<DateTime<Utc>>,
    last_error: Option<String>,
    calls: u64,
    failures: u64,
}

/// Agent 持有的单个模块
pub struct ModuleHandle {
    id: String,
    required: bool,
    module: Arc<dyn Module>,
    ctx: ModuleContext,
    bus: Arc<MessageBus>,
    state: RwLock<ModuleState>,
}

impl ModuleHandle {
    pub fn new(
        module: Arc<dyn Module>,
        ctx: ModuleContext,
        required: bool,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            id: ctx.module_id.clone(),
            required,
            module,
            ctx,
            bus,
            state: RwLock::new(ModuleState {
                status: Status::Initializing,
                last_activity: None,
                last_error: None,
                calls: 0,
                failures: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_id(&self) -> &str {
        &self.ctx.agent_id
    }

    pub fn kind(&self) -> &str {
        self.module.kind()
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn operations(&self) -> Vec<String> {
        self.module.operations()
    }

    pub async fn status(&self) -> Status {
        self.state.read().await.status
    }

    pub async fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.last_activity
    }

    async fn set_status(&self, next: Status) {
        let mut state = self.state.write().await;
        if state.status != next && !state.status.can_transition_to(next) {
            tracing::debug!(module = %self.id, from = %state.status, to = %next, "forced module transition");
        }
        state.status = next;
        state.last_activity = Some(Utc::now());
    }

    async fn emit(&self, event_type: &str, mut payload: Value) {
        if let Value::Object(map) = &mut payload {
            map.insert("agentId".into(), Value::String(self.ctx.agent_id.clone()));
            map.insert("module".into(), Value::String(self.id.clone()));
        }
        if let Err(e) = self
            .bus
            .publish_event(&self.ctx.agent_id, event_type, payload)
            .await
        {
            tracing::warn!(module = %self.id, event = event_type, error = %e, "failed to publish module event");
        }
    }

    /// initializing → initialized；已初始化时为空操作
    pub async fn initialize(&self) -> Result<(), RuntimeError> {
        let current = self.status().await;
        if matches!(current, Status::Initialized | Status::Running) {
            return Ok(());
        }
        if current != Status::Initializing {
            self.set_status(Status::Initializing).await;
        }
        match self.module.initialize(&self.ctx).await {
            Ok(()) => {
                self.set_status(Status::Initialized).await;
                tracing::info!(agent = %self.ctx.agent_id, module = %self.id, "module initialized");
                self.emit("module.initialized", json!({ "status": "initialized" })).await;
                Ok(())
            }
            Err(e) => self.handle_error(e, json!({ "phase": "initialize" }), true).await,
        }
    }

    /// initialized → running；已运行时为空操作
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let current = self.status().await;
        if current == Status::Running {
            return Ok(());
        }
        if current != Status::Initialized {
            return Err(RuntimeError::module(
                &self.id,
                format!("cannot start module in status '{current}'"),
                "lifecycle",
            ));
        }
        match self.module.start(&self.ctx).await {
            Ok(()) => {
                self.set_status(Status::Running).await;
                tracing::info!(agent = %self.ctx.agent_id, module = %self.id, "module started");
                self.emit("module.started", json!({ "status": "running" })).await;
                Ok(())
            }
            Err(e) => self.handle_error(e, json!({ "phase": "start" }), true).await,
        }
    }

    /// → stopped；已停止时为空操作且不发事件
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        if self.status().await == Status::Stopped {
            return Ok(());
        }
        match self.module.stop(&self.ctx).await {
            Ok(()) => {
                self.set_status(Status::Stopped).await;
                tracing::info!(agent = %self.ctx.agent_id, module = %self.id, "module stopped");
                self.emit("module.stopped", json!({ "status": "stopped" })).await;
                Ok(())
            }
            Err(e) => self.handle_error(e, json!({ "phase": "stop" }), true).await,
        }
    }

    /// stop → initialize → start
    pub async fn restart(&self) -> Result<(), RuntimeError> {
        if let Err(e) = self.stop().await {
            tracing::warn!(module = %self.id, error = %e, "stop failed during restart, reinitializing anyway");
        }
        self.initialize().await?;
        self.start().await
    }

    /// 执行模块操作；running 或 error（降级）状态可执行，成功后回到 running
    pub async fn execute(
        &self,
        operation: &str,
        payload: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, RuntimeError> {
        let current = {
            let mut state = self.state.write().await;
            state.calls += 1;
            state.last_activity = Some(Utc::now());
            state.status
        };
        if !matches!(current, Status::Running | Status::Error) {
            return Err(RuntimeError::module(
                &self.id,
                format!("module not running (status: {current})"),
                "lifecycle",
            ));
        }

        let mut ctx = self.ctx.clone();
        ctx.cancel = cancel.clone();
        match self.module.execute(operation, payload, &ctx).await {
            Ok(value) => {
                if current == Status::Error {
                    self.set_status(Status::Running).await;
                    tracing::info!(module = %self.id, "module recovered after successful call");
                }
                Ok(value)
            }
            Err(RuntimeError::Cancelled) => Err(RuntimeError::Cancelled),
            Err(e) => {
                self.handle_error(e, json!({ "operation": operation }), true)
                    .await
                    .map(|_| Value::Null)
            }
        }
    }

    /// 调用模块降级方法
    pub async fn fallback(
        &self,
        method: &str,
        data: Value,
        cancel: &CancellationToken,
    ) -> Option<Result<Value, RuntimeError>> {
        let mut ctx = self.ctx.clone();
        ctx.cancel = cancel.clone();
        self.module.fallback(method, data, &ctx).await
    }

    /// 记录错误、发布 module.error、置 error 状态；rethrow 为 true 时原样返回错误
    pub async fn handle_error(
        &self,
        err: RuntimeError,
        context: Value,
        rethrow: bool,
    ) -> Result<(), RuntimeError> {
        tracing::error!(
            agent = %self.ctx.agent_id,
            module = %self.id,
            category = %err.category(),
            context = %context,
            error = %err,
            "module error"
        );
        {
            let mut state = self.state.write().await;
            state.failures += 1;
            state.last_error = Some(err.to_string());
            state.last_activity = Some(Utc::now());
            state.status = Status::Error;
        }
        self.emit(
            "module.error",
            json!({
                "context": context,
                "error": err.to_string(),
                "category": err.category(),
                "code": err.code(),
            }),
        )
        .await;
        if rethrow {
            Err(err)
        } else {
            Ok(())
        }
    }

    /// 依赖的熔断器未打开时返回 true
    pub async fn is_service_available(&self, service: &str) -> bool {
        self.ctx
            .resilience
            .check_circuit_breaker(service)
            .await
            .is_ok()
    }

    /// `{status, lastActivity, ...模块自定义}`
    pub async fn metrics(&self) -> Result<Value, RuntimeError> {
        let custom = self.module.metrics()?;
        let state = self.state.read().await;
        let mut map = serde_json::Map::new();
        map.insert("status".into(), Value::String(state.status.as_str().into()));
        map.insert(
            "lastActivity".into(),
            state
                .last_activity
                .map(|t| Value::String(t.to_rfc3339()))
                .unwrap_or(Value::Null),
        );
        map.insert("calls".into(), Value::from(state.calls));
        map.insert("failures".into(), Value::from(state.failures));
        if let Some(err) = &state.last_error {
            map.insert("lastError".into(), Value::String(err.clone()));
        }
        map.extend(custom);
        Ok(Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::EchoModule;
    use crate::resilience::{BreakerConfig, Resilience};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    struct FailingInit;

    #[async_trait]
    impl Module for FailingInit {
        fn kind(&self) -> &str {
            "failing"
        }

        async fn initialize(&self, _ctx: &ModuleContext) -> Result<(), RuntimeError> {
            Err(RuntimeError::module("M", "boom", "module_init_failure"))
        }

        async fn execute(
            &self,
            _operation: &str,
            _payload: Value,
            _ctx: &ModuleContext,
        ) -> Result<Value, RuntimeError> {
            Ok(Value::Null)
        }
    }

    async fn handle(module: Arc<dyn Module>) -> (ModuleHandle, Arc<MessageBus>, Arc<Resilience>) {
        let bus = MessageBus::local().await.unwrap();
        let mut policies = HashMap::new();
        policies.insert("once".to_string(), crate::resilience::RetryPolicy::new(1, 1, 2.0, 1));
        let resilience = Arc::new(Resilience::new(
            policies,
            BreakerConfig {
                failure_threshold: 1,
                cooldown_ms: 60_000,
            },
        ));
        let ctx = ModuleContext {
            agent_id: "A".into(),
            module_id: "M".into(),
            settings: Value::Null,
            resilience: resilience.clone(),
            cancel: CancellationToken::new(),
        };
        (ModuleHandle::new(module, ctx, true, bus.clone()), bus, resilience)
    }

    #[tokio::test]
    async fn test_lifecycle_is_idempotent() {
        let (m, bus, _) = handle(Arc::new(EchoModule::new())).await;
        let (_id, mut rx) = bus.subscribe_channel("module.*").await.unwrap();

        m.initialize().await.unwrap();
        m.initialize().await.unwrap();
        m.start().await.unwrap();
        m.start().await.unwrap();
        assert_eq!(m.status().await, Status::Running);
        m.stop().await.unwrap();
        m.stop().await.unwrap();
        assert_eq!(m.status().await, Status::Stopped);

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.event_type);
        }
        assert_eq!(seen, vec!["module.initialized", "module.started", "module.stopped"]);
    }

    #[tokio::test]
    async fn test_start_requires_initialized() {
        let (m, _, _) = handle(Arc::new(EchoModule::new())).await;
        assert!(m.start().await.is_err());
    }

    #[tokio::test]
    async fn test_init_failure_publishes_module_error() {
        let (m, bus, _) = handle(Arc::new(FailingInit)).await;
        let (_id, mut rx) = bus.subscribe_channel("module.error").await.unwrap();

        let err = m.initialize().await.unwrap_err();
        assert_eq!(err.to_string(), "Module 'M' error: boom");
        assert_eq!(m.status().await, Status::Error);

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload["module"], "M");
        assert_eq!(event.payload["code"], "MODULE_ERROR");
        assert_eq!(event.payload["context"]["phase"], "initialize");
    }

    #[tokio::test]
    async fn test_execute_and_metrics() {
        let (m, _, _) = handle(Arc::new(EchoModule::new())).await;
        let token = CancellationToken::new();
        assert!(m.execute("echo", json!({}), &token).await.is_err());

        m.initialize().await.unwrap();
        m.start().await.unwrap();
        let out = m.execute("echo", json!({"msg": "hi"}), &token).await.unwrap();
        assert_eq!(out, json!({"msg": "hi"}));

        let metrics = m.metrics().await.unwrap();
        assert_eq!(metrics["status"], "running");
        assert_eq!(metrics["echoed"], 1);
        assert!(metrics["lastActivity"].is_string());
    }

    #[tokio::test]
    async fn test_service_availability_follows_breaker() {
        let (m, _, resilience) = handle(Arc::new(EchoModule::new())).await;
        assert!(m.is_service_available("cms").await);
        let _: Result<(), _> = resilience
            .execute_with_retry("once", crate::resilience::CallOptions::service("cms"), || async {
                Err(RuntimeError::Transport("down".into()))
            })
            .await;
        assert!(!m.is_service_available("cms").await);
    }
}
