//! Agent 监管者：模块生命周期、命令分发、事件订阅、心跳
//!
//! 状态机：initializing → initialized → running → stopped，error / unresponsive 可由任意状态进入。
//! 命令串行处理（每个 Agent 同一时刻只执行一条），每条命令与截止时间、取消信号竞速；
//! 失败统一发布 agent.command-failed，任务失败额外发布 agent.task-failed 供恢复控制器处理。

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::config::AgentConfig;
use super::handlers::{
    admits, BuiltinCommand, CommandFn, FallbackFn, HandlerContext, HandlerTable, Route,
};
use super::heartbeat::{resident_memory_kb, HeartbeatTask};
use crate::bus::{
    Command, CommandHandler, CommandOutcome, CommandReply, Event, EventHandler, MessageBus,
    TopicPattern,
};
use crate::core::{RuntimeError, Severity, Status};
use crate::errors::{ErrorHandler, ErrorReport};
use crate::module::{ModuleContext, ModuleHandle, ModuleRegistry};
use crate::resilience::Resilience;

/// Agent 依赖的服务（由运行时根注入）
#[derive(Clone)]
pub struct AgentServices {
    pub bus: Arc<MessageBus>,
    pub errors: Arc<ErrorHandler>,
    pub resilience: Arc<Resilience>,
}

/// 单个命令类型的统计
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStat {
    pub count: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub total_ms: u64,
    pub last_ms: u64,
}

#[derive(Debug, Default)]
struct CommandMetrics {
    by_type: HashMap<String, CommandStat>,
}

impl CommandMetrics {
    fn record(&mut self, command_type: &str, duration_ms: u64, error: Option<&RuntimeError>) {
        let stat = self.by_type.entry(command_type.to_string()).or_default();
        stat.count += 1;
        stat.total_ms += duration_ms;
        stat.last_ms = duration_ms;
        match error {
            Some(RuntimeError::Timeout(_)) => {
                stat.failures += 1;
                stat.timeouts += 1;
            }
            Some(RuntimeError::Cancelled) => {
                stat.failures += 1;
                stat.cancelled += 1;
            }
            Some(_) => stat.failures += 1,
            None => {}
        }
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(&self.by_type).unwrap_or(Value::Null)
    }
}

/// 任务失败/完成事件需要的字段
struct TaskInfo {
    task_id: String,
    task_type: String,
    original_data: Value,
    attempt: u64,
    module_id: Option<String>,
    workflow_id: Option<String>,
}

/// Agent 监管者
pub struct Agent {
    me: Weak<Agent>,
    config: AgentConfig,
    services: AgentServices,
    registry: Arc<ModuleRegistry>,
    status: RwLock<Status>,
    modules: RwLock<Vec<Arc<ModuleHandle>>>,
    handlers: RwLock<HandlerTable>,
    event_handlers: RwLock<Vec<(TopicPattern, EventHandler)>>,
    subscriptions: Mutex<Vec<String>>,
    /// 运行时级取消信号（生命周期命令使用）
    root: CancellationToken,
    /// 当前运行期的取消信号；stop 时取消，start 时更新
    lifecycle: Mutex<CancellationToken>,
    heartbeat: Mutex<Option<HeartbeatTask>>,
    /// 命令串行执行
    command_lock: Mutex<()>,
    /// 生命周期操作串行执行
    transition: Mutex<()>,
    metrics: Mutex<CommandMetrics>,
    local: broadcast::Sender<Event>,
    started_at: Instant,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        services: AgentServices,
        registry: Arc<ModuleRegistry>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let root = parent.child_token();
        let lifecycle = root.child_token();
        let (local, _) = broadcast::channel(256);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            services,
            registry,
            status: RwLock::new(Status::Initializing),
            modules: RwLock::new(Vec::new()),
            handlers: RwLock::new(HandlerTable::new()),
            event_handlers: RwLock::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            root,
            lifecycle: Mutex::new(lifecycle),
            heartbeat: Mutex::new(None),
            command_lock: Mutex::new(()),
            transition: Mutex::new(()),
            metrics: Mutex::new(CommandMetrics::default()),
            local,
            started_at: Instant::now(),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        self.config.display_name()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub async fn status(&self) -> Status {
        *self.status.read().await
    }

    /// 本进程内观察该 Agent 发布的所有事件
    pub fn observe(&self) -> broadcast::Receiver<Event> {
        self.local.subscribe()
    }

    pub async fn module(&self, id: &str) -> Option<Arc<ModuleHandle>> {
        self.modules
            .read()
            .await
            .iter()
            .find(|m| m.id() == id)
            .cloned()
    }

    pub async fn module_ids(&self) -> Vec<String> {
        self.modules
            .read()
            .await
            .iter()
            .map(|m| m.id().to_string())
            .collect()
    }

    pub async fn command_types(&self) -> Vec<String> {
        self.handlers.read().await.command_types()
    }

    pub async fn is_consuming(&self) -> bool {
        self.services.bus.is_consuming(self.id()).await
    }

    // ---------- 注册 ----------

    /// 注册普通命令
    pub async fn register(&self, command_type: impl Into<String>, handler: CommandFn) {
        self.handlers.write().await.register(command_type, handler);
    }

    /// 注册任务命令（失败时发布 agent.task-failed，可被恢复控制器重试）
    pub async fn register_task(&self, command_type: impl Into<String>, handler: CommandFn) {
        self.handlers.write().await.register_task(command_type, handler);
    }

    pub async fn register_fallback(&self, method: impl Into<String>, handler: FallbackFn) {
        self.handlers.write().await.register_fallback(method, handler);
    }

    /// 注册事件处理；initialize 时按模式订阅
    pub async fn on_event(&self, pattern: &str, handler: EventHandler) -> Result<(), RuntimeError> {
        let pattern = TopicPattern::parse(pattern)?;
        self.event_handlers.write().await.push((pattern, handler));
        Ok(())
    }

    // ---------- 事件 ----------

    /// 发布事件（source 为本 Agent），本地观察者同时收到
    pub async fn publish_event(&self, event_type: &str, payload: Value) -> Result<Event, RuntimeError> {
        let event = Event::new(self.id(), event_type, payload);
        let _ = self.local.send(event.clone());
        self.services.bus.publish(event.clone()).await?;
        Ok(event)
    }

    async fn emit(&self, event_type: &str, payload: Value) {
        if let Err(e) = self.publish_event(event_type, payload).await {
            tracing::warn!(agent = %self.id(), event = event_type, error = %e, "failed to publish event");
        }
    }

    async fn set_status(&self, next: Status) {
        let previous = {
            let mut status = self.status.write().await;
            if *status == next {
                return;
            }
            if !status.can_transition_to(next) {
                tracing::warn!(agent = %self.id(), from = %*status, to = %next, "unexpected status transition");
            }
            let previous = *status;
            *status = next;
            previous
        };
        tracing::info!(agent = %self.id(), from = %previous, to = %next, "agent status changed");
        self.emit(
            "agent.status-changed",
            json!({ "agentId": self.id(), "previousStatus": previous, "status": next }),
        )
        .await;
    }

    async fn report_error(&self, err: &RuntimeError, module_id: Option<&str>, severity: Severity) {
        let report = ErrorReport::from_error(err)
            .agent(self.id())
            .module(module_id)
            .severity(severity);
        if let Err(e) = self.services.errors.handle_error(report).await {
            tracing::warn!(agent = %self.id(), error = %e, "failed to record error");
        }
    }

    /// 生命周期失败：agent.failed → 上报 → error
    async fn fail_lifecycle(&self, category: &str, module_id: Option<&str>, err: &RuntimeError) {
        tracing::error!(agent = %self.id(), category, module = module_id.unwrap_or("-"), error = %err, "agent failed");
        self.emit(
            "agent.failed",
            json!({
                "agentId": self.id(),
                "category": category,
                "moduleId": module_id,
                "error": err.message(),
            }),
        )
        .await;
        self.report_error(err, module_id, Severity::High).await;
        self.set_status(Status::Error).await;
        // error 状态下仍需接收 restart / recover，由 admits 过滤其余命令
        if let Err(e) = self.ensure_consumer().await {
            tracing::warn!(agent = %self.id(), error = %e, "failed to attach command consumer");
        }
    }

    // ---------- 生命周期 ----------

    /// 初始化模块、注册命令、订阅事件、发送首次心跳；成功后为空操作
    pub async fn initialize(&self) -> Result<(), RuntimeError> {
        let _transition = self.transition.lock().await;
        self.initialize_locked().await
    }

    async fn initialize_locked(&self) -> Result<(), RuntimeError> {
        let status = self.status().await;
        if matches!(status, Status::Initialized | Status::Running) {
            return Ok(());
        }
        if let Err(e) = self.config.validate() {
            self.fail_lifecycle("config_invalid", None, &e).await;
            return Err(e);
        }
        if status != Status::Initializing {
            self.set_status(Status::Initializing).await;
        }

        self.handlers.write().await.register_builtins();
        self.build_modules().await?;

        {
            let modules = self.modules.read().await;
            let mut handlers = self.handlers.write().await;
            handlers.clear_module_routes();
            for module in modules.iter() {
                for operation in module.operations() {
                    if !handlers.register_module_operation(module.id(), &operation) {
                        tracing::debug!(agent = %self.id(), module = %module.id(), operation = %operation, "operation shadowed by existing handler");
                    }
                }
            }
        }

        if let Err(e) = self.subscribe_configured().await {
            self.fail_lifecycle("subscription_failure", None, &e).await;
            return Err(e);
        }

        self.send_heartbeat().await;
        self.set_status(Status::Initialized).await;
        Ok(())
    }

    async fn build_modules(&self) -> Result<(), RuntimeError> {
        let mut built = Vec::new();
        for (id, module_config) in self.config.modules.iter() {
            if !module_config.enabled {
                tracing::debug!(agent = %self.id(), module = %id, "module disabled");
                continue;
            }
            let kind = module_config.kind.clone().unwrap_or_else(|| id.clone());
            let ctx = ModuleContext {
                agent_id: self.id().to_string(),
                module_id: id.clone(),
                settings: module_config.settings.clone(),
                resilience: Arc::clone(&self.services.resilience),
                cancel: self.root.child_token(),
            };
            let result = match self.registry.create(&kind, &module_config.settings) {
                Ok(module) => {
                    let handle = Arc::new(ModuleHandle::new(
                        module,
                        ctx,
                        module_config.required,
                        Arc::clone(&self.services.bus),
                    ));
                    handle.initialize().await.map(|_| handle)
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(handle) => built.push(handle),
                Err(e) if module_config.required => {
                    *self.modules.write().await = built;
                    self.fail_lifecycle("module_init_failure", Some(id.as_str()), &e).await;
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(agent = %self.id(), module = %id, error = %e, "optional module failed to initialize, skipped");
                }
            }
        }
        *self.modules.write().await = built;
        Ok(())
    }

    /// 按配置顺序启动模块，启动命令消费者，进入 running
    pub async fn start(&self) -> Result<(), RuntimeError> {
        let _transition = self.transition.lock().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<(), RuntimeError> {
        let status = self.status().await;
        if status == Status::Running {
            return Ok(());
        }
        if status == Status::Stopped {
            self.initialize_locked().await?;
        }
        let status = self.status().await;
        if status != Status::Initialized {
            return Err(RuntimeError::AgentNotReady {
                agent: self.id().to_string(),
                status: status.to_string(),
            });
        }

        let modules = self.modules.read().await.clone();
        for module in &modules {
            if let Err(e) = module.start().await {
                if module.is_required() {
                    self.fail_lifecycle("module_start_failure", Some(module.id()), &e).await;
                    return Err(e);
                }
                tracing::warn!(agent = %self.id(), module = %module.id(), error = %e, "optional module failed to start");
            }
        }

        {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.is_cancelled() {
                *lifecycle = self.root.child_token();
            }
        }
        if let Err(e) = self.ensure_consumer().await {
            self.fail_lifecycle("consumer_failure", None, &e).await;
            return Err(e);
        }
        self.start_heartbeat().await;
        self.set_status(Status::Running).await;
        Ok(())
    }

    async fn ensure_consumer(&self) -> Result<(), RuntimeError> {
        if self.services.bus.is_consuming(self.id()).await {
            return Ok(());
        }
        self.services
            .bus
            .consume_commands(self.id(), consumer_handler(self.me.clone()))
            .await
    }

    async fn start_heartbeat(&self) {
        let mut heartbeat = self.heartbeat.lock().await;
        if let Some(old) = heartbeat.take() {
            old.cancel();
        }
        *heartbeat = Some(HeartbeatTask::spawn(
            self.me.clone(),
            self.config.heartbeat_interval(),
            &self.root,
        ));
    }

    async fn stop_heartbeat(&self) {
        if let Some(task) = self.heartbeat.lock().await.take() {
            task.cancel();
        }
    }

    /// 停止：取消心跳与在途命令、并发停止所有模块、停止消费；已停止时为空操作
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        let _transition = self.transition.lock().await;
        if self.status().await == Status::Stopped {
            return Ok(());
        }
        self.stop_heartbeat().await;
        self.lifecycle.lock().await.cancel();
        self.services.bus.stop_consuming(self.id()).await;
        self.stop_modules().await;
        self.unsubscribe_all().await;
        self.set_status(Status::Stopped).await;
        Ok(())
    }

    async fn stop_modules(&self) {
        let modules = self.modules.read().await.clone();
        let results = join_all(modules.iter().map(|m| async move { (m.id().to_string(), m.stop().await) })).await;
        for (id, result) in results {
            if let Err(e) = result {
                tracing::warn!(agent = %self.id(), module = %id, error = %e, "module failed to stop");
            }
        }
    }

    /// 完整重启：停止模块 → 重新初始化 → 启动（命令消费者保持）
    pub async fn restart(&self) -> Result<(), RuntimeError> {
        let _transition = self.transition.lock().await;
        tracing::info!(agent = %self.id(), "restarting agent");
        self.stop_heartbeat().await;
        self.stop_modules().await;
        self.set_status(Status::Initializing).await;
        self.initialize_locked().await?;
        self.start_locked().await
    }

    // ---------- 订阅 ----------

    async fn subscribe_configured(&self) -> Result<(), RuntimeError> {
        let mut subscriptions = self.subscriptions.lock().await;
        if !subscriptions.is_empty() {
            return Ok(());
        }
        let mut patterns: Vec<String> = self
            .config
            .subscriptions
            .iter()
            .map(|s| s.event.clone())
            .collect();
        for (pattern, _) in self.event_handlers.read().await.iter() {
            if !patterns.iter().any(|p| p == pattern.as_str()) {
                patterns.push(pattern.as_str().to_string());
            }
        }
        for pattern in patterns {
            let id = self
                .services
                .bus
                .subscribe(&pattern, subscription_handler(self.me.clone(), pattern.clone()))
                .await?;
            tracing::debug!(agent = %self.id(), pattern = %pattern, "subscribed");
            subscriptions.push(id);
        }
        Ok(())
    }

    async fn unsubscribe_all(&self) {
        let ids: Vec<String> = self.subscriptions.lock().await.drain(..).collect();
        for id in ids {
            self.services.bus.unsubscribe(&id).await;
        }
    }

    async fn dispatch_event(&self, pattern: &str, event: Event) -> Result<(), RuntimeError> {
        let handlers: Vec<EventHandler> = self
            .event_handlers
            .read()
            .await
            .iter()
            .filter(|(p, _)| p.as_str() == pattern)
            .map(|(_, h)| Arc::clone(h))
            .collect();
        if handlers.is_empty() {
            tracing::debug!(agent = %self.id(), event = %event.event_type, source = %event.source, "event received");
            return Ok(());
        }
        for handler in handlers {
            handler(event.clone()).await?;
        }
        Ok(())
    }

    // ---------- 命令 ----------

    /// 处理一条命令，返回回复信封；失败不会向上传播
    pub async fn handle_command(&self, command: Command) -> CommandReply {
        let started = Instant::now();
        let serial = self.command_lock.lock().await;
        let route = self.handlers.read().await.route(&command.command_type);
        let outcome = self.dispatch(&command, route.clone()).await;
        let duration = started.elapsed().as_millis() as u64;
        self.metrics
            .lock()
            .await
            .record(&command.command_type, duration, outcome.as_ref().err());

        let reply = match outcome {
            Ok(value) => {
                self.on_command_success(&command, route.as_ref(), &value, duration)
                    .await;
                CommandReply::ok(command.id.clone(), value, duration)
            }
            Err(err) => {
                self.on_command_failure(&command, route.as_ref(), &err, duration)
                    .await;
                CommandReply::failed(command.id.clone(), err.to_string(), duration)
            }
        };
        drop(serial);
        self.send_heartbeat().await;
        reply
    }

    async fn dispatch(&self, command: &Command, route: Option<Route>) -> Result<Value, RuntimeError> {
        let route = route.ok_or_else(|| RuntimeError::UnknownCommand(command.command_type.clone()))?;
        let status = self.status().await;
        if !admits(status, &command.command_type) {
            return Err(RuntimeError::AgentNotReady {
                agent: self.id().to_string(),
                status: status.to_string(),
            });
        }

        let deadline = command
            .timeout_ms()
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.command_timeout());
        let cancel = match &route {
            Route::Builtin(b) if b.is_lifecycle() => self.root.child_token(),
            _ => self.lifecycle.lock().await.child_token(),
        };

        tracing::debug!(agent = %self.id(), command = %command.command_type, id = %command.id, "handling command");
        let work = self.execute_route(route, command.clone(), cancel.clone());
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RuntimeError::Cancelled),
            r = tokio::time::timeout(deadline, work) => r.unwrap_or(Err(RuntimeError::Timeout(deadline))),
        };
        cancel.cancel();
        result
    }

    async fn execute_route(
        &self,
        route: Route,
        command: Command,
        cancel: CancellationToken,
    ) -> Result<Value, RuntimeError> {
        match route {
            Route::Builtin(builtin) => self.run_builtin(builtin, command, cancel).await,
            other => self.run_task(other, command, cancel).await,
        }
    }

    async fn run_task(
        &self,
        route: Route,
        command: Command,
        cancel: CancellationToken,
    ) -> Result<Value, RuntimeError> {
        match route {
            Route::Module { module, operation } => {
                let handle = self
                    .module(&module)
                    .await
                    .ok_or_else(|| RuntimeError::NotFound(format!("module '{module}'")))?;
                handle.execute(&operation, command.payload, &cancel).await
            }
            Route::Custom { handler, .. } => handler(self.handler_context(command, cancel).await).await,
            Route::Builtin(builtin) => Err(RuntimeError::validation_field(
                "taskType",
                format!("'{}' is not a task", builtin.name()),
            )),
        }
    }

    async fn handler_context(&self, command: Command, cancel: CancellationToken) -> HandlerContext {
        let modules = self
            .modules
            .read()
            .await
            .iter()
            .map(|m| (m.id().to_string(), Arc::clone(m)))
            .collect();
        HandlerContext {
            agent_id: self.id().to_string(),
            command,
            cancel,
            modules,
            bus: Arc::clone(&self.services.bus),
        }
    }

    async fn run_builtin(
        &self,
        builtin: BuiltinCommand,
        command: Command,
        cancel: CancellationToken,
    ) -> Result<Value, RuntimeError> {
        let payload = &command.payload;
        match builtin {
            BuiltinCommand::Start => {
                self.start().await?;
                Ok(json!({ "status": self.status().await }))
            }
            BuiltinCommand::Restart => {
                self.restart().await?;
                Ok(json!({ "status": self.status().await }))
            }
            BuiltinCommand::RestartModule => {
                let module_id = required_str(payload, "moduleId")?;
                let handle = self
                    .module(module_id)
                    .await
                    .ok_or_else(|| RuntimeError::NotFound(format!("module '{module_id}'")))?;
                handle.restart().await?;
                Ok(json!({ "moduleId": module_id, "status": handle.status().await }))
            }
            BuiltinCommand::Recover => {
                let reason = payload.get("reason").and_then(|v| v.as_str());
                if reason == Some("unresponsive") {
                    self.set_status(Status::Unresponsive).await;
                }
                self.restart().await?;
                Ok(json!({ "reason": reason, "status": self.status().await }))
            }
            BuiltinCommand::RetryTask => {
                let task_type = required_str(payload, "taskType")?;
                let route = self
                    .handlers
                    .read()
                    .await
                    .route(task_type)
                    .ok_or_else(|| RuntimeError::UnknownCommand(task_type.to_string()))?;
                let original = payload.get("originalData").cloned().unwrap_or(Value::Null);
                let task = Command::new(self.id(), task_type, original).with_id(command.id.clone());
                self.run_task(route, task, cancel).await
            }
            BuiltinCommand::UseFallback => self.run_fallback(command, cancel).await,
        }
    }

    /// 降级：先查 Agent 注册的降级表，再依次询问模块
    async fn run_fallback(&self, command: Command, cancel: CancellationToken) -> Result<Value, RuntimeError> {
        let method = required_str(&command.payload, "fallbackMethod")?.to_string();
        let data = command.payload.get("data").cloned().unwrap_or(Value::Null);
        let registered = self.handlers.read().await.fallback(&method);
        if let Some(fallback) = registered {
            let ctx = self.handler_context(command, cancel).await;
            return fallback(ctx, data).await;
        }

        let only = command
            .payload
            .get("moduleId")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let modules = self.modules.read().await.clone();
        for module in modules
            .iter()
            .filter(|m| only.as_deref().map(|id| id == m.id()).unwrap_or(true))
        {
            if let Some(result) = module.fallback(&method, data.clone(), &cancel).await {
                return result;
            }
        }
        Err(RuntimeError::NotFound(format!("fallback method '{method}'")))
    }

    async fn task_info(&self, command: &Command, route: Option<&Route>) -> TaskInfo {
        let payload = &command.payload;
        let str_field = |v: &Value, key: &str| v.get(key).and_then(|x| x.as_str()).map(str::to_string);
        match route {
            Some(Route::Builtin(BuiltinCommand::RetryTask)) => {
                let task_type = str_field(payload, "taskType").unwrap_or_default();
                let original_data = payload.get("originalData").cloned().unwrap_or(Value::Null);
                let module_id = match str_field(payload, "moduleId") {
                    Some(m) => Some(m),
                    None => self
                        .handlers
                        .read()
                        .await
                        .route(&task_type)
                        .and_then(|r| r.module_id().map(str::to_string)),
                };
                TaskInfo {
                    task_id: str_field(payload, "taskId").unwrap_or_else(|| command.id.clone()),
                    workflow_id: str_field(payload, "workflowId")
                        .or_else(|| str_field(&original_data, "workflowId")),
                    attempt: payload.get("attempt").and_then(|v| v.as_u64()).unwrap_or(2),
                    task_type,
                    original_data,
                    module_id,
                }
            }
            _ => TaskInfo {
                task_id: str_field(payload, "taskId").unwrap_or_else(|| command.id.clone()),
                task_type: command.command_type.clone(),
                original_data: payload.clone(),
                attempt: payload.get("attempt").and_then(|v| v.as_u64()).unwrap_or(1),
                module_id: route
                    .and_then(|r| r.module_id().map(str::to_string))
                    .or_else(|| str_field(payload, "moduleId")),
                workflow_id: str_field(payload, "workflowId"),
            },
        }
    }

    async fn on_command_success(&self, command: &Command, route: Option<&Route>, result: &Value, duration: u64) {
        if let Some(Route::Builtin(builtin)) = route {
            if builtin.is_recovery() {
                self.emit(
                    "agent.recovery-completed",
                    json!({
                        "agentId": self.id(),
                        "action": builtin.name(),
                        "commandId": command.id,
                        "taskId": command.payload.get("taskId"),
                    }),
                )
                .await;
            }
        }
        let task = self.task_info(command, route).await;
        self.emit(
            "agent.task-completed",
            json!({
                "agentId": self.id(),
                "commandId": command.id,
                "taskId": task.task_id,
                "taskType": task.task_type,
                "attempt": task.attempt,
                "workflowId": task.workflow_id,
                "result": result,
                "duration": duration,
            }),
        )
        .await;
    }

    async fn on_command_failure(&self, command: &Command, route: Option<&Route>, err: &RuntimeError, duration: u64) {
        let category = err.category();
        tracing::warn!(
            agent = %self.id(),
            command = %command.command_type,
            id = %command.id,
            category = %category,
            duration_ms = duration,
            error = %err,
            "command failed"
        );

        let retry_task = matches!(route, Some(Route::Builtin(BuiltinCommand::RetryTask)));
        if let Some(Route::Builtin(builtin)) = route {
            if builtin.is_recovery() {
                self.emit(
                    "agent.recovery-failed",
                    json!({
                        "agentId": self.id(),
                        "action": builtin.name(),
                        "commandId": command.id,
                        "taskId": command.payload.get("taskId"),
                        "category": category,
                        "error": err.message(),
                    }),
                )
                .await;
            }
        }

        self.emit(
            "agent.command-failed",
            json!({
                "agentId": self.id(),
                "commandId": command.id,
                "commandType": command.command_type,
                "category": category,
                "code": err.code(),
                "error": err.message(),
                "duration": duration,
            }),
        )
        .await;

        let task = self.task_info(command, route).await;
        if retry_task || route.map(Route::is_task).unwrap_or(false) {
            self.emit(
                "agent.task-failed",
                json!({
                    "agentId": self.id(),
                    "commandId": command.id,
                    "taskId": task.task_id,
                    "taskType": task.task_type,
                    "originalData": task.original_data,
                    "attempt": task.attempt,
                    "category": category,
                    "error": err.message(),
                    "moduleId": task.module_id,
                    "workflowId": task.workflow_id,
                }),
            )
            .await;
        }

        let severity = match err {
            RuntimeError::Cancelled => Severity::Low,
            _ => Severity::Medium,
        };
        self.report_error(err, task.module_id.as_deref(), severity).await;
    }

    // ---------- 心跳 ----------

    /// 等待当前命令执行完毕
    pub async fn wait_idle(&self) {
        let _idle = self.command_lock.lock().await;
    }

    pub async fn send_heartbeat(&self) {
        let status = self.status().await;
        let metrics = self.metrics().await;
        self.emit(
            "agent.heartbeat",
            json!({
                "agentId": self.id(),
                "status": status,
                "intervalMs": self.config.heartbeat_interval().as_millis() as u64,
                "metrics": metrics,
            }),
        )
        .await;
    }

    /// `{uptime, memory, modules, commands, breakers}`；单个模块指标失败只影响该模块
    pub async fn metrics(&self) -> Value {
        let mut modules = Map::new();
        for module in self.modules.read().await.iter() {
            let value = match module.metrics().await {
                Ok(v) => v,
                Err(e) => json!({ "error": e.to_string() }),
            };
            modules.insert(module.id().to_string(), value);
        }
        json!({
            "uptime": self.started_at.elapsed().as_secs_f64(),
            "memory": { "rssKb": resident_memory_kb() },
            "modules": modules,
            "commands": self.metrics.lock().await.to_value(),
            "breakers": self.services.resilience.breaker_snapshot().await,
        })
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

fn required_str<'a>(payload: &'a Value, key: &str) -> Result<&'a str, RuntimeError> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| RuntimeError::validation_field(key, format!("missing '{key}'")))
}

/// 总线命令消费者 → Agent::handle_command
fn consumer_handler(agent: Weak<Agent>) -> CommandHandler {
    Arc::new(move |command| {
        let agent = agent.clone();
        Box::pin(async move {
            match agent.upgrade() {
                Some(agent) => CommandOutcome::Reply(agent.handle_command(command).await),
                None => CommandOutcome::Requeue,
            }
        })
    })
}

/// 配置订阅 → Agent 事件处理
fn subscription_handler(agent: Weak<Agent>, pattern: String) -> EventHandler {
    Arc::new(move |event| {
        let agent = agent.clone();
        let pattern = pattern.clone();
        Box::pin(async move {
            match agent.upgrade() {
                Some(agent) => agent.dispatch_event(&pattern, event).await,
                None => Ok(()),
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::config::ModuleConfig;
    use crate::agent::handlers::{command_fn, fallback_fn};
    use crate::bus::event_handler;
    use crate::errors::ErrorsConfig;
    use crate::module::{EchoModule, Module};
    use crate::resilience::CallOptions;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    struct BrokenModule;

    #[async_trait]
    impl Module for BrokenModule {
        fn kind(&self) -> &str {
            "broken"
        }

        async fn initialize(&self, _ctx: &ModuleContext) -> Result<(), RuntimeError> {
            Err(RuntimeError::agent("boom", "module_init_failure"))
        }

        async fn execute(&self, _op: &str, _payload: Value, _ctx: &ModuleContext) -> Result<Value, RuntimeError> {
            Ok(Value::Null)
        }

        fn metrics(&self) -> Result<Map<String, Value>, RuntimeError> {
            Err(RuntimeError::agent("no metrics", "metrics"))
        }
    }

    struct Fixture {
        bus: Arc<MessageBus>,
        services: AgentServices,
        registry: Arc<ModuleRegistry>,
        token: CancellationToken,
    }

    async fn fixture() -> Fixture {
        let bus = MessageBus::local().await.unwrap();
        let errors = ErrorHandler::open(ErrorsConfig::default(), bus.clone()).await.unwrap();
        let mut registry = ModuleRegistry::with_builtins();
        registry.register("broken", |_| Ok(Arc::new(BrokenModule) as Arc<dyn Module>));
        Fixture {
            services: AgentServices {
                bus: bus.clone(),
                errors,
                resilience: Arc::new(Resilience::default()),
            },
            bus,
            registry: Arc::new(registry),
            token: CancellationToken::new(),
        }
    }

    fn echo_config() -> AgentConfig {
        AgentConfig::new("A").with_module(
            "M",
            ModuleConfig {
                required: true,
                kind: Some("echo".into()),
                ..Default::default()
            },
        )
    }

    fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn test_initialize_twice_is_noop() {
        let f = fixture().await;
        let agent = Agent::new(echo_config(), f.services.clone(), f.registry.clone(), &f.token);
        agent.initialize().await.unwrap();
        let (_id, mut rx) = f.bus.subscribe_channel("#").await.unwrap();
        agent.initialize().await.unwrap();
        assert_eq!(agent.status().await, Status::Initialized);
        assert!(drain(&mut rx).is_empty());
        assert!(agent.command_types().await.contains(&"echo".to_string()));
    }

    #[tokio::test]
    async fn test_optional_module_failure_is_skipped() {
        let f = fixture().await;
        let config = echo_config().with_module(
            "flaky",
            ModuleConfig {
                kind: Some("broken".into()),
                ..Default::default()
            },
        );
        let agent = Agent::new(config, f.services.clone(), f.registry.clone(), &f.token);
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();
        assert_eq!(agent.status().await, Status::Running);
        assert_eq!(agent.module_ids().await, vec!["M".to_string()]);
        assert!(agent.is_consuming().await);
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_required_module_failure_sets_error() {
        let f = fixture().await;
        let config = AgentConfig::new("A").with_module(
            "M",
            ModuleConfig {
                required: true,
                kind: Some("broken".into()),
                ..Default::default()
            },
        );
        let agent = Agent::new(config, f.services.clone(), f.registry.clone(), &f.token);
        let (_id, mut rx) = f.bus.subscribe_channel("agent.failed").await.unwrap();
        assert!(agent.initialize().await.is_err());
        assert_eq!(agent.status().await, Status::Error);
        let failed = drain(&mut rx);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].payload["category"], "module_init_failure");
        assert_eq!(failed[0].payload["moduleId"], "M");
        assert_eq!(failed[0].payload["error"], "boom");

        // error 状态只接受恢复类命令
        assert!(agent.is_consuming().await);
        let reply = f
            .bus
            .request(Command::new("A", "start", json!({})), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!reply.success);
        assert!(reply.error.unwrap().contains("not ready"));
        let reply = f
            .bus
            .request(Command::new("A", "restart", json!({})), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!reply.success);
        assert!(reply.error.unwrap().contains("boom"));
        assert_eq!(agent.status().await, Status::Error);
        agent.stop().await.unwrap();
        assert!(!agent.is_consuming().await);
    }

    #[tokio::test]
    async fn test_unknown_command_and_not_ready() {
        let f = fixture().await;
        let agent = Agent::new(echo_config(), f.services.clone(), f.registry.clone(), &f.token);
        agent.initialize().await.unwrap();

        let reply = agent.handle_command(Command::new("A", "echo", json!({}))).await;
        assert!(!reply.success);
        assert!(reply.error.unwrap().contains("not ready"));

        agent.start().await.unwrap();
        let reply = agent.handle_command(Command::new("A", "dance", json!({}))).await;
        assert_eq!(reply.error.as_deref(), Some("Unknown command: dance"));
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let f = fixture().await;
        let agent = Agent::new(echo_config(), f.services.clone(), f.registry.clone(), &f.token);
        agent
            .register(
                "slow",
                command_fn(|_ctx| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Value::Null)
                }),
            )
            .await;
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();
        let (_id, mut rx) = f.bus.subscribe_channel("agent.command-failed").await.unwrap();

        let reply = agent
            .handle_command(Command::new("A", "slow", json!({ "timeout": 20 })))
            .await;
        assert!(!reply.success);
        let failed = drain(&mut rx);
        assert_eq!(failed[0].payload["category"], "timeout");
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_command() {
        let f = fixture().await;
        let agent = Agent::new(echo_config(), f.services.clone(), f.registry.clone(), &f.token);
        agent
            .register(
                "wait",
                command_fn(|ctx| async move {
                    ctx.cancel.cancelled().await;
                    Err(RuntimeError::Cancelled)
                }),
            )
            .await;
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();
        let (_id, mut rx) = f.bus.subscribe_channel("agent.command-failed").await.unwrap();

        let a = agent.clone();
        let in_flight = tokio::spawn(async move { a.handle_command(Command::new("A", "wait", json!({}))).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        agent.stop().await.unwrap();

        let reply = in_flight.await.unwrap();
        assert_eq!(reply.error.as_deref(), Some("Cancelled"));
        let failed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(failed.payload["category"], "cancelled");
        assert_eq!(agent.status().await, Status::Stopped);
    }

    #[tokio::test]
    async fn test_stop_twice_emits_nothing() {
        let f = fixture().await;
        let agent = Agent::new(echo_config(), f.services.clone(), f.registry.clone(), &f.token);
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();
        agent.stop().await.unwrap();
        let (_id, mut rx) = f.bus.subscribe_channel("#").await.unwrap();
        agent.stop().await.unwrap();
        assert_eq!(agent.status().await, Status::Stopped);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_restart_module_and_fallbacks() {
        let f = fixture().await;
        let agent = Agent::new(echo_config(), f.services.clone(), f.registry.clone(), &f.token);
        agent
            .register_fallback(
                "cached",
                fallback_fn(|_ctx, data| async move { Ok(json!({ "cached": data })) }),
            )
            .await;
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();

        let reply = agent
            .handle_command(Command::new("A", "restart-module", json!({ "moduleId": "M" })))
            .await;
        assert!(reply.success, "{:?}", reply.error);

        let reply = agent
            .handle_command(Command::new("A", "use-fallback", json!({ "fallbackMethod": "cached", "data": 1 })))
            .await;
        assert_eq!(reply.result, Some(json!({ "cached": 1 })));

        let reply = agent
            .handle_command(Command::new("A", "use-fallback", json!({ "fallbackMethod": "passthrough", "data": "x" })))
            .await;
        assert_eq!(reply.result, Some(json!("x")));

        let reply = agent
            .handle_command(Command::new("A", "use-fallback", json!({ "fallbackMethod": "nope" })))
            .await;
        assert!(!reply.success);
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_recover_unresponsive_restarts() {
        let f = fixture().await;
        let agent = Agent::new(echo_config(), f.services.clone(), f.registry.clone(), &f.token);
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();
        let (_id, mut rx) = f.bus.subscribe_channel("agent.*").await.unwrap();

        let reply = agent
            .handle_command(Command::new("A", "recover", json!({ "reason": "unresponsive" })))
            .await;
        assert!(reply.success, "{:?}", reply.error);
        assert_eq!(agent.status().await, Status::Running);

        let statuses: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.event_type == "agent.status-changed")
            .map(|e| e.payload["status"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(statuses, vec!["unresponsive", "initializing", "initialized", "running"]);
        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_cover_initialized_modules() {
        let f = fixture().await;
        let config = echo_config().with_module(
            "N",
            ModuleConfig {
                kind: Some("broken".into()),
                ..Default::default()
            },
        );
        let agent = Agent::new(config, f.services.clone(), f.registry.clone(), &f.token);
        agent.initialize().await.unwrap();
        let metrics = agent.metrics().await;
        assert_eq!(metrics["modules"]["M"]["status"], "initialized");
        assert!(metrics["modules"].get("N").is_none());
        assert!(metrics["uptime"].is_number());
        assert_eq!(metrics["breakers"], json!([]));

        let _ = f
            .services
            .resilience
            .execute_with_retry("default", CallOptions::service("cms"), || async {
                Err::<(), _>(RuntimeError::validation("rejected"))
            })
            .await;
        let metrics = agent.metrics().await;
        assert_eq!(metrics["breakers"][0]["service"], "cms");
        assert_eq!(metrics["breakers"][0]["state"], "closed");
        assert_eq!(metrics["breakers"][0]["consecutiveFailures"], 0);
    }

    #[tokio::test]
    async fn test_periodic_heartbeat_and_events() {
        let f = fixture().await;
        let config = echo_config()
            .with_heartbeat_interval(Duration::from_millis(20))
            .with_subscription("workflow.*");
        let agent = Agent::new(config, f.services.clone(), f.registry.clone(), &f.token);
        let seen = Arc::new(AtomicU32::new(0));
        let s = seen.clone();
        agent
            .on_event(
                "workflow.*",
                event_handler(move |_event| {
                    let s = s.clone();
                    async move {
                        s.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
        let mut local = agent.observe();
        agent.initialize().await.unwrap();
        agent.start().await.unwrap();

        f.bus.publish_event("scheduler", "workflow.started", json!({})).await.unwrap();
        let mut heartbeats = 0;
        while heartbeats < 2 {
            let event = tokio::time::timeout(Duration::from_secs(1), local.recv()).await.unwrap().unwrap();
            if event.event_type == "agent.heartbeat" && event.payload["status"] == "running" {
                heartbeats += 1;
            }
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        agent.stop().await.unwrap();
    }
}
