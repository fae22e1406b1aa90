//! 命令表与降级表
//!
//! 命令类型到处理方式的显式映射，在 Agent 初始化时构建：
//! 内置恢复命令、模块操作（任务）、具体 Agent 自行注册的处理函数。

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::bus::{Command, MessageBus};
use crate::core::{RuntimeError, Status};
use crate::module::ModuleHandle;

/// 处理函数可见的上下文（只有 ID 与服务，不持有 Agent）
#[derive(Clone)]
pub struct HandlerContext {
    pub agent_id: String,
    pub command: Command,
    pub cancel: CancellationToken,
    pub modules: HashMap<String, Arc<ModuleHandle>>,
    pub bus: Arc<MessageBus>,
}

impl HandlerContext {
    pub fn payload(&self) -> &Value {
        &self.command.payload
    }

    pub fn module(&self, id: &str) -> Result<Arc<ModuleHandle>, RuntimeError> {
        self.modules
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("module '{id}'")))
    }
}

pub type CommandFn =
    Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, Result<Value, RuntimeError>> + Send + Sync>;
pub type FallbackFn = Arc<
    dyn Fn(HandlerContext, Value) -> BoxFuture<'static, Result<Value, RuntimeError>> + Send + Sync,
>;

/// 每个 Agent 都接受的内置命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinCommand {
    Start,
    Restart,
    RestartModule,
    Recover,
    RetryTask,
    UseFallback,
}

impl BuiltinCommand {
    pub const ALL: [BuiltinCommand; 6] = [
        BuiltinCommand::Start,
        BuiltinCommand::Restart,
        BuiltinCommand::RestartModule,
        BuiltinCommand::Recover,
        BuiltinCommand::RetryTask,
        BuiltinCommand::UseFallback,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinCommand::Start => "start",
            BuiltinCommand::Restart => "restart",
            BuiltinCommand::RestartModule => "restart-module",
            BuiltinCommand::Recover => "recover",
            BuiltinCommand::RetryTask => "retry-task",
            BuiltinCommand::UseFallback => "use-fallback",
        }
    }

    /// 恢复命令结束时发布 agent.recovery-completed / agent.recovery-failed
    pub fn is_recovery(&self) -> bool {
        !matches!(self, BuiltinCommand::Start)
    }

    /// 生命周期命令不随 stop 取消
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            BuiltinCommand::Start
                | BuiltinCommand::Restart
                | BuiltinCommand::RestartModule
                | BuiltinCommand::Recover
        )
    }
}

/// 命令路由
#[derive(Clone)]
pub enum Route {
    Builtin(BuiltinCommand),
    /// 模块操作（任务）
    Module { module: String, operation: String },
    /// 自定义处理函数；task 为 true 时失败会发布 agent.task-failed
    Custom { handler: CommandFn, task: bool },
}

impl Route {
    pub fn is_task(&self) -> bool {
        match self {
            Route::Builtin(_) => false,
            Route::Module { .. } => true,
            Route::Custom { task, .. } => *task,
        }
    }

    pub fn module_id(&self) -> Option<&str> {
        match self {
            Route::Module { module, .. } => Some(module),
            _ => None,
        }
    }
}

/// 状态是否允许执行该命令
///
/// error / unresponsive 只接受 restart* 与 recover*；stopped 只接受 start 与 restart。
pub fn admits(status: Status, command_type: &str) -> bool {
    match status {
        Status::Running => true,
        Status::Error | Status::Unresponsive => {
            command_type.starts_with("restart") || command_type.starts_with("recover")
        }
        Status::Stopped => command_type == "start" || command_type == "restart",
        Status::Initializing | Status::Initialized => false,
    }
}

/// 命令表 + 降级表
#[derive(Default, Clone)]
pub struct HandlerTable {
    routes: HashMap<String, Route>,
    fallbacks: HashMap<String, FallbackFn>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, command_type: impl Into<String>, handler: CommandFn) {
        self.routes.insert(
            command_type.into(),
            Route::Custom {
                handler,
                task: false,
            },
        );
    }

    pub fn register_task(&mut self, command_type: impl Into<String>, handler: CommandFn) {
        self.routes
            .insert(command_type.into(), Route::Custom { handler, task: true });
    }

    /// 模块操作注册为同名任务；已有同名路由时保留原路由
    pub fn register_module_operation(&mut self, module: &str, operation: &str) -> bool {
        if self.routes.contains_key(operation) {
            return false;
        }
        self.routes.insert(
            operation.to_string(),
            Route::Module {
                module: module.to_string(),
                operation: operation.to_string(),
            },
        );
        true
    }

    pub fn register_builtins(&mut self) {
        for builtin in BuiltinCommand::ALL {
            self.routes
                .insert(builtin.name().to_string(), Route::Builtin(builtin));
        }
    }

    /// 移除模块操作路由（重建前调用）
    pub fn clear_module_routes(&mut self) {
        self.routes.retain(|_, r| !matches!(r, Route::Module { .. }));
    }

    pub fn register_fallback(&mut self, method: impl Into<String>, handler: FallbackFn) {
        self.fallbacks.insert(method.into(), handler);
    }

    pub fn route(&self, command_type: &str) -> Option<Route> {
        self.routes.get(command_type).cloned()
    }

    pub fn fallback(&self, method: &str) -> Option<FallbackFn> {
        self.fallbacks.get(method).cloned()
    }

    pub fn command_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.routes.keys().cloned().collect();
        types.sort();
        types
    }
}

/// 把 async 闭包包装为 CommandFn
pub fn command_fn<F, Fut>(f: F) -> CommandFn
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, RuntimeError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// 把 async 闭包包装为 FallbackFn
pub fn fallback_fn<F, Fut>(f: F) -> FallbackFn
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, RuntimeError>> + Send + 'static,
{
    Arc::new(move |ctx, data| Box::pin(f(ctx, data)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_rules() {
        assert!(admits(Status::Running, "publish"));
        assert!(admits(Status::Error, "restart"));
        assert!(admits(Status::Error, "restart-module"));
        assert!(admits(Status::Unresponsive, "recover"));
        assert!(!admits(Status::Error, "retry-task"));
        assert!(admits(Status::Stopped, "start"));
        assert!(admits(Status::Stopped, "restart"));
        assert!(!admits(Status::Stopped, "recover"));
        assert!(!admits(Status::Initialized, "echo"));
    }

    #[test]
    fn test_module_operation_does_not_shadow_custom() {
        let mut table = HandlerTable::new();
        table.register("echo", command_fn(|_ctx| async { Ok(Value::Null) }));
        assert!(!table.register_module_operation("M", "echo"));
        assert!(table.register_module_operation("M", "summarize"));
        assert!(matches!(table.route("echo"), Some(Route::Custom { task: false, .. })));
        assert_eq!(table.route("summarize").unwrap().module_id(), Some("M"));

        table.clear_module_routes();
        assert!(table.route("summarize").is_none());
        assert!(table.route("echo").is_some());
    }

    #[test]
    fn test_builtins_registered() {
        let mut table = HandlerTable::new();
        table.register_builtins();
        for name in ["start", "restart", "restart-module", "recover", "retry-task", "use-fallback"] {
            assert!(matches!(table.route(name), Some(Route::Builtin(_))), "{name}");
        }
        assert!(BuiltinCommand::RetryTask.is_recovery());
        assert!(!BuiltinCommand::Start.is_recovery());
    }
}
