//! Echo 模块（测试与联调用）：原样回显 payload

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{Module, ModuleContext};
use crate::core::RuntimeError;

/// 回显模块；settings.prefix 存在时给 msg 字段加前缀
#[derive(Default)]
pub struct EchoModule {
    echoed: AtomicU64,
}

impl EchoModule {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Module for EchoModule {
    fn kind(&self) -> &str {
        "echo"
    }

    fn operations(&self) -> Vec<String> {
        vec!["echo".to_string()]
    }

    async fn execute(
        &self,
        operation: &str,
        payload: Value,
        ctx: &ModuleContext,
    ) -> Result<Value, RuntimeError> {
        if operation != "echo" {
            return Err(RuntimeError::UnknownCommand(operation.to_string()));
        }
        self.echoed.fetch_add(1, Ordering::Relaxed);
        let prefix = ctx.setting("prefix").and_then(|v| v.as_str());
        match (prefix, payload) {
            (Some(prefix), Value::Object(mut map)) => {
                if let Some(Value::String(msg)) = map.get("msg").cloned() {
                    map.insert("msg".into(), Value::String(format!("{prefix}{msg}")));
                }
                Ok(Value::Object(map))
            }
            (_, payload) => Ok(payload),
        }
    }

    async fn fallback(
        &self,
        method: &str,
        data: Value,
        _ctx: &ModuleContext,
    ) -> Option<Result<Value, RuntimeError>> {
        (method == "passthrough").then_some(Ok(data))
    }

    fn metrics(&self) -> Result<Map<String, Value>, RuntimeError> {
        let mut map = Map::new();
        map.insert("echoed".into(), Value::from(self.echoed.load(Ordering::Relaxed)));
        Ok(map)
    }
}
