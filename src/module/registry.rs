//! 模块注册表
//!
//! 按类型名注册工厂函数，Agent 初始化时根据配置（kind + settings）构造模块实例。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::{EchoModule, Module};
use crate::core::RuntimeError;

/// 模块工厂：settings → 模块实例
pub type ModuleFactory =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn Module>, RuntimeError> + Send + Sync>;

/// 模块注册表：按名称存储工厂，支持 register / create / kinds
#[derive(Default, Clone)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置模块：echo
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("echo", |_settings| Ok(Arc::new(EchoModule::new()) as Arc<dyn Module>));
        registry
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Module>, RuntimeError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    /// 注册一个共享实例（每次 create 返回同一个 Arc）
    pub fn register_instance(&mut self, kind: impl Into<String>, module: Arc<dyn Module>) {
        self.register(kind, move |_| Ok(Arc::clone(&module)));
    }

    pub fn create(&self, kind: &str, settings: &Value) -> Result<Arc<dyn Module>, RuntimeError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| RuntimeError::NotFound(format!("module kind '{kind}'")))?;
        factory(settings)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_echo() {
        let registry = ModuleRegistry::with_builtins();
        assert_eq!(registry.kinds(), vec!["echo".to_string()]);
        let module = registry.create("echo", &Value::Null).unwrap();
        assert_eq!(module.kind(), "echo");
    }

    #[test]
    fn test_unknown_kind() {
        let registry = ModuleRegistry::new();
        assert!(matches!(
            registry.create("cms", &Value::Null),
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[test]
    fn test_shared_instance() {
        let mut registry = ModuleRegistry::new();
        let echo: Arc<dyn Module> = Arc::new(EchoModule::new());
        registry.register_instance("shared", echo.clone());
        let a = registry.create("shared", &Value::Null).unwrap();
        assert!(Arc::ptr_eq(&a, &echo));
    }
}
