//! 恢复策略表
//!
//! 键为 (agentId?, moduleId?, category)，查找按特异性递减：
//! 精确三元组 → (agentId, *, category) → (*, *, category) → 内置默认。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::error::is_retryable_category;
use crate::resilience::RetryPolicy;

/// 通配符
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Retry,
    Restart,
    RestartModule,
    Fallback,
    Skip,
    DeadLetter,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Retry => "retry",
            Strategy::Restart => "restart",
            Strategy::RestartModule => "restart_module",
            Strategy::Fallback => "fallback",
            Strategy::Skip => "skip",
            Strategy::DeadLetter => "dead_letter",
        }
    }

    /// 是否需要向 Agent 发送恢复命令（执行期间该 Agent 处于恢复中）
    pub fn sends_command(&self) -> bool {
        matches!(
            self,
            Strategy::Retry | Strategy::Restart | Strategy::RestartModule | Strategy::Fallback
        )
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 策略参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StrategyConfig {
    /// retry：最多重试次数（总尝试 = maxRetries + 1）
    #[serde(alias = "max_retries", alias = "maxretries")]
    pub max_retries: Option<u32>,
    /// retry：完整重试策略，优先于 maxRetries
    pub policy: Option<RetryPolicy>,
    /// fallback：降级方法名
    #[serde(alias = "fallback_method", alias = "fallbackmethod")]
    pub fallback_method: Option<String>,
}

impl StrategyConfig {
    pub fn retries(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..Default::default()
        }
    }

    pub fn fallback(method: impl Into<String>) -> Self {
        Self {
            fallback_method: Some(method.into()),
            ..Default::default()
        }
    }

    /// 生效的重试策略
    pub fn retry_policy(&self, base: &RetryPolicy) -> RetryPolicy {
        if let Some(policy) = &self.policy {
            return policy.clone();
        }
        let mut policy = base.clone();
        if let Some(max) = self.max_retries {
            policy.attempts = max.saturating_add(1);
        }
        policy
    }
}

/// [[recovery.strategies]] 条目；agentId / moduleId 缺省或为 "*" 时表示任意
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyEntry {
    #[serde(default, alias = "agent_id", alias = "agentid")]
    pub agent_id: Option<String>,
    #[serde(default, alias = "module_id", alias = "moduleid")]
    pub module_id: Option<String>,
    pub category: String,
    pub strategy: Strategy,
    #[serde(default)]
    pub config: StrategyConfig,
}

impl StrategyEntry {
    pub fn new(category: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            agent_id: None,
            module_id: None,
            category: category.into(),
            strategy,
            config: StrategyConfig::default(),
        }
    }

    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn for_module(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    pub fn with_config(mut self, config: StrategyConfig) -> Self {
        self.config = config;
        self
    }
}

/// 命中的层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Specificity {
    Exact,
    Agent,
    Category,
    Default,
}

/// 查找结果
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStrategy {
    pub strategy: Strategy,
    pub config: StrategyConfig,
    pub specificity: Specificity,
}

type StrategyKey = (Option<String>, Option<String>, String);

fn normalize(id: Option<String>) -> Option<String> {
    id.filter(|s| !s.is_empty() && s != WILDCARD)
}

/// 内置默认：可重试类别 retry，其余 dead_letter
pub fn default_strategy(category: &str) -> Strategy {
    if is_retryable_category(category) {
        Strategy::Retry
    } else {
        Strategy::DeadLetter
    }
}

#[derive(Debug, Clone, Default)]
pub struct StrategyTable {
    entries: HashMap<StrategyKey, StrategyEntry>,
}

impl StrategyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = StrategyEntry>) -> Self {
        let mut table = Self::new();
        for entry in entries {
            table.insert(entry);
        }
        table
    }

    /// 同键条目后写覆盖先写
    pub fn insert(&mut self, mut entry: StrategyEntry) {
        entry.agent_id = normalize(entry.agent_id);
        entry.module_id = normalize(entry.module_id);
        let key = (
            entry.agent_id.clone(),
            entry.module_id.clone(),
            entry.category.clone(),
        );
        self.entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, agent_id: &str, module_id: Option<&str>, category: &str) -> ResolvedStrategy {
        let agent = Some(agent_id.to_string());
        let mut ladder: Vec<(StrategyKey, Specificity)> = Vec::with_capacity(3);
        if let Some(module) = module_id {
            ladder.push((
                (agent.clone(), Some(module.to_string()), category.to_string()),
                Specificity::Exact,
            ));
        }
        ladder.push(((agent, None, category.to_string()), Specificity::Agent));
        ladder.push(((None, None, category.to_string()), Specificity::Category));

        for (key, specificity) in ladder {
            if let Some(entry) = self.entries.get(&key) {
                return ResolvedStrategy {
                    strategy: entry.strategy,
                    config: entry.config.clone(),
                    specificity,
                };
            }
        }
        ResolvedStrategy {
            strategy: default_strategy(category),
            config: StrategyConfig::default(),
            specificity: Specificity::Default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder() -> StrategyTable {
        StrategyTable::from_entries([
            StrategyEntry::new("timeout", Strategy::Retry)
                .for_agent("A")
                .for_module("M")
                .with_config(StrategyConfig::retries(5)),
            StrategyEntry::new("timeout", Strategy::Restart).for_agent("A"),
            StrategyEntry::new("timeout", Strategy::Skip),
        ])
    }

    #[test]
    fn test_specificity_ladder() {
        let table = ladder();

        let exact = table.lookup("A", Some("M"), "timeout");
        assert_eq!(exact.strategy, Strategy::Retry);
        assert_eq!(exact.specificity, Specificity::Exact);
        assert_eq!(exact.config.max_retries, Some(5));

        let agent = table.lookup("A", Some("X"), "timeout");
        assert_eq!(agent.strategy, Strategy::Restart);
        assert_eq!(agent.specificity, Specificity::Agent);

        let category = table.lookup("B", Some("M"), "timeout");
        assert_eq!(category.strategy, Strategy::Skip);
        assert_eq!(category.specificity, Specificity::Category);
    }

    #[test]
    fn test_builtin_defaults() {
        let table = StrategyTable::new();
        assert_eq!(table.lookup("A", None, "rate_limit").strategy, Strategy::Retry);
        assert_eq!(table.lookup("A", None, "validation").strategy, Strategy::DeadLetter);
        assert_eq!(
            table.lookup("A", None, "module_init_failure").specificity,
            Specificity::Default
        );
    }

    #[test]
    fn test_wildcard_ids_are_normalized() {
        let toml = r#"
            agentId = "*"
            moduleId = "*"
            category = "transport"
            strategy = "restart_module"
        "#;
        let entry: StrategyEntry = toml::from_str(toml).unwrap();
        let table = StrategyTable::from_entries([entry]);
        let found = table.lookup("any", Some("m"), "transport");
        assert_eq!(found.strategy, Strategy::RestartModule);
        assert_eq!(found.specificity, Specificity::Category);
    }

    #[test]
    fn test_retry_policy_override() {
        let base = RetryPolicy::new(3, 10, 2.0, 100);
        assert_eq!(StrategyConfig::retries(5).retry_policy(&base).attempts, 6);
        assert_eq!(StrategyConfig::default().retry_policy(&base), base);
    }
}
