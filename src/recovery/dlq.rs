//! 死信队列（进程内）
//!
//! 所有策略用尽后的任务落到这里，只能由运维显式删除或重新入队。
//! 键为 `agent:module:category:task`，同键再次落入时只累加次数。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

/// 死信条目
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: String,
    pub key: String,
    pub agent_id: String,
    pub module_id: Option<String>,
    pub task_id: Option<String>,
    /// 重新入队时发送的命令类型
    pub command_type: String,
    pub payload: Value,
    pub error: String,
    pub category: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// 已尝试次数
    pub count: u32,
}

/// 插入参数
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub agent_id: String,
    pub module_id: Option<String>,
    pub task_id: Option<String>,
    pub command_type: String,
    pub payload: Value,
    pub error: String,
    pub category: String,
    pub attempts: u32,
}

impl DeadLetter {
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.agent_id,
            self.module_id.as_deref().unwrap_or("-"),
            self.category,
            self.task_id.as_deref().unwrap_or("-"),
        )
    }
}

#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    entries: Mutex<HashMap<String, DeadLetterEntry>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, letter: DeadLetter) -> DeadLetterEntry {
        let key = letter.key();
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        let entry = entries
            .entry(key.clone())
            .and_modify(|e| {
                e.last_seen = now;
                e.count = if letter.attempts > e.count {
                    letter.attempts
                } else {
                    e.count.saturating_add(1)
                };
                e.error = letter.error.clone();
                e.payload = letter.payload.clone();
            })
            .or_insert_with(|| DeadLetterEntry {
                id: uuid::Uuid::new_v4().to_string(),
                key,
                agent_id: letter.agent_id.clone(),
                module_id: letter.module_id.clone(),
                task_id: letter.task_id.clone(),
                command_type: letter.command_type.clone(),
                payload: letter.payload.clone(),
                error: letter.error.clone(),
                category: letter.category.clone(),
                first_seen: now,
                last_seen: now,
                count: letter.attempts.max(1),
            });
        entry.clone()
    }

    /// 按首次出现时间排序；agent_id 为 None 时返回全部
    pub async fn list(&self, agent_id: Option<&str>) -> Vec<DeadLetterEntry> {
        let mut out: Vec<DeadLetterEntry> = self
            .entries
            .lock()
            .await
            .values()
            .filter(|e| agent_id.map(|a| a == e.agent_id).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.first_seen.cmp(&b.first_seen));
        out
    }

    pub async fn get(&self, key: &str) -> Option<DeadLetterEntry> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.entries.lock().await.remove(key).is_some()
    }

    /// 取出条目（重新入队用）
    pub async fn take(&self, key: &str) -> Option<DeadLetterEntry> {
        self.entries.lock().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
