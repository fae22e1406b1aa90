//! 错误记录存储
//!
//! ErrorStore 只约定契约；默认进程内存储，可选单文件 JSON 持久化（启动时加载，每次变更整体重写）。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::record::ErrorRecord;
use crate::core::RuntimeError;

/// 错误记录存储契约
#[async_trait]
pub trait ErrorStore: Send + Sync {
    /// 插入或覆盖
    async fn upsert(&self, record: &ErrorRecord) -> Result<(), RuntimeError>;

    async fn get(&self, id: &str) -> Result<Option<ErrorRecord>, RuntimeError>;

    async fn list(&self) -> Result<Vec<ErrorRecord>, RuntimeError>;
}

/// 进程内存储
#[derive(Debug, Default)]
pub struct InMemoryErrorStore {
    records: Mutex<HashMap<String, ErrorRecord>>,
}

impl InMemoryErrorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ErrorStore for InMemoryErrorStore {
    async fn upsert(&self, record: &ErrorRecord) -> Result<(), RuntimeError> {
        self.records
            .lock()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ErrorRecord>, RuntimeError> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<ErrorRecord>, RuntimeError> {
        let mut list: Vec<ErrorRecord> = self.records.lock().await.values().cloned().collect();
        list.sort_by(|a, b| a.first_seen.cmp(&b.first_seen));
        Ok(list)
    }
}

/// 单文件 JSON 存储：记录数组，pretty 格式
#[derive(Debug)]
pub struct JsonFileErrorStore {
    path: PathBuf,
    records: Mutex<HashMap<String, ErrorRecord>>,
}

impl JsonFileErrorStore {
    /// 打开存储；文件不存在时从空开始
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(data) if !data.trim().is_empty() => {
                let list: Vec<ErrorRecord> = serde_json::from_str(&data).map_err(|e| {
                    RuntimeError::system(format!("{}: {e}", path.display()), "storage")
                })?;
                list.into_iter().map(|r| (r.id.clone(), r)).collect()
            }
            Ok(_) => HashMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(RuntimeError::system(
                    format!("{}: {e}", path.display()),
                    "storage",
                ))
            }
        };
        tracing::info!(path = %path.display(), records = records.len(), "error store loaded");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, records: &HashMap<String, ErrorRecord>) -> Result<(), RuntimeError> {
        let storage = |e: String| RuntimeError::system(format!("{}: {e}", self.path.display()), "storage");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| storage(e.to_string()))?;
            }
        }
        let mut list: Vec<&ErrorRecord> = records.values().collect();
        list.sort_by(|a, b| a.first_seen.cmp(&b.first_seen));
        let data = serde_json::to_string_pretty(&list).map_err(|e| storage(e.to_string()))?;
        tokio::fs::write(&self.path, data)
            .await
            .map_err(|e| storage(e.to_string()))
    }
}

#[async_trait]
impl ErrorStore for JsonFileErrorStore {
    async fn upsert(&self, record: &ErrorRecord) -> Result<(), RuntimeError> {
        let mut records = self.records.lock().await;
        records.insert(record.id.clone(), record.clone());
        self.flush(&records).await
    }

    async fn get(&self, id: &str) -> Result<Option<ErrorRecord>, RuntimeError> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<ErrorRecord>, RuntimeError> {
        let mut list: Vec<ErrorRecord> = self.records.lock().await.values().cloned().collect();
        list.sort_by(|a, b| a.first_seen.cmp(&b.first_seen));
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::record::ErrorReport;
    use chrono::Utc;

    fn record(message: &str) -> ErrorRecord {
        ErrorRecord::new(
            &ErrorReport::from_error(&RuntimeError::agent(message, "timeout")).agent("writer"),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_memory_store_upsert() {
        let store = InMemoryErrorStore::new();
        let mut r = record("slow");
        store.upsert(&r).await.unwrap();
        r.count = 2;
        store.upsert(&r).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert_eq!(store.get(&r.id).await.unwrap().unwrap().count, 2);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors").join("records.json");

        let store = JsonFileErrorStore::open(&path).await.unwrap();
        let r = record("disk");
        store.upsert(&r).await.unwrap();
        drop(store);

        let reopened = JsonFileErrorStore::open(&path).await.unwrap();
        let loaded = reopened.get(&r.id).await.unwrap().unwrap();
        assert_eq!(loaded.sample_message, "disk");
        assert_eq!(loaded.agent_id.as_deref(), Some("writer"));

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"lastOccurred\""));
    }
}
