//! 错误处理器：聚合、持久化、告警事件、后台模式检测
//!
//! 聚合键 (kind, category, agent, module)；同键错误只累加计数，
//! 且每条聚合记录在 publish_window 内最多发布一次 error.* 事件。critical 级别额外发布 system.critical。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::pattern::{DetectedPattern, PatternConfig, PatternDetector};
use super::record::{AggregateKey, ErrorRecord, ErrorReport, ErrorStatistics};
use super::store::{ErrorStore, InMemoryErrorStore, JsonFileErrorStore};
use crate::bus::MessageBus;
use crate::core::{RuntimeError, Severity};

/// 事件源名
pub const ERROR_HANDLER_SOURCE: &str = "error-handler";

/// [errors] 配置段（毫秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ErrorsConfig {
    pub check_interval_ms: u64,
    /// 缺省为 10 × check_interval
    pub window_ms: Option<u64>,
    pub error_threshold: usize,
    /// 缺省等于窗口
    pub cooldown_ms: Option<u64>,
    /// 同一聚合记录两次 error.* 事件的最小间隔
    pub publish_window_ms: u64,
    /// 设置后使用 JSON 文件存储
    pub store_path: Option<PathBuf>,
}

impl Default for ErrorsConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 60_000,
            window_ms: None,
            error_threshold: 10,
            cooldown_ms: None,
            publish_window_ms: 60_000,
            store_path: None,
        }
    }
}

impl ErrorsConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    pub fn window(&self) -> Duration {
        self.window_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.check_interval() * 10)
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.window())
    }

    pub fn pattern_config(&self) -> PatternConfig {
        PatternConfig {
            threshold: self.error_threshold,
            window: self.window(),
            cooldown: self.cooldown(),
        }
    }
}

struct ScanTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 错误处理器
pub struct ErrorHandler {
    config: ErrorsConfig,
    bus: Arc<MessageBus>,
    store: Arc<dyn ErrorStore>,
    /// 聚合索引；持锁期间完成读改写，保证写入串行
    index: Mutex<HashMap<AggregateKey, String>>,
    last_published: Mutex<HashMap<String, Instant>>,
    detector: Mutex<PatternDetector>,
    scan: Mutex<Option<ScanTask>>,
}

impl ErrorHandler {
    /// 按配置选择存储：store_path 存在时使用 JSON 文件
    pub async fn open(config: ErrorsConfig, bus: Arc<MessageBus>) -> Result<Arc<Self>, RuntimeError> {
        let store: Arc<dyn ErrorStore> = match &config.store_path {
            Some(path) => Arc::new(JsonFileErrorStore::open(path).await?),
            None => Arc::new(InMemoryErrorStore::new()),
        };
        Self::with_store(config, bus, store).await
    }

    /// 使用给定存储；已有记录重建聚合索引
    pub async fn with_store(
        config: ErrorsConfig,
        bus: Arc<MessageBus>,
        store: Arc<dyn ErrorStore>,
    ) -> Result<Arc<Self>, RuntimeError> {
        let mut index = HashMap::new();
        for record in store.list().await? {
            index.insert(record.key(), record.id.clone());
        }
        let detector = PatternDetector::new(config.pattern_config());
        Ok(Arc::new(Self {
            config,
            bus,
            store,
            index: Mutex::new(index),
            last_published: Mutex::new(HashMap::new()),
            detector: Mutex::new(detector),
            scan: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &ErrorsConfig {
        &self.config
    }

    /// 记录一次错误，返回聚合记录 ID
    pub async fn handle_error(&self, report: ErrorReport) -> Result<String, RuntimeError> {
        let now = Utc::now();
        let record = {
            let mut index = self.index.lock().await;
            let key = report.key();
            let existing = match index.get(&key) {
                Some(id) => self.store.get(id).await?,
                None => None,
            };
            let record = match existing {
                Some(mut record) => {
                    record.touch(&report, now);
                    record
                }
                None => ErrorRecord::new(&report, now),
            };
            self.store.upsert(&record).await?;
            index.insert(key, record.id.clone());
            record
        };

        self.detector.lock().await.record(&report);

        tracing::warn!(
            error_id = %record.id,
            kind = %report.kind,
            category = %report.category,
            agent = report.agent_id.as_deref().unwrap_or("-"),
            module = report.module_id.as_deref().unwrap_or("-"),
            severity = %report.severity,
            count = record.count,
            message = %report.message,
            "error recorded"
        );

        if self.should_publish(&record.id).await {
            self.publish(report.kind.event_type(), record_payload(&record, &report))
                .await;
        }
        if report.severity == Severity::Critical {
            self.publish("system.critical", record_payload(&record, &report))
                .await;
        }
        Ok(record.id)
    }

    async fn should_publish(&self, id: &str) -> bool {
        let window = Duration::from_millis(self.config.publish_window_ms);
        let now = Instant::now();
        let mut last = self.last_published.lock().await;
        match last.get(id) {
            Some(at) if now.duration_since(*at) < window => false,
            _ => {
                last.insert(id.to_string(), now);
                true
            }
        }
    }

    async fn publish(&self, event_type: &str, payload: Value) {
        if let Err(e) = self
            .bus
            .publish_event(ERROR_HANDLER_SOURCE, event_type, payload)
            .await
        {
            tracing::error!(event = event_type, error = %e, "failed to publish error event");
        }
    }

    pub async fn get_error_statistics(&self) -> Result<ErrorStatistics, RuntimeError> {
        let records = self.store.list().await?;
        Ok(ErrorStatistics::from_records(&records))
    }

    /// 标记已解决；未知 ID 返回 NotFound
    pub async fn resolve_error(
        &self,
        id: &str,
        resolution: impl Into<String>,
        resolved_by: impl Into<String>,
    ) -> Result<ErrorRecord, RuntimeError> {
        let _index = self.index.lock().await;
        let mut record = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(format!("error '{id}'")))?;
        record.resolved = true;
        record.resolution = Some(resolution.into());
        record.resolved_by = Some(resolved_by.into());
        record.resolved_at = Some(Utc::now());
        self.store.upsert(&record).await?;
        tracing::info!(error_id = id, resolved_by = ?record.resolved_by, "error resolved");
        Ok(record)
    }

    pub async fn get_error(&self, id: &str) -> Result<Option<ErrorRecord>, RuntimeError> {
        self.store.get(id).await
    }

    pub async fn list_errors(&self, unresolved_only: bool) -> Result<Vec<ErrorRecord>, RuntimeError> {
        let records = self.store.list().await?;
        Ok(records
            .into_iter()
            .filter(|r| !unresolved_only || !r.resolved)
            .collect())
    }

    /// 扫描一次并发布新检测到的 error.pattern
    pub async fn detect_patterns(&self) -> Vec<DetectedPattern> {
        let found = self.detector.lock().await.scan();
        for pattern in &found {
            tracing::warn!(
                category = %pattern.category,
                component = %pattern.component,
                occurrences = pattern.occurrences,
                "error pattern detected"
            );
            self.publish("error.pattern", pattern.to_payload()).await;
        }
        found
    }

    /// 启动后台扫描；第一次扫描在一个 check_interval 之后
    pub async fn start(self: &Arc<Self>, parent: &CancellationToken) {
        let mut scan = self.scan.lock().await;
        if scan.is_some() {
            return;
        }
        let token = parent.child_token();
        let interval = self.config.check_interval();
        let handler = Arc::downgrade(self);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match handler.upgrade() {
                    Some(handler) => {
                        handler.detect_patterns().await;
                    }
                    None => break,
                }
            }
            tracing::debug!("error pattern scan stopped");
        });
        tracing::info!(
            check_interval_ms = interval.as_millis() as u64,
            window_ms = self.config.window().as_millis() as u64,
            threshold = self.config.error_threshold,
            "error pattern scan started"
        );
        *scan = Some(ScanTask { token, handle });
    }

    pub async fn stop(&self) {
        if let Some(task) = self.scan.lock().await.take() {
            task.token.cancel();
            let _ = task.handle.await;
        }
    }
}

fn record_payload(record: &ErrorRecord, report: &ErrorReport) -> Value {
    json!({
        "errorId": record.id,
        "kind": record.kind,
        "category": record.category,
        "code": record.code,
        "message": report.message,
        "agentId": record.agent_id,
        "moduleId": record.module_id,
        "severity": report.severity,
        "count": record.count,
        "firstSeen": record.first_seen.to_rfc3339(),
        "lastOccurred": record.last_occurred.to_rfc3339(),
        "context": report.context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn config() -> ErrorsConfig {
        ErrorsConfig {
            check_interval_ms: 60_000,
            window_ms: Some(500),
            error_threshold: 3,
            cooldown_ms: None,
            publish_window_ms: 60_000,
            store_path: None,
        }
    }

    async fn setup() -> (Arc<ErrorHandler>, mpsc::Receiver<crate::bus::Event>) {
        let bus = MessageBus::local().await.unwrap();
        let (_id, rx) = bus.subscribe_channel("#").await.unwrap();
        let handler = ErrorHandler::open(config(), bus).await.unwrap();
        (handler, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<crate::bus::Event>) -> Vec<crate::bus::Event> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn test_aggregation_publishes_once_per_window() {
        let (handler, mut rx) = setup().await;
        let report = ErrorReport::from_error(&RuntimeError::agent("slow", "timeout")).agent("writer");
        let a = handler.handle_error(report.clone()).await.unwrap();
        let b = handler.handle_error(report).await.unwrap();
        assert_eq!(a, b);

        let record = handler.get_error(&a).await.unwrap().unwrap();
        assert_eq!(record.count, 2);
        let events = drain(&mut rx);
        assert_eq!(events.iter().filter(|e| e.event_type == "error.agent").count(), 1);
    }

    #[tokio::test]
    async fn test_critical_escalates() {
        let (handler, mut rx) = setup().await;
        handler
            .handle_error(ErrorReport::from_error(&RuntimeError::BusUnavailable).severity(Severity::Critical))
            .await
            .unwrap();
        let types: Vec<String> = drain(&mut rx).into_iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec!["error.system", "system.critical"]);
    }

    #[tokio::test]
    async fn test_statistics_and_resolve() {
        let (handler, _rx) = setup().await;
        let id = handler
            .handle_error(ErrorReport::from_error(&RuntimeError::validation("bad")).agent("signup"))
            .await
            .unwrap();
        handler
            .handle_error(ErrorReport::from_error(&RuntimeError::module("cms", "down", "database")).agent("writer").module(Some("cms")))
            .await
            .unwrap();

        let stats = handler.get_error_statistics().await.unwrap();
        assert_eq!(stats.total_errors, 2);
        assert_eq!(stats.by_component["cms"], 1);
        assert_eq!(stats.by_kind["ValidationError"], 1);

        let resolved = handler.resolve_error(&id, "fixed form", "ops").await.unwrap();
        assert!(resolved.resolved);
        assert!(resolved.resolved_at.is_some());
        assert_eq!(handler.list_errors(true).await.unwrap().len(), 1);
        assert!(matches!(
            handler.resolve_error("missing", "x", "ops").await,
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_pattern_emitted_once() {
        let (handler, mut rx) = setup().await;
        for _ in 0..5 {
            handler
                .handle_error(ErrorReport::from_error(&RuntimeError::validation_field("email", "invalid")).agent("signup"))
                .await
                .unwrap();
        }
        assert_eq!(handler.detect_patterns().await.len(), 1);
        assert!(handler.detect_patterns().await.is_empty());
        let patterns: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.event_type == "error.pattern")
            .collect();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].payload["occurrences"], 5);
        assert_eq!(patterns[0].payload["fieldName"], "email");
    }

    #[tokio::test]
    async fn test_background_scan_runs() {
        let bus = MessageBus::local().await.unwrap();
        let (_id, mut rx) = bus.subscribe_channel("error.pattern").await.unwrap();
        let mut cfg = config();
        cfg.check_interval_ms = 20;
        let handler = ErrorHandler::open(cfg, bus).await.unwrap();
        let token = CancellationToken::new();
        handler.start(&token).await;
        for _ in 0..3 {
            handler
                .handle_error(ErrorReport::from_error(&RuntimeError::validation("bad")).agent("a"))
                .await
                .unwrap();
        }
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload["category"], "VALIDATION_ERROR");
        handler.stop().await;
    }
}
