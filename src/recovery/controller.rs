//! 恢复控制器：订阅 agent.* 事件，按策略表向出错的 Agent 发送恢复命令
//!
//! - 同一 Agent 同一时刻至多执行一个恢复策略（恢复中集合），期间到达的故障只记日志
//! - retry 按重试策略延迟发送 retry-task，次数用尽后进入死信队列
//! - 心跳超过 missed_heartbeats × 心跳间隔未到达时判定为 unresponsive 并发送 recover

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::dlq::{DeadLetter, DeadLetterEntry, DeadLetterQueue};
use super::strategy::{ResolvedStrategy, Strategy, StrategyConfig, StrategyEntry, StrategyTable};
use crate::bus::{Command, Event, EventHandler, MessageBus};
use crate::core::error::NON_RETRYABLE_TASK_CATEGORIES;
use crate::core::RuntimeError;
use crate::resilience::RetryPolicy;

/// 事件源 / 命令来源名
pub const RECOVERY_SOURCE: &str = "recovery";

/// [recovery] 配置段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// 任务重试的默认策略
    pub retry: RetryPolicy,
    /// 每个 Agent 保留的恢复记录条数
    pub history_limit: usize,
    /// 连续缺失多少个心跳判定为 unresponsive
    pub missed_heartbeats: u32,
    pub watchdog_interval_ms: u64,
    /// 恢复中标记的最长保留时间（收不到 recovery-completed/failed 时过期）
    pub recovery_timeout_ms: u64,
    pub strategies: Vec<StrategyEntry>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            history_limit: 50,
            missed_heartbeats: 3,
            watchdog_interval_ms: 1000,
            recovery_timeout_ms: 300_000,
            strategies: Vec::new(),
        }
    }
}

/// 任务层面的失败信息（来自 agent.task-failed）
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task_id: String,
    pub task_type: String,
    pub original_data: Value,
    pub attempt: u32,
    pub workflow_id: Option<String>,
}

/// 一次需要恢复的故障
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub agent_id: String,
    pub module_id: Option<String>,
    pub category: String,
    pub error: String,
    pub task: Option<TaskFailure>,
}

impl FailureReport {
    /// 解析 agent.failed / agent.task-failed；其他事件返回 None
    pub fn from_event(event: &Event) -> Option<Self> {
        let p = &event.payload;
        let text = |key: &str| p.get(key).and_then(|v| v.as_str()).map(str::to_string);
        let task = match event.event_type.as_str() {
            "agent.failed" => None,
            "agent.task-failed" => Some(TaskFailure {
                task_id: text("taskId")
                    .or_else(|| text("commandId"))
                    .unwrap_or_default(),
                task_type: text("taskType").unwrap_or_default(),
                original_data: p.get("originalData").cloned().unwrap_or(Value::Null),
                attempt: p
                    .get("attempt")
                    .and_then(|v| v.as_u64())
                    .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
                    .unwrap_or(1)
                    .max(1),
                workflow_id: text("workflowId"),
            }),
            _ => return None,
        };
        Some(Self {
            agent_id: text("agentId").unwrap_or_else(|| event.source.clone()),
            module_id: text("moduleId"),
            category: text("category").unwrap_or_else(|| "unknown".to_string()),
            error: text("error").unwrap_or_default(),
            task,
        })
    }

    fn workflow_id(&self) -> Option<&str> {
        self.task.as_ref().and_then(|t| t.workflow_id.as_deref())
    }

    fn task_id(&self) -> Option<&str> {
        self.task.as_ref().map(|t| t.task_id.as_str())
    }
}

/// 恢复历史记录
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryAttempt {
    pub agent_id: String,
    pub module_id: Option<String>,
    pub task_id: Option<String>,
    pub category: String,
    pub strategy: Strategy,
    pub attempt: u32,
    /// scheduled / sent / dead_lettered / skipped / dropped / completed / failed
    pub action: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct HeartbeatSeen {
    last: Instant,
    last_at: DateTime<Utc>,
    interval: Duration,
    flagged: bool,
}

struct WatchTasks {
    token: CancellationToken,
    subscription: String,
    watchdog: JoinHandle<()>,
}

pub struct RecoveryController {
    me: Weak<RecoveryController>,
    config: RecoveryConfig,
    bus: Arc<MessageBus>,
    strategies: RwLock<StrategyTable>,
    dlq: DeadLetterQueue,
    in_progress: Mutex<HashMap<String, Instant>>,
    history: Mutex<HashMap<String, VecDeque<RecoveryAttempt>>>,
    heartbeats: Mutex<HashMap<String, HeartbeatSeen>>,
    tasks: Mutex<Option<WatchTasks>>,
}

/// 任务失败是否允许重试：validation / authorization 永不重试
pub fn should_retry_task(category: &str) -> bool {
    !NON_RETRYABLE_TASK_CATEGORIES.contains(&category)
}

impl RecoveryController {
    pub fn new(config: RecoveryConfig, bus: Arc<MessageBus>) -> Arc<Self> {
        let strategies = StrategyTable::from_entries(config.strategies.clone());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            bus,
            strategies: RwLock::new(strategies),
            dlq: DeadLetterQueue::new(),
            in_progress: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            heartbeats: Mutex::new(HashMap::new()),
            tasks: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn dlq(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    pub async fn register_strategy(&self, entry: StrategyEntry) {
        self.strategies.write().await.insert(entry);
    }

    pub async fn resolve(&self, agent_id: &str, module_id: Option<&str>, category: &str) -> ResolvedStrategy {
        self.strategies.read().await.lookup(agent_id, module_id, category)
    }

    /// 订阅 agent.* 并启动心跳巡检
    pub async fn start(self: &Arc<Self>, parent: &CancellationToken) -> Result<(), RuntimeError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Ok(());
        }
        let token = parent.child_token();
        let subscription = self
            .bus
            .subscribe("agent.*", controller_handler(self.me.clone()))
            .await?;

        let interval = Duration::from_millis(self.config.watchdog_interval_ms.max(1));
        let controller = self.me.clone();
        let loop_token = token.clone();
        let watchdog = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match controller.upgrade() {
                    Some(controller) => {
                        controller.check_heartbeats().await;
                    }
                    None => break,
                }
            }
        });

        tracing::info!(
            strategies = self.strategies.read().await.len(),
            missed_heartbeats = self.config.missed_heartbeats,
            "recovery controller started"
        );
        *tasks = Some(WatchTasks {
            token,
            subscription,
            watchdog,
        });
        Ok(())
    }

    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };
        tasks.token.cancel();
        self.bus.unsubscribe(&tasks.subscription).await;
        let _ = tasks.watchdog.await;
        tracing::info!("recovery controller stopped");
    }

    async fn retry_token(&self) -> CancellationToken {
        match self.tasks.lock().await.as_ref() {
            Some(tasks) => tasks.token.child_token(),
            None => CancellationToken::new(),
        }
    }

    async fn on_event(&self, event: Event) -> Result<(), RuntimeError> {
        match event.event_type.as_str() {
            "agent.failed" | "agent.task-failed" => {
                if let Some(report) = FailureReport::from_event(&event) {
                    self.handle_failure(report).await;
                }
            }
            "agent.recovery-completed" | "agent.recovery-failed" => {
                self.finish_recovery(&event).await;
            }
            "agent.heartbeat" => self.record_heartbeat(&event).await,
            "agent.status-changed" => {
                if event.payload_str("status") != Some("running") {
                    let agent = event.payload_str("agentId").unwrap_or(&event.source);
                    self.heartbeats.lock().await.remove(agent);
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ---------- 故障处理 ----------

    /// 选择并执行恢复策略；该 Agent 正在恢复中时丢弃并返回 None
    pub async fn handle_failure(&self, report: FailureReport) -> Option<Strategy> {
        let resolved = self
            .resolve(&report.agent_id, report.module_id.as_deref(), &report.category)
            .await;
        let mut strategy = resolved.strategy;

        if report.task.is_some() && !should_retry_task(&report.category) {
            if strategy == Strategy::Retry {
                strategy = Strategy::DeadLetter;
            }
        }

        {
            let mut in_progress = self.in_progress.lock().await;
            let timeout = Duration::from_millis(self.config.recovery_timeout_ms);
            if let Some(since) = in_progress.get(&report.agent_id) {
                if since.elapsed() < timeout {
                    tracing::info!(
                        agent = %report.agent_id,
                        category = %report.category,
                        "recovery already in progress, failure dropped"
                    );
                    drop(in_progress);
                    self.record(&report, strategy, "dropped").await;
                    return None;
                }
            }
            if strategy.sends_command() {
                in_progress.insert(report.agent_id.clone(), Instant::now());
            }
        }

        if report.task.is_some() && !should_retry_task(&report.category) {
            self.publish(
                "workflow.failed",
                json!({
                    "agentId": report.agent_id,
                    "workflowId": report.workflow_id(),
                    "taskId": report.task_id(),
                    "category": report.category,
                    "error": report.error,
                    "reason": "non_retryable",
                }),
            )
            .await;
        }

        tracing::info!(
            agent = %report.agent_id,
            module = report.module_id.as_deref().unwrap_or("-"),
            category = %report.category,
            strategy = %strategy,
            specificity = ?resolved.specificity,
            "applying recovery strategy"
        );
        self.apply_strategy(&report, strategy, &resolved.config).await;
        Some(strategy)
    }

    async fn apply_strategy(&self, report: &FailureReport, strategy: Strategy, config: &StrategyConfig) {
        match strategy {
            Strategy::Retry => match &report.task {
                Some(task) => self.retry_task(report, task, config).await,
                None => {
                    let payload = json!({ "reason": report.category });
                    self.send_now(report, strategy, "restart", payload).await;
                }
            },
            Strategy::Restart => {
                let payload = json!({ "reason": report.category });
                self.send_now(report, strategy, "restart", payload).await;
            }
            Strategy::RestartModule => match &report.module_id {
                Some(module_id) => {
                    let payload = json!({ "moduleId": module_id });
                    self.send_now(report, strategy, "restart-module", payload).await;
                }
                None => {
                    let payload = json!({ "reason": report.category });
                    self.send_now(report, strategy, "restart", payload).await;
                }
            },
            Strategy::Fallback => match &config.fallback_method {
                Some(method) => {
                    let payload = json!({
                        "fallbackMethod": method,
                        "data": report.task.as_ref().map(|t| t.original_data.clone()).unwrap_or(Value::Null),
                        "moduleId": report.module_id,
                        "taskId": report.task_id(),
                    });
                    self.send_now(report, strategy, "use-fallback", payload).await;
                }
                None => {
                    tracing::warn!(agent = %report.agent_id, category = %report.category, "fallback strategy without fallbackMethod");
                    self.dead_letter(report).await;
                }
            },
            Strategy::Skip => {
                if let Some(workflow_id) = report.workflow_id() {
                    self.publish(
                        "workflow.failed",
                        json!({
                            "agentId": report.agent_id,
                            "workflowId": workflow_id,
                            "taskId": report.task_id(),
                            "category": report.category,
                            "reason": "skipped",
                        }),
                    )
                    .await;
                }
                self.record(report, strategy, "skipped").await;
            }
            Strategy::DeadLetter => self.dead_letter(report).await,
        }
    }

    async fn retry_task(&self, report: &FailureReport, task: &TaskFailure, config: &StrategyConfig) {
        let policy = config.retry_policy(&self.config.retry);
        if task.attempt >= policy.attempts {
            tracing::warn!(
                agent = %report.agent_id,
                task = %task.task_id,
                attempts = task.attempt,
                "retries exhausted"
            );
            self.dead_letter(report).await;
            return;
        }

        let next = task.attempt + 1;
        let delay = policy.delay_for(task.attempt);
        self.publish(
            "recovery.retry-scheduled",
            json!({
                "agentId": report.agent_id,
                "taskId": task.task_id,
                "taskType": task.task_type,
                "attempt": next,
                "delayMs": delay.as_millis() as u64,
            }),
        )
        .await;
        self.record(report, Strategy::Retry, "scheduled").await;
        tracing::info!(agent = %report.agent_id, task = %task.task_id, attempt = next, delay_ms = delay.as_millis() as u64, "retry scheduled");

        let command = Command::new(
            &report.agent_id,
            "retry-task",
            json!({
                "taskId": task.task_id,
                "taskType": task.task_type,
                "originalData": task.original_data,
                "attempt": next,
                "moduleId": report.module_id,
                "workflowId": task.workflow_id,
            }),
        )
        .with_source(RECOVERY_SOURCE);

        let token = self.retry_token().await;
        let controller = self.me.clone();
        let report = report.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(controller) = controller.upgrade() {
                        controller.dispatch(command, &report).await;
                    }
                }
            }
        });
    }

    async fn send_now(&self, report: &FailureReport, strategy: Strategy, command_type: &str, payload: Value) {
        let command = Command::new(&report.agent_id, command_type, payload).with_source(RECOVERY_SOURCE);
        self.record(report, strategy, "sent").await;
        self.dispatch(command, report).await;
    }

    /// 发送恢复命令；总线不可用时该故障进入死信
    async fn dispatch(&self, command: Command, report: &FailureReport) {
        let deadline = Duration::from_millis(self.bus.config().publish_timeout_ms);
        let command_type = command.command_type.clone();
        if let Err(e) = self.bus.send_command(command, deadline).await {
            tracing::error!(agent = %report.agent_id, command = %command_type, error = %e, "failed to send recovery command");
            self.dead_letter(report).await;
        }
    }

    async fn dead_letter(&self, report: &FailureReport) {
        self.in_progress.lock().await.remove(&report.agent_id);
        let letter = match &report.task {
            Some(task) => DeadLetter {
                agent_id: report.agent_id.clone(),
                module_id: report.module_id.clone(),
                task_id: Some(task.task_id.clone()),
                command_type: task.task_type.clone(),
                payload: task.original_data.clone(),
                error: report.error.clone(),
                category: report.category.clone(),
                attempts: task.attempt,
            },
            None => DeadLetter {
                agent_id: report.agent_id.clone(),
                module_id: report.module_id.clone(),
                task_id: None,
                command_type: "restart".to_string(),
                payload: json!({ "reason": report.category }),
                error: report.error.clone(),
                category: report.category.clone(),
                attempts: 1,
            },
        };
        let entry = self.dlq.insert(letter).await;
        tracing::warn!(
            agent = %entry.agent_id,
            key = %entry.key,
            category = %entry.category,
            count = entry.count,
            "dead-lettered"
        );
        self.publish(
            "recovery.dead_lettered",
            json!({
                "key": entry.key,
                "agentId": entry.agent_id,
                "moduleId": entry.module_id,
                "taskId": entry.task_id,
                "category": entry.category,
                "error": entry.error,
                "count": entry.count,
            }),
        )
        .await;
        self.record(report, Strategy::DeadLetter, "dead_lettered").await;
    }

    async fn finish_recovery(&self, event: &Event) {
        let agent = event.payload_str("agentId").unwrap_or(&event.source).to_string();
        let action = event.payload_str("action").unwrap_or("-");
        let succeeded = event.event_type == "agent.recovery-completed";
        if self.in_progress.lock().await.remove(&agent).is_some() {
            tracing::info!(agent = %agent, action, succeeded, "recovery finished");
        }
        let mut history = self.history.lock().await;
        let pending = history.get_mut(&agent).and_then(|ring| {
            ring.iter_mut()
                .rev()
                .find(|a| matches!(a.action.as_str(), "sent" | "scheduled"))
        });
        if let Some(attempt) = pending {
            attempt.action = if succeeded { "completed" } else { "failed" }.to_string();
        }
    }

    async fn record(&self, report: &FailureReport, strategy: Strategy, action: &str) {
        let attempt = RecoveryAttempt {
            agent_id: report.agent_id.clone(),
            module_id: report.module_id.clone(),
            task_id: report.task_id().map(str::to_string),
            category: report.category.clone(),
            strategy,
            attempt: report.task.as_ref().map(|t| t.attempt).unwrap_or(1),
            action: action.to_string(),
            at: Utc::now(),
        };
        let limit = self.config.history_limit.max(1);
        let mut history = self.history.lock().await;
        let ring = history.entry(report.agent_id.clone()).or_default();
        if ring.len() >= limit {
            ring.pop_front();
        }
        ring.push_back(attempt);
    }

    async fn publish(&self, event_type: &str, payload: Value) {
        if let Err(e) = self.bus.publish_event(RECOVERY_SOURCE, event_type, payload).await {
            tracing::warn!(event = event_type, error = %e, "failed to publish recovery event");
        }
    }

    // ---------- 心跳巡检 ----------

    async fn record_heartbeat(&self, event: &Event) {
        let agent = event.payload_str("agentId").unwrap_or(&event.source).to_string();
        let mut heartbeats = self.heartbeats.lock().await;
        if event.payload_str("status") != Some("running") {
            heartbeats.remove(&agent);
            return;
        }
        let interval = event
            .payload
            .get("intervalMs")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(30));
        heartbeats.insert(
            agent,
            HeartbeatSeen {
                last: Instant::now(),
                last_at: event.timestamp,
                interval,
                flagged: false,
            },
        );
    }

    /// 找出心跳超时的运行中 Agent，发布 agent.unresponsive 并发送 recover
    pub async fn check_heartbeats(&self) -> Vec<String> {
        let missed = self.config.missed_heartbeats.max(1);
        let now = Instant::now();
        let mut overdue = Vec::new();
        {
            let mut heartbeats = self.heartbeats.lock().await;
            for (agent, seen) in heartbeats.iter_mut() {
                if !seen.flagged && now.duration_since(seen.last) > seen.interval * missed {
                    seen.flagged = true;
                    overdue.push((agent.clone(), seen.last_at));
                }
            }
        }

        let mut flagged = Vec::new();
        for (agent, last_at) in overdue {
            tracing::warn!(agent = %agent, last_heartbeat = %last_at.to_rfc3339(), "agent unresponsive");
            self.publish(
                "agent.unresponsive",
                json!({
                    "agentId": agent,
                    "lastHeartbeat": last_at.to_rfc3339(),
                    "missedHeartbeats": missed,
                }),
            )
            .await;
            let report = FailureReport {
                agent_id: agent.clone(),
                module_id: None,
                category: "unresponsive".to_string(),
                error: format!("no heartbeat since {}", last_at.to_rfc3339()),
                task: None,
            };
            {
                let mut in_progress = self.in_progress.lock().await;
                if in_progress.contains_key(&agent) {
                    continue;
                }
                in_progress.insert(agent.clone(), Instant::now());
            }
            self.send_now(&report, Strategy::Restart, "recover", json!({ "reason": "unresponsive" }))
                .await;
            flagged.push(agent);
        }
        flagged
    }

    // ---------- 查询与运维 ----------

    pub async fn is_recovering(&self, agent_id: &str) -> bool {
        self.in_progress.lock().await.contains_key(agent_id)
    }

    pub async fn history(&self, agent_id: &str) -> Vec<RecoveryAttempt> {
        self.history
            .lock()
            .await
            .get(agent_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn dead_letters(&self, agent_id: Option<&str>) -> Vec<DeadLetterEntry> {
        self.dlq.list(agent_id).await
    }

    pub async fn delete_dead_letter(&self, key: &str) -> bool {
        self.dlq.delete(key).await
    }

    /// 重新发布死信中的命令并移除条目，返回新命令 ID
    pub async fn requeue_dead_letter(&self, key: &str) -> Result<String, RuntimeError> {
        let entry = self
            .dlq
            .get(key)
            .await
            .ok_or_else(|| RuntimeError::NotFound(format!("dead letter '{key}'")))?;
        let command = Command::new(&entry.agent_id, &entry.command_type, entry.payload.clone())
            .with_source(RECOVERY_SOURCE);
        let deadline = Duration::from_millis(self.bus.config().publish_timeout_ms);
        let id = self.bus.send_command(command, deadline).await?;
        self.dlq.delete(key).await;
        tracing::info!(agent = %entry.agent_id, key, command = %entry.command_type, "dead letter requeued");
        Ok(id)
    }
}

fn controller_handler(controller: Weak<RecoveryController>) -> EventHandler {
    Arc::new(move |event| {
        let controller = controller.clone();
        Box::pin(async move {
            match controller.upgrade() {
                Some(controller) => controller.on_event(event).await,
                None => Ok(()),
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{command_handler, CommandOutcome, CommandReply};
    use tokio::sync::mpsc;

    fn config() -> RecoveryConfig {
        RecoveryConfig {
            retry: RetryPolicy::new(3, 10, 2.0, 100),
            ..Default::default()
        }
    }

    fn task_failure(category: &str, attempt: u32) -> FailureReport {
        FailureReport {
            agent_id: "A".into(),
            module_id: Some("M".into()),
            category: category.into(),
            error: "upstream".into(),
            task: Some(TaskFailure {
                task_id: "t1".into(),
                task_type: "summarize".into(),
                original_data: json!({ "doc": 1 }),
                attempt,
                workflow_id: Some("wf-1".into()),
            }),
        }
    }

    /// A 的命令队列：收到的命令转发到 channel，并回复成功
    async fn capture_commands(bus: &Arc<MessageBus>) -> mpsc::UnboundedReceiver<Command> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.consume_commands(
            "A",
            command_handler(move |cmd: Command| {
                let tx = tx.clone();
                async move {
                    let id = cmd.id.clone();
                    let _ = tx.send(cmd);
                    CommandOutcome::Reply(CommandReply::ok(id, Value::Null, 0))
                }
            }),
        )
        .await
        .unwrap();
        rx
    }

    async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_task_failed_attempt_saturates() {
        let event = |attempt: Value| {
            Event::new(
                "A",
                "agent.task-failed",
                json!({ "agentId": "A", "taskId": "t1", "category": "timeout", "attempt": attempt }),
            )
        };
        let attempt = |e: &Event| FailureReport::from_event(e).and_then(|r| r.task).map(|t| t.attempt);

        assert_eq!(attempt(&event(json!(4_294_967_297u64))), Some(u32::MAX));
        assert_eq!(attempt(&event(json!(2))), Some(2));
        assert_eq!(attempt(&event(json!(0))), Some(1));
        assert_eq!(attempt(&event(Value::Null)), Some(1));
        assert!(FailureReport::from_event(&Event::new("A", "agent.heartbeat", json!({}))).is_none());
    }

    #[tokio::test]
    async fn test_retry_is_scheduled_with_backoff() {
        let bus = MessageBus::local().await.unwrap();
        let controller = RecoveryController::new(config(), bus.clone());
        let mut commands = capture_commands(&bus).await;
        let (_id, mut events) = bus.subscribe_channel("recovery.#").await.unwrap();

        assert_eq!(controller.handle_failure(task_failure("timeout", 2)).await, Some(Strategy::Retry));
        let scheduled = next_event(&mut events).await;
        assert_eq!(scheduled.event_type, "recovery.retry-scheduled");
        assert_eq!(scheduled.payload["attempt"], 3);
        assert_eq!(scheduled.payload["delayMs"], 20);

        let cmd = tokio::time::timeout(Duration::from_secs(1), commands.recv()).await.unwrap().unwrap();
        assert_eq!(cmd.command_type, "retry-task");
        assert_eq!(cmd.payload["taskType"], "summarize");
        assert_eq!(cmd.payload["originalData"], json!({ "doc": 1 }));
        assert!(controller.is_recovering("A").await);
    }

    #[tokio::test]
    async fn test_in_progress_drops_second_failure() {
        let bus = MessageBus::local().await.unwrap();
        let controller = RecoveryController::new(config(), bus.clone());
        assert!(controller.handle_failure(task_failure("timeout", 1)).await.is_some());
        assert!(controller.handle_failure(task_failure("timeout", 1)).await.is_none());

        let done = Event::new("A", "agent.recovery-completed", json!({ "agentId": "A", "action": "retry-task" }));
        controller.on_event(done).await.unwrap();
        assert!(!controller.is_recovering("A").await);
        assert!(controller.handle_failure(task_failure("timeout", 1)).await.is_some());

        let actions: Vec<String> = controller.history("A").await.into_iter().map(|a| a.action).collect();
        assert_eq!(actions, vec!["completed", "dropped", "scheduled"]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_go_to_dead_letter() {
        let bus = MessageBus::local().await.unwrap();
        let controller = RecoveryController::new(config(), bus.clone());
        let (_id, mut events) = bus.subscribe_channel("recovery.dead_lettered").await.unwrap();

        assert_eq!(controller.handle_failure(task_failure("timeout", 3)).await, Some(Strategy::Retry));
        let event = next_event(&mut events).await;
        assert_eq!(event.payload["count"], 3);
        let letters = controller.dead_letters(Some("A")).await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].count, 3);
        assert_eq!(letters[0].command_type, "summarize");
        assert!(!controller.is_recovering("A").await);
    }

    #[tokio::test]
    async fn test_non_retryable_task_fails_workflow() {
        let bus = MessageBus::local().await.unwrap();
        let controller = RecoveryController::new(config(), bus.clone());
        let (_id, mut events) = bus.subscribe_channel("workflow.failed").await.unwrap();

        assert_eq!(
            controller.handle_failure(task_failure("validation", 1)).await,
            Some(Strategy::DeadLetter)
        );
        let event = next_event(&mut events).await;
        assert_eq!(event.payload["workflowId"], "wf-1");
        assert_eq!(event.payload["category"], "validation");
        assert_eq!(controller.dlq().len().await, 1);
    }

    #[tokio::test]
    async fn test_skip_publishes_workflow_failed() {
        let bus = MessageBus::local().await.unwrap();
        let controller = RecoveryController::new(config(), bus.clone());
        controller
            .register_strategy(StrategyEntry::new("timeout", Strategy::Skip).for_agent("A"))
            .await;
        let (_id, mut events) = bus.subscribe_channel("workflow.failed").await.unwrap();

        assert_eq!(controller.handle_failure(task_failure("timeout", 1)).await, Some(Strategy::Skip));
        let event = next_event(&mut events).await;
        assert_eq!(event.payload["reason"], "skipped");
        assert!(!controller.is_recovering("A").await);
    }

    #[tokio::test]
    async fn test_restart_module_and_fallback_commands() {
        let bus = MessageBus::local().await.unwrap();
        let controller = RecoveryController::new(config(), bus.clone());
        controller
            .register_strategy(StrategyEntry::new("database", Strategy::RestartModule).for_agent("A"))
            .await;
        controller
            .register_strategy(
                StrategyEntry::new("rate_limit", Strategy::Fallback)
                    .with_config(StrategyConfig::fallback("cached")),
            )
            .await;
        let mut commands = capture_commands(&bus).await;

        controller.handle_failure(task_failure("database", 1)).await;
        let cmd = commands.recv().await.unwrap();
        assert_eq!(cmd.command_type, "restart-module");
        assert_eq!(cmd.payload["moduleId"], "M");
        assert_eq!(cmd.source.as_deref(), Some(RECOVERY_SOURCE));

        let done = Event::new("A", "agent.recovery-completed", json!({ "agentId": "A" }));
        controller.on_event(done).await.unwrap();

        controller.handle_failure(task_failure("rate_limit", 1)).await;
        let cmd = commands.recv().await.unwrap();
        assert_eq!(cmd.command_type, "use-fallback");
        assert_eq!(cmd.payload["fallbackMethod"], "cached");
        assert_eq!(cmd.payload["data"], json!({ "doc": 1 }));
    }

    #[tokio::test]
    async fn test_requeue_dead_letter() {
        let bus = MessageBus::local().await.unwrap();
        let controller = RecoveryController::new(config(), bus.clone());
        controller.handle_failure(task_failure("authorization", 1)).await;
        let key = controller.dead_letters(None).await[0].key.clone();

        let mut commands = capture_commands(&bus).await;
        controller.requeue_dead_letter(&key).await.unwrap();
        let cmd = commands.recv().await.unwrap();
        assert_eq!(cmd.command_type, "summarize");
        assert_eq!(cmd.payload, json!({ "doc": 1 }));
        assert!(controller.dlq().is_empty().await);
        assert!(controller.requeue_dead_letter(&key).await.is_err());
    }

    #[tokio::test]
    async fn test_missed_heartbeats_trigger_recover() {
        let bus = MessageBus::local().await.unwrap();
        let controller = RecoveryController::new(
            RecoveryConfig {
                missed_heartbeats: 2,
                ..config()
            },
            bus.clone(),
        );
        let mut commands = capture_commands(&bus).await;
        let (_id, mut events) = bus.subscribe_channel("agent.unresponsive").await.unwrap();

        let beat = Event::new("A", "agent.heartbeat", json!({ "agentId": "A", "status": "running", "intervalMs": 10 }));
        controller.on_event(beat).await.unwrap();
        assert!(controller.check_heartbeats().await.is_empty());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(controller.check_heartbeats().await, vec!["A".to_string()]);
        assert_eq!(next_event(&mut events).await.payload["agentId"], "A");
        let cmd = commands.recv().await.unwrap();
        assert_eq!(cmd.command_type, "recover");
        assert_eq!(cmd.payload["reason"], "unresponsive");

        // 已标记的 Agent 不重复上报
        assert!(controller.check_heartbeats().await.is_empty());
    }

    #[tokio::test]
    async fn test_subscription_drives_recovery() {
        let bus = MessageBus::local().await.unwrap();
        let controller = RecoveryController::new(config(), bus.clone());
        let token = CancellationToken::new();
        controller.start(&token).await.unwrap();
        let (_id, mut events) = bus.subscribe_channel("recovery.dead_lettered").await.unwrap();

        bus.publish_event(
            "A",
            "agent.failed",
            json!({ "agentId": "A", "category": "module_init_failure", "moduleId": "M", "error": "boom" }),
        )
        .await
        .unwrap();
        let event = next_event(&mut events).await;
        assert_eq!(event.payload["category"], "module_init_failure");
        assert_eq!(controller.dead_letters(Some("A")).await[0].command_type, "restart");
        controller.stop().await;
    }
}
