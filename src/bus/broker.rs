//! 消息总线：每个 Agent 一个持久命令队列 + 按 topic 路由的事件交换
//!
//! - 命令：至少一次投递，单 Agent 单消费者，队内 FIFO；消费者异常退出时未确认命令回队
//! - 事件：订阅后才能收到（无回放）；多个订阅者各自独立；处理函数报错只记录，不重投
//! - 慢订阅者：缓冲区连续满 slow_subscriber_limit 次后断开，事件只对它丢弃

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::{ConnectionManager, Connector, Declaration, LocalConnector};
use super::message::{Command, CommandReply, Event};
use super::queue::CommandQueue;
use super::topic::TopicPattern;
use crate::core::RuntimeError;
use crate::resilience::RetryPolicy;

/// 事件交换机名
pub const EVENTS_EXCHANGE: &str = "comb.events";

/// 命令处理函数的结论
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    /// 已处理：回复调用方并 ack
    Reply(CommandReply),
    /// 放回队首稍后重投
    Requeue,
    /// 丢弃
    Reject,
}

pub type CommandHandler = Arc<dyn Fn(Command) -> BoxFuture<'static, CommandOutcome> + Send + Sync>;
pub type EventHandler =
    Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), RuntimeError>> + Send + Sync>;

/// [bus] 配置段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// 总线地址（进程内为 local://）
    pub endpoint: String,
    /// 每个消费者最多未确认命令数
    pub prefetch: usize,
    /// 断线时发布操作最长等待（毫秒）
    pub publish_timeout_ms: u64,
    /// 每个订阅者的事件缓冲
    pub subscriber_buffer: usize,
    /// 连续丢弃多少次判定为慢订阅者
    pub slow_subscriber_limit: u32,
    pub reconnect: RetryPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoint: "local://".to_string(),
            prefetch: 1,
            publish_timeout_ms: 5_000,
            subscriber_buffer: 256,
            slow_subscriber_limit: 64,
            reconnect: RetryPolicy::new(10, 500, 2.0, 30_000),
        }
    }
}

struct Subscriber {
    pattern: TopicPattern,
    tx: mpsc::Sender<Event>,
    consecutive_drops: AtomicU32,
    task: Option<JoinHandle<()>>,
}

struct Consumer {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// 队列统计
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub ready: usize,
    pub unacked: usize,
    pub consuming: bool,
}

/// 总线统计
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub connected: bool,
    pub queues: Vec<QueueStats>,
    pub subscribers: usize,
    pub dropped_events: u64,
    pub published_events: u64,
}

/// 消息总线
pub struct MessageBus {
    config: BusConfig,
    connection: ConnectionManager,
    queues: RwLock<HashMap<String, Arc<CommandQueue>>>,
    consumers: Mutex<HashMap<String, Consumer>>,
    subscribers: RwLock<HashMap<String, Subscriber>>,
    pending_replies: Mutex<HashMap<String, oneshot::Sender<CommandReply>>>,
    dropped_events: AtomicU64,
    published_events: AtomicU64,
    shutdown: CancellationToken,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Arc<Self> {
        let connector = Arc::new(LocalConnector::new(config.endpoint.clone()));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: BusConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let connection = ConnectionManager::new(connector, config.reconnect.clone());
        Arc::new(Self {
            config,
            connection,
            queues: RwLock::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            pending_replies: Mutex::new(HashMap::new()),
            dropped_events: AtomicU64::new(0),
            published_events: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    /// 进程内总线（测试与单机运行）
    pub async fn local() -> Result<Arc<Self>, RuntimeError> {
        let bus = Self::new(BusConfig::default());
        bus.connect().await?;
        Ok(bus)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// 建立连接并声明事件交换机
    pub async fn connect(&self) -> Result<(), RuntimeError> {
        self.connection
            .declare(Declaration::Exchange(EVENTS_EXCHANGE.to_string()))
            .await?;
        self.connection.connect(&self.shutdown).await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// 传输层报告断线：后台按退避策略重连
    pub fn connection_lost(self: &Arc<Self>) {
        self.connection.mark_disconnected();
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = bus.connection.connect(&bus.shutdown).await {
                tracing::error!(error = %e, "message bus reconnect abandoned");
            }
        });
    }

    fn publish_deadline(&self) -> Duration {
        Duration::from_millis(self.config.publish_timeout_ms)
    }

    async fn queue(&self, agent_id: &str) -> Result<Arc<CommandQueue>, RuntimeError> {
        if let Some(q) = self.queues.read().await.get(agent_id) {
            return Ok(Arc::clone(q));
        }
        self.connection
            .declare(Declaration::Queue(agent_id.to_string()))
            .await?;
        let mut queues = self.queues.write().await;
        let queue = queues
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(CommandQueue::new(agent_id, self.config.prefetch)));
        Ok(Arc::clone(queue))
    }

    // ---------- 命令 ----------

    /// 发布命令到 Agent 队列，返回命令 ID
    pub async fn publish_command(
        &self,
        agent_id: &str,
        command_type: &str,
        payload: Value,
    ) -> Result<String, RuntimeError> {
        let command = Command::new(agent_id, command_type, payload);
        self.send_command(command, self.publish_deadline()).await
    }

    /// 发布已构造的命令；断线时最多等待 deadline
    pub async fn send_command(
        &self,
        command: Command,
        deadline: Duration,
    ) -> Result<String, RuntimeError> {
        if command.target.is_empty() {
            return Err(RuntimeError::validation_field("target", "command target is empty"));
        }
        self.connection.wait_connected(deadline).await?;
        let id = command.id.clone();
        let queue = self.queue(&command.target).await?;
        tracing::debug!(agent = %command.target, command = %command.command_type, id = %id, "command published");
        queue.push(command).await;
        Ok(id)
    }

    /// 发布命令并等待回复
    pub async fn request(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<CommandReply, RuntimeError> {
        let id = command.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending_replies.lock().await.insert(id.clone(), tx);
        if let Err(e) = self.send_command(command, timeout).await {
            self.pending_replies.lock().await.remove(&id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RuntimeError::Cancelled),
            Err(_) => {
                self.pending_replies.lock().await.remove(&id);
                Err(RuntimeError::Timeout(timeout))
            }
        }
    }

    async fn deliver_reply(&self, reply: CommandReply) {
        if let Some(tx) = self.pending_replies.lock().await.remove(&reply.id) {
            let _ = tx.send(reply);
        }
    }

    /// 启动单个 Agent 的命令消费者（每个 Agent 至多一个）
    pub async fn consume_commands(
        self: &Arc<Self>,
        agent_id: &str,
        handler: CommandHandler,
    ) -> Result<(), RuntimeError> {
        let queue = self.queue(agent_id).await?;

        // 等待已停止的旧消费者退出，让未确认命令先回队
        let previous = self.consumers.lock().await.remove(agent_id);
        if let Some(previous) = previous {
            if !previous.token.is_cancelled() {
                self.consumers.lock().await.insert(agent_id.to_string(), previous);
                return Err(RuntimeError::agent(
                    format!("agent '{agent_id}' already has an active command consumer"),
                    "consumer_conflict",
                ));
            }
            let _ = previous.task.await;
        }

        let consumer_tag = uuid::Uuid::new_v4().to_string();
        if !queue.attach(&consumer_tag).await {
            return Err(RuntimeError::agent(
                format!("agent '{agent_id}' already has an active command consumer"),
                "consumer_conflict",
            ));
        }

        let token = self.shutdown.child_token();
        let bus = Arc::clone(self);
        let loop_token = token.clone();
        let agent = agent_id.to_string();
        let task = tokio::spawn(async move {
            tracing::info!(agent = %agent, "command consumer started");
            loop {
                let delivery = tokio::select! {
                    biased;
                    _ = loop_token.cancelled() => break,
                    d = queue.next() => d,
                };
                let tag = delivery.tag;
                match handler(delivery.command).await {
                    CommandOutcome::Reply(reply) => {
                        bus.deliver_reply(reply).await;
                        queue.ack(tag).await;
                    }
                    CommandOutcome::Requeue => {
                        queue.nack(tag, true).await;
                    }
                    CommandOutcome::Reject => {
                        queue.nack(tag, false).await;
                    }
                }
            }
            let returned = queue.detach().await;
            tracing::info!(agent = %agent, returned, "command consumer stopped");
        });

        self.consumers
            .lock()
            .await
            .insert(agent_id.to_string(), Consumer { token, task });
        Ok(())
    }

    /// 停止消费（不等待在途命令完成；其结果仍会 ack）
    pub async fn stop_consuming(&self, agent_id: &str) {
        if let Some(consumer) = self.consumers.lock().await.get(agent_id) {
            consumer.token.cancel();
        }
    }

    pub async fn is_consuming(&self, agent_id: &str) -> bool {
        self.consumers
            .lock()
            .await
            .get(agent_id)
            .map(|c| !c.token.is_cancelled() && !c.task.is_finished())
            .unwrap_or(false)
    }

    // ---------- 事件 ----------

    /// 构造并发布事件
    pub async fn publish_event(
        &self,
        source: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<Event, RuntimeError> {
        let event = Event::new(source, event_type, payload);
        self.publish(event.clone()).await?;
        Ok(event)
    }

    /// 扇出到所有匹配的订阅者
    pub async fn publish(&self, event: Event) -> Result<(), RuntimeError> {
        self.connection.wait_connected(self.publish_deadline()).await?;
        self.published_events.fetch_add(1, Ordering::Relaxed);

        let mut slow = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, sub) in subscribers.iter() {
                if !sub.pattern.matches(&event.event_type) {
                    continue;
                }
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => {
                        sub.consecutive_drops.store(0, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped_events.fetch_add(1, Ordering::Relaxed);
                        let drops = sub.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                        if drops >= self.config.slow_subscriber_limit.max(1) {
                            slow.push(id.clone());
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => slow.push(id.clone()),
                }
            }
        }

        for id in slow {
            tracing::warn!(subscription = %id, "disconnecting slow or closed subscriber");
            self.unsubscribe(&id).await;
        }
        Ok(())
    }

    /// 订阅：返回订阅 ID 与事件接收端（只收到订阅之后发布的事件）
    pub async fn subscribe_channel(
        &self,
        pattern: &str,
    ) -> Result<(String, mpsc::Receiver<Event>), RuntimeError> {
        let pattern = TopicPattern::parse(pattern)?;
        self.connection
            .declare(Declaration::Binding(
                EVENTS_EXCHANGE.to_string(),
                pattern.as_str().to_string(),
            ))
            .await?;
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let id = uuid::Uuid::new_v4().to_string();
        self.subscribers.write().await.insert(
            id.clone(),
            Subscriber {
                pattern,
                tx,
                consecutive_drops: AtomicU32::new(0),
                task: None,
            },
        );
        Ok((id, rx))
    }

    /// 订阅并以处理函数消费；处理函数按事件到达顺序串行调用
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: EventHandler,
    ) -> Result<String, RuntimeError> {
        let (id, mut rx) = self.subscribe_channel(pattern).await?;
        let sub_id = id.clone();
        let pattern_str = pattern.to_string();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let started = Instant::now();
                let event_type = event.event_type.clone();
                if let Err(e) = handler(event).await {
                    // 拒绝且不重投
                    tracing::warn!(
                        subscription = %sub_id,
                        pattern = %pattern_str,
                        event = %event_type,
                        error = %e,
                        "event handler failed, message rejected"
                    );
                }
                let latency = started.elapsed();
                if latency > Duration::from_secs(5) {
                    tracing::warn!(subscription = %sub_id, latency_ms = latency.as_millis() as u64, "slow event handler");
                }
            }
        });
        if let Some(sub) = self.subscribers.write().await.get_mut(&id) {
            sub.task = Some(task);
        }
        Ok(id)
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> bool {
        let removed = self.subscribers.write().await.remove(subscription_id);
        match removed {
            Some(sub) => {
                let pattern = sub.pattern.as_str().to_string();
                let still_bound = self
                    .subscribers
                    .read()
                    .await
                    .values()
                    .any(|s| s.pattern.as_str() == pattern);
                if !still_bound {
                    self.connection
                        .forget(&Declaration::Binding(EVENTS_EXCHANGE.to_string(), pattern))
                        .await;
                }
                if let Some(task) = sub.task {
                    task.abort();
                }
                true
            }
            None => false,
        }
    }

    pub async fn stats(&self) -> BusStats {
        let queues: Vec<(String, Arc<CommandQueue>)> = self
            .queues
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        let mut queue_stats = Vec::with_capacity(queues.len());
        for (name, queue) in queues {
            let (ready, unacked) = queue.depth().await;
            queue_stats.push(QueueStats {
                name,
                ready,
                unacked,
                consuming: queue.has_consumer().await,
            });
        }
        queue_stats.sort_by(|a, b| a.name.cmp(&b.name));
        BusStats {
            connected: self.is_connected(),
            queues: queue_stats,
            subscribers: self.subscribers.read().await.len(),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            published_events: self.published_events.load(Ordering::Relaxed),
        }
    }

    /// 关闭：停止所有消费者与订阅，未完成的请求收到 Cancelled
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let consumers: Vec<Consumer> = self.consumers.lock().await.drain().map(|(_, c)| c).collect();
        for consumer in consumers {
            consumer.token.cancel();
            if tokio::time::timeout(Duration::from_secs(5), consumer.task).await.is_err() {
                tracing::warn!("command consumer did not stop in time");
            }
        }
        let subscribers: Vec<Subscriber> =
            self.subscribers.write().await.drain().map(|(_, s)| s).collect();
        for sub in subscribers {
            drop(sub.tx);
            if let Some(task) = sub.task {
                let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
            }
        }
        self.pending_replies.lock().await.clear();
        self.connection.mark_disconnected();
        tracing::info!("message bus shut down");
    }
}

/// 把 async 闭包包装为 CommandHandler
pub fn command_handler<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = CommandOutcome> + Send + 'static,
{
    Arc::new(move |cmd| Box::pin(f(cmd)))
}

/// 把 async 闭包包装为 EventHandler
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), RuntimeError>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}
