//! 总线连接：Connector 抽象 + 指数退避自动重连
//!
//! 连接断开期间，发布操作阻塞等待重连，直到调用方截止时间到期后返回 BusUnavailable。
//! 每次连接成功后幂等地重新声明拓扑（队列、交换机、绑定）。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::core::RuntimeError;
use crate::resilience::RetryPolicy;

/// 拓扑声明
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Declaration {
    /// 每个 Agent 的持久命令队列
    Queue(String),
    /// 事件交换机
    Exchange(String),
    /// 订阅绑定（交换机, 模式）
    Binding(String, String),
}

/// 底层传输抽象：建立连接、声明拓扑
#[async_trait]
pub trait Connector: Send + Sync {
    /// 建立（或重建）连接
    async fn connect(&self) -> Result<(), RuntimeError>;

    /// 幂等声明
    async fn declare(&self, declaration: &Declaration) -> Result<(), RuntimeError>;

    fn endpoint(&self) -> &str;
}

/// 进程内连接器：始终可用
#[derive(Debug, Clone)]
pub struct LocalConnector {
    endpoint: String,
}

impl LocalConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl Default for LocalConnector {
    fn default() -> Self {
        Self::new("local://")
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn declare(&self, _declaration: &Declaration) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// 连接管理：连接状态广播 + 拓扑记录 + 重连循环
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    reconnect: RetryPolicy,
    connected_tx: watch::Sender<bool>,
    topology: Mutex<BTreeSet<Declaration>>,
    /// 防止并发重连
    reconnecting: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, reconnect: RetryPolicy) -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            connector,
            reconnect,
            connected_tx,
            topology: Mutex::new(BTreeSet::new()),
            reconnecting: Mutex::new(()),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.connector.endpoint()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    /// 记录并（已连接时）立即声明
    pub async fn declare(&self, declaration: Declaration) -> Result<(), RuntimeError> {
        let fresh = self.topology.lock().await.insert(declaration.clone());
        if fresh && self.is_connected() {
            self.connector.declare(&declaration).await?;
        }
        Ok(())
    }

    pub async fn forget(&self, declaration: &Declaration) {
        self.topology.lock().await.remove(declaration);
    }

    /// 连接：按重连策略退避重试；成功后重新声明全部拓扑
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        let _guard = self.reconnecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let attempts = self.reconnect.attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match self.connector.connect().await {
                Ok(()) => self.redeclare().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    self.connected_tx.send_replace(true);
                    tracing::info!(endpoint = %self.endpoint(), attempt, "message bus connected");
                    return Ok(());
                }
                Err(e) if attempt >= attempts => {
                    tracing::error!(endpoint = %self.endpoint(), attempts, error = %e, "message bus connect failed");
                    return Err(RuntimeError::BusUnavailable);
                }
                Err(e) => {
                    let delay = self.reconnect.delay_for(attempt);
                    tracing::warn!(
                        endpoint = %self.endpoint(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "message bus connect failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn redeclare(&self) -> Result<(), RuntimeError> {
        let topology: Vec<Declaration> = self.topology.lock().await.iter().cloned().collect();
        for declaration in &topology {
            self.connector.declare(declaration).await?;
        }
        tracing::debug!(count = topology.len(), "topology declared");
        Ok(())
    }

    /// 标记断开（传输层报告连接丢失时调用）
    pub fn mark_disconnected(&self) {
        self.connected_tx.send_replace(false);
        tracing::warn!(endpoint = %self.endpoint(), "message bus disconnected");
    }

    /// 等待连接可用；超过 deadline 返回 BusUnavailable
    pub async fn wait_connected(&self, deadline: Duration) -> Result<(), RuntimeError> {
        let mut rx = self.connected_tx.subscribe();
        if *rx.borrow() {
            return Ok(());
        }
        let wait = async {
            loop {
                if rx.changed().await.is_err() {
                    return false;
                }
                if *rx.borrow() {
                    return true;
                }
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(true) => Ok(()),
            _ => Err(RuntimeError::BusUnavailable),
        }
    }

    pub async fn declarations(&self) -> Vec<Declaration> {
        self.topology.lock().await.iter().cloned().collect()
    }
}
