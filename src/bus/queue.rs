//! 持久命令队列（每个 Agent 一个）
//!
//! 核心功能：
//! - FIFO 顺序投递，单消费者
//! - prefetch 窗口限制未确认投递数
//! - ack 删除；nack(requeue) 放回队首；消费者退出时未确认投递全部回队（至少一次语义）

use std::collections::{HashMap, VecDeque};

use tokio::sync::{Mutex, Notify};

use super::message::Command;

/// 一次投递：命令 + 投递标签（ack/nack 时回传）
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub command: Command,
    /// 是否为重投
    pub redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<(Command, bool)>,
    unacked: HashMap<u64, Command>,
    /// 未确认投递的发出顺序（回队时保持原顺序）
    unacked_order: Vec<u64>,
    next_tag: u64,
    /// 当前消费者标识；None 表示无人消费
    consumer: Option<String>,
}

/// 单个 Agent 的命令队列
#[derive(Debug)]
pub struct CommandQueue {
    name: String,
    prefetch: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl CommandQueue {
    pub fn new(name: impl Into<String>, prefetch: usize) -> Self {
        Self {
            name: name.into(),
            prefetch: prefetch.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 入队（队尾）
    pub async fn push(&self, command: Command) {
        self.state.lock().await.ready.push_back((command, false));
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// 登记消费者；已有消费者时返回 false
    pub async fn attach(&self, consumer_tag: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.consumer.is_some() {
            return false;
        }
        state.consumer = Some(consumer_tag.to_string());
        true
    }

    /// 解除消费者，并把所有未确认投递按原顺序放回队首
    pub async fn detach(&self) -> usize {
        let mut state = self.state.lock().await;
        state.consumer = None;
        let order = std::mem::take(&mut state.unacked_order);
        let mut returned = 0;
        for tag in order.into_iter().rev() {
            if let Some(cmd) = state.unacked.remove(&tag) {
                state.ready.push_front((cmd, true));
                returned += 1;
            }
        }
        drop(state);
        if returned > 0 {
            tracing::debug!(queue = %self.name, returned, "returned unacked deliveries to queue");
            self.notify.notify_waiters();
        }
        returned
    }

    /// 在 prefetch 窗口内取下一条；队列为空或窗口已满时返回 None
    pub async fn try_next(&self) -> Option<Delivery> {
        let mut state = self.state.lock().await;
        if state.unacked.len() >= self.prefetch {
            return None;
        }
        let (mut command, redelivered) = state.ready.pop_front()?;
        if redelivered {
            command.retry_count += 1;
        }
        state.next_tag += 1;
        let tag = state.next_tag;
        state.unacked.insert(tag, command.clone());
        state.unacked_order.push(tag);
        Some(Delivery {
            tag,
            command,
            redelivered,
        })
    }

    /// 等待直到有可投递命令
    pub async fn next(&self) -> Delivery {
        loop {
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_next().await {
                return delivery;
            }
            notified.await;
        }
    }

    pub async fn ack(&self, tag: u64) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.unacked.remove(&tag).is_some();
        state.unacked_order.retain(|t| *t != tag);
        drop(state);
        self.notify.notify_one();
        removed
    }

    pub async fn nack(&self, tag: u64, requeue: bool) -> bool {
        let mut state = self.state.lock().await;
        let Some(cmd) = state.unacked.remove(&tag) else {
            return false;
        };
        state.unacked_order.retain(|t| *t != tag);
        if requeue {
            state.ready.push_front((cmd, true));
        }
        drop(state);
        self.notify.notify_one();
        true
    }

    /// (待投递数, 未确认数)
    pub async fn depth(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.ready.len(), state.unacked.len())
    }

    pub async fn has_consumer(&self) -> bool {
        self.state.lock().await.consumer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cmd(id: &str) -> Command {
        Command::new("a", "echo", json!({})).with_id(id)
    }

    #[tokio::test]
    async fn test_fifo_and_ack() {
        let queue = CommandQueue::new("a", 10);
        queue.push(cmd("1")).await;
        queue.push(cmd("2")).await;

        let d1 = queue.next().await;
        let d2 = queue.next().await;
        assert_eq!(d1.command.id, "1");
        assert_eq!(d2.command.id, "2");
        assert!(queue.ack(d1.tag).await);
        assert!(!queue.ack(d1.tag).await);
        assert_eq!(queue.depth().await, (0, 1));
    }

    #[tokio::test]
    async fn test_prefetch_window_bounds_in_flight() {
        let queue = CommandQueue::new("a", 1);
        queue.push(cmd("1")).await;
        queue.push(cmd("2")).await;

        let d1 = queue.try_next().await.unwrap();
        assert!(queue.try_next().await.is_none());
        queue.ack(d1.tag).await;
        assert_eq!(queue.try_next().await.unwrap().command.id, "2");
    }

    #[tokio::test]
    async fn test_nack_requeue_goes_to_head() {
        let queue = CommandQueue::new("a", 5);
        queue.push(cmd("1")).await;
        queue.push(cmd("2")).await;

        let d1 = queue.next().await;
        queue.nack(d1.tag, true).await;
        let again = queue.next().await;
        assert_eq!(again.command.id, "1");
        assert!(again.redelivered);
        assert_eq!(again.command.retry_count, 1);
    }

    #[tokio::test]
    async fn test_detach_returns_unacked_in_order() {
        let queue = CommandQueue::new("a", 5);
        for id in ["1", "2", "3"] {
            queue.push(cmd(id)).await;
        }
        assert!(queue.attach("c1").await);
        assert!(!queue.attach("c2").await);
        let _ = queue.next().await;
        let _ = queue.next().await;

        assert_eq!(queue.detach().await, 2);
        let ids: Vec<String> = vec![
            queue.next().await.command.id,
            queue.next().await.command.id,
            queue.next().await.command.id,
        ];
        assert_eq!(ids, vec!["1", "2", "3"]);
    }
}
