// 执行事件广播

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

/// 执行阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Started,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    Suspended,
    Resumed,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionPhase {
    /// 一次执行在该阶段结束
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionPhase::Suspended
                | ExecutionPhase::Completed
                | ExecutionPhase::Failed
                | ExecutionPhase::Cancelled
        )
    }
}

/// 推送给订阅者的执行事件
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// 全局递增序号
    pub sequence: u64,
    pub conversation_id: String,
    pub flow_id: Option<String>,
    pub phase: ExecutionPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn new(
        conversation_id: impl Into<String>,
        flow_id: Option<String>,
        phase: ExecutionPhase,
    ) -> Self {
        Self {
            sequence: 0,
            conversation_id: conversation_id.into(),
            flow_id,
            phase,
            node_id: None,
            variables: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_variables(mut self, variables: Option<Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// 基于 tokio broadcast 的事件总线
///
/// 投递是尽力而为的：没有订阅者或订阅者落后时事件直接丢弃，
/// 不影响执行。
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<ExecutionEvent>,
    sequence: Arc<AtomicU64>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, mut event: ExecutionEvent) {
        event.sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(
            conversation_id = %event.conversation_id,
            phase = ?event.phase,
            node_id = ?event.node_id,
            sequence = event.sequence,
            "execution event"
        );
        // 无订阅者时 send 返回 Err，忽略
        let _ = self.sender.send(event);
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let broadcaster = EventBroadcaster::new(4);
        broadcaster.publish(ExecutionEvent::new("c1", None, ExecutionPhase::Started));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let broadcaster = EventBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();
        broadcaster.publish(ExecutionEvent::new("c1", None, ExecutionPhase::Started));
        broadcaster.publish(
            ExecutionEvent::new("c1", None, ExecutionPhase::NodeStarted).with_node("start"),
        );

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.phase, ExecutionPhase::Started);
        assert_eq!(second.node_id.as_deref(), Some("start"));
        assert!(first.sequence < second.sequence);
    }
}
