use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::warn;

use crate::error::{ChatFlowError, Result};

/// 会话级独占租约
///
/// 同一会话的事件在租约上排队，不同会话互不阻塞。
pub struct LeaseManager {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    cancelled: Mutex<HashSet<String>>,
    acquire_timeout: Duration,
    max_hold: Duration,
}

impl LeaseManager {
    pub fn new(acquire_timeout: Duration, max_hold: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
            acquire_timeout,
            max_hold,
        }
    }

    pub async fn acquire(self: &Arc<Self>, conversation_id: &str) -> Result<LeaseGuard> {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(
                slots
                    .entry(conversation_id.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        let guard = tokio::time::timeout(self.acquire_timeout, slot.lock_owned())
            .await
            .map_err(|_| {
                warn!(conversation_id = %conversation_id, "lease acquisition timed out");
                ChatFlowError::LeaseTimeout(conversation_id.to_string())
            })?;

        Ok(LeaseGuard {
            manager: Arc::clone(self),
            conversation_id: conversation_id.to_string(),
            acquired_at: Instant::now(),
            max_hold: self.max_hold,
            guard: Some(guard),
        })
    }

    /// 请求在下一个安全检查点取消正在执行的流程
    pub fn request_cancel(&self, conversation_id: &str) {
        self.cancelled.lock().insert(conversation_id.to_string());
    }

    pub fn is_cancelled(&self, conversation_id: &str) -> bool {
        self.cancelled.lock().contains(conversation_id)
    }

    pub fn clear_cancel(&self, conversation_id: &str) {
        self.cancelled.lock().remove(conversation_id);
    }

    /// 当前登记的租约槽数量
    pub fn active_slots(&self) -> usize {
        self.slots.lock().len()
    }

    fn release(&self, conversation_id: &str) {
        let mut slots = self.slots.lock();
        // 只剩注册表和当前持有者时回收槽位
        if let Some(slot) = slots.get(conversation_id) {
            if Arc::strong_count(slot) <= 2 {
                slots.remove(conversation_id);
            }
        }
    }
}

/// 持有期间独占会话上下文
pub struct LeaseGuard {
    manager: Arc<LeaseManager>,
    conversation_id: String,
    acquired_at: Instant,
    max_hold: Duration,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LeaseGuard {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.held_for() > self.max_hold
    }

    pub fn is_cancelled(&self) -> bool {
        self.manager.is_cancelled(&self.conversation_id)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.manager.release(&self.conversation_id);
        self.guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<LeaseManager> {
        Arc::new(LeaseManager::new(
            Duration::from_millis(50),
            Duration::from_secs(60),
        ))
    }

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let leases = manager();
        let first = leases.acquire("c1").await.unwrap();
        let err = leases.acquire("c1").await.err().expect("lease is held");
        assert!(err.is_fatal());

        drop(first);
        let again = leases.acquire("c1").await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn different_conversations_do_not_block() {
        let leases = manager();
        let _a = leases.acquire("a").await.unwrap();
        let _b = leases.acquire("b").await.unwrap();
        assert_eq!(leases.active_slots(), 2);
    }

    #[tokio::test]
    async fn slots_are_reclaimed_after_release() {
        let leases = manager();
        {
            let _guard = leases.acquire("c1").await.unwrap();
        }
        assert_eq!(leases.active_slots(), 0);
    }

    #[tokio::test]
    async fn cancellation_flag_visible_through_guard() {
        let leases = manager();
        let guard = leases.acquire("c1").await.unwrap();
        assert!(!guard.is_cancelled());
        leases.request_cancel("c1");
        assert!(guard.is_cancelled());
        leases.clear_cancel("c1");
        assert!(!guard.is_cancelled());
    }
}
