use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::context::ExecutionContext;
use crate::error::Result;

/// 执行上下文存储 trait，按会话 ID 存取
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn load(&self, conversation_id: &str) -> Result<Option<ExecutionContext>>;
    async fn save(&self, ctx: &ExecutionContext) -> Result<()>;
    async fn delete(&self, conversation_id: &str) -> Result<()>;
    /// 截止时间不晚于 `now` 的会话
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<String>>;
}

/// 内存存储实现
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<String, ExecutionContext>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[async_trait]
impl ContextStore for MemoryStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<ExecutionContext>> {
        Ok(self.inner.read().get(conversation_id).cloned())
    }

    async fn save(&self, ctx: &ExecutionContext) -> Result<()> {
        self.inner
            .write()
            .insert(ctx.conversation_id.clone(), ctx.clone());
        Ok(())
    }

    async fn delete(&self, conversation_id: &str) -> Result<()> {
        self.inner.write().remove(conversation_id);
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut due: Vec<(DateTime<Utc>, String)> = self
            .inner
            .read()
            .values()
            .filter_map(|ctx| {
                ctx.next_deadline()
                    .filter(|deadline| *deadline <= now)
                    .map(|deadline| (deadline, ctx.conversation_id.clone()))
            })
            .collect();
        due.sort();
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }
}

#[cfg(feature = "redis-store")]
pub mod redis {
    use super::*;
    use crate::error::ChatFlowError;
    use redis::AsyncCommands;

    const CONTEXT_PREFIX: &str = "chatflow:ctx:";
    const DUE_KEY: &str = "chatflow:due";

    /// Redis 存储：上下文为 JSON 值，截止时间放在有序集合中
    pub struct RedisStore {
        client: redis::Client,
    }

    impl RedisStore {
        pub fn new(client: redis::Client) -> Self {
            Self { client }
        }

        async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
            self.client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| ChatFlowError::Storage(e.to_string()))
        }
    }

    fn context_key(conversation_id: &str) -> String {
        format!("{}{}", CONTEXT_PREFIX, conversation_id)
    }

    #[async_trait]
    impl ContextStore for RedisStore {
        async fn load(&self, conversation_id: &str) -> Result<Option<ExecutionContext>> {
            let mut conn = self.connection().await?;
            let raw: Option<String> = conn
                .get(context_key(conversation_id))
                .await
                .map_err(|e| ChatFlowError::Storage(e.to_string()))?;
            match raw {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(None),
            }
        }

        async fn save(&self, ctx: &ExecutionContext) -> Result<()> {
            let mut conn = self.connection().await?;
            let raw = serde_json::to_string(ctx)?;
            let _: () = conn
                .set(context_key(&ctx.conversation_id), raw)
                .await
                .map_err(|e| ChatFlowError::Storage(e.to_string()))?;
            match ctx.next_deadline() {
                Some(deadline) => {
                    let _: () = conn
                        .zadd(DUE_KEY, &ctx.conversation_id, deadline.timestamp_millis())
                        .await
                        .map_err(|e| ChatFlowError::Storage(e.to_string()))?;
                }
                None => {
                    let _: () = conn
                        .zrem(DUE_KEY, &ctx.conversation_id)
                        .await
                        .map_err(|e| ChatFlowError::Storage(e.to_string()))?;
                }
            }
            Ok(())
        }

        async fn delete(&self, conversation_id: &str) -> Result<()> {
            let mut conn = self.connection().await?;
            let _: () = conn
                .del(context_key(conversation_id))
                .await
                .map_err(|e| ChatFlowError::Storage(e.to_string()))?;
            let _: () = conn
                .zrem(DUE_KEY, conversation_id)
                .await
                .map_err(|e| ChatFlowError::Storage(e.to_string()))?;
            Ok(())
        }

        async fn due(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
            let mut conn = self.connection().await?;
            let ids: Vec<String> = conn
                .zrangebyscore(DUE_KEY, i64::MIN, now.timestamp_millis())
                .await
                .map_err(|e| ChatFlowError::Storage(e.to_string()))?;
            Ok(ids)
        }
    }
}
