use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{ChatFlowError, Result};
use crate::runtime::InboundEvent;

use super::types::{NewTrigger, Trigger, TriggerFilter, TriggerStats, TriggerStatus, TriggerUpdate};

#[derive(Default)]
struct Index {
    by_id: HashMap<String, Arc<Trigger>>,
    /// tenant -> 激活的触发器，按 (priority desc, created_at desc) 排好
    by_scope: HashMap<String, Vec<Arc<Trigger>>>,
}

impl Index {
    fn rebuild_scope(&mut self, tenant: &str) {
        let mut candidates: Vec<Arc<Trigger>> = self
            .by_id
            .values()
            .filter(|t| t.tenant == tenant && t.is_active())
            .cloned()
            .collect();
        sort(&mut candidates);
        if candidates.is_empty() {
            self.by_scope.remove(tenant);
        } else {
            self.by_scope.insert(tenant.to_string(), candidates);
        }
    }
}

fn sort(triggers: &mut [Arc<Trigger>]) {
    triggers.sort_by_key(|t| (Reverse(t.priority), Reverse(t.created_at), Reverse(t.seq)));
}

/// 触发器表：读多写少，修改后立刻对下一次匹配可见
#[derive(Default)]
pub struct TriggerRegistry {
    index: RwLock<Index>,
    seq: AtomicU64,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, new: NewTrigger) -> Result<Arc<Trigger>> {
        let compiled = new.matcher.compile()?;
        let trigger = Arc::new(Trigger {
            id: uuid::Uuid::new_v4().to_string(),
            tenant: new.tenant,
            flow_id: new.flow_id,
            name: new.name,
            entry_node: new.entry_node,
            status: new.status,
            priority: new.priority,
            matcher: new.matcher,
            created_at: Utc::now(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            compiled,
            stats: Arc::new(TriggerStats::default()),
        });

        let mut index = self.index.write();
        index
            .by_id
            .insert(trigger.id.clone(), Arc::clone(&trigger));
        index.rebuild_scope(&trigger.tenant);
        info!(
            trigger_id = %trigger.id,
            flow_id = %trigger.flow_id,
            priority = trigger.priority,
            "trigger created"
        );
        Ok(trigger)
    }

    pub fn update(&self, id: &str, update: TriggerUpdate) -> Result<Arc<Trigger>> {
        let mut index = self.index.write();
        let current = index
            .by_id
            .get(id)
            .ok_or_else(|| ChatFlowError::TriggerNotFound(id.to_string()))?;

        let mut next = Trigger::clone(current);
        if let Some(flow_id) = update.flow_id {
            next.flow_id = flow_id;
        }
        if let Some(name) = update.name {
            next.name = Some(name);
        }
        if let Some(entry) = update.entry_node {
            next.entry_node = Some(entry);
        }
        if let Some(priority) = update.priority {
            next.priority = priority;
        }
        if let Some(status) = update.status {
            next.status = status;
        }
        if let Some(matcher) = update.matcher {
            next.compiled = matcher.compile()?;
            next.matcher = matcher;
        }

        let next = Arc::new(next);
        index.by_id.insert(id.to_string(), Arc::clone(&next));
        index.rebuild_scope(&next.tenant);
        debug!(trigger_id = %id, "trigger updated");
        Ok(next)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut index = self.index.write();
        let removed = index
            .by_id
            .remove(id)
            .ok_or_else(|| ChatFlowError::TriggerNotFound(id.to_string()))?;
        index.rebuild_scope(&removed.tenant);
        info!(trigger_id = %id, "trigger deleted");
        Ok(())
    }

    pub fn enable(&self, id: &str) -> Result<Arc<Trigger>> {
        self.update(
            id,
            TriggerUpdate {
                status: Some(TriggerStatus::Active),
                ..Default::default()
            },
        )
    }

    pub fn disable(&self, id: &str) -> Result<Arc<Trigger>> {
        self.update(
            id,
            TriggerUpdate {
                status: Some(TriggerStatus::Inactive),
                ..Default::default()
            },
        )
    }

    pub fn get(&self, id: &str) -> Option<Arc<Trigger>> {
        self.index.read().by_id.get(id).cloned()
    }

    /// 按匹配顺序列出
    pub fn list(&self, filter: &TriggerFilter) -> Vec<Arc<Trigger>> {
        let mut triggers: Vec<Arc<Trigger>> = self
            .index
            .read()
            .by_id
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        sort(&mut triggers);
        triggers
    }

    pub fn len(&self) -> usize {
        self.index.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 在租户范围内按优先级找第一个命中的触发器
    pub fn match_event(&self, tenant: &str, event: &InboundEvent) -> Option<Arc<Trigger>> {
        let index = self.index.read();
        let found = index
            .by_scope
            .get(tenant)?
            .iter()
            .find(|trigger| trigger.matches(event))
            .cloned();
        if let Some(trigger) = &found {
            debug!(
                conversation_id = %event.conversation_id,
                trigger_id = %trigger.id,
                flow_id = %trigger.flow_id,
                "trigger matched"
            );
        }
        found
    }

    /// 执行尝试之后记录命中，不论执行成败
    pub fn record_outcome(&self, trigger: &Trigger, at: DateTime<Utc>, error: Option<&str>) {
        trigger.stats.record(at, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triggers::types::{PatternMode, TriggerKind, TriggerMatcher};

    fn hello(registry: &TriggerRegistry, flow: &str, priority: i32) -> Arc<Trigger> {
        registry
            .create(
                NewTrigger::new(flow, TriggerMatcher::pattern(PatternMode::Contains, "hello"))
                    .priority(priority),
            )
            .unwrap()
    }

    #[test]
    fn higher_priority_wins() {
        let registry = TriggerRegistry::new();
        hello(&registry, "low", 5);
        hello(&registry, "high", 10);
        let event = InboundEvent::text("c1", "Hello there");
        assert_eq!(registry.match_event("", &event).unwrap().flow_id, "high");
    }

    #[test]
    fn ties_break_by_most_recent() {
        let registry = TriggerRegistry::new();
        hello(&registry, "older", 1);
        hello(&registry, "newer", 1);
        let event = InboundEvent::text("c1", "hello");
        assert_eq!(registry.match_event("", &event).unwrap().flow_id, "newer");
    }

    #[test]
    fn disable_is_visible_immediately() {
        let registry = TriggerRegistry::new();
        let high = hello(&registry, "high", 10);
        hello(&registry, "low", 1);
        registry.disable(&high.id).unwrap();
        let event = InboundEvent::text("c1", "hello");
        assert_eq!(registry.match_event("", &event).unwrap().flow_id, "low");

        registry.enable(&high.id).unwrap();
        assert_eq!(registry.match_event("", &event).unwrap().flow_id, "high");
    }

    #[test]
    fn scopes_are_isolated() {
        let registry = TriggerRegistry::new();
        registry
            .create(NewTrigger::new("acme-flow", TriggerMatcher::any_message()).tenant("acme"))
            .unwrap();
        let event = InboundEvent::text("c1", "hi");
        assert!(registry.match_event("globex", &event).is_none());
        assert!(registry.match_event("acme", &event).is_some());
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let registry = TriggerRegistry::new();
        let err = registry
            .create(NewTrigger::new("f", TriggerMatcher::pattern(PatternMode::Regex, "(")))
            .unwrap_err();
        assert!(matches!(err, ChatFlowError::Config(_)));
    }

    #[test]
    fn list_filters_and_update_keeps_stats() {
        let registry = TriggerRegistry::new();
        let t = hello(&registry, "a", 1);
        registry
            .create(NewTrigger::new(
                "b",
                TriggerMatcher::Event {
                    name: "cart_abandoned".into(),
                },
            ))
            .unwrap();

        registry.record_outcome(&t, Utc::now(), Some("boom"));
        let updated = registry
            .update(
                &t.id,
                TriggerUpdate {
                    priority: Some(50),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.stats().error_count, 1);
        assert_eq!(updated.stats().last_error.as_deref(), Some("boom"));

        let events = registry.list(&TriggerFilter {
            kind: Some(TriggerKind::Event),
            ..Default::default()
        });
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].flow_id, "b");
        assert!(registry.delete("missing").is_err());
    }
}
