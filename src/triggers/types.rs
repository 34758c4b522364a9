use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{ChatFlowError, Result};
use crate::runtime::{InboundEvent, InboundPayload};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    MessagePattern,
    Scheduled,
    Event,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    #[default]
    Active,
    Inactive,
}

/// 消息匹配方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternMode {
    /// 任意消息
    #[default]
    Any,
    Exact,
    Contains,
    StartsWith,
    /// 包含任一关键词
    Keywords,
    Regex,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerMatcher {
    MessagePattern {
        #[serde(default)]
        mode: PatternMode,
        #[serde(default)]
        value: String,
        #[serde(default)]
        keywords: Vec<String>,
        #[serde(default)]
        case_sensitive: bool,
    },
    Event {
        name: String,
    },
    /// 由外部调度器按名称发出的定时事件
    Scheduled {
        schedule: String,
    },
}

impl TriggerMatcher {
    pub fn any_message() -> Self {
        TriggerMatcher::MessagePattern {
            mode: PatternMode::Any,
            value: String::new(),
            keywords: Vec::new(),
            case_sensitive: false,
        }
    }

    pub fn pattern(mode: PatternMode, value: impl Into<String>) -> Self {
        TriggerMatcher::MessagePattern {
            mode,
            value: value.into(),
            keywords: Vec::new(),
            case_sensitive: false,
        }
    }

    pub fn keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TriggerMatcher::MessagePattern {
            mode: PatternMode::Keywords,
            value: String::new(),
            keywords: keywords.into_iter().map(Into::into).collect(),
            case_sensitive: false,
        }
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerMatcher::MessagePattern { .. } => TriggerKind::MessagePattern,
            TriggerMatcher::Event { .. } => TriggerKind::Event,
            TriggerMatcher::Scheduled { .. } => TriggerKind::Scheduled,
        }
    }

    /// regex 模式在创建时编译，非法表达式直接拒绝
    pub(crate) fn compile(&self) -> Result<Option<Regex>> {
        match self {
            TriggerMatcher::MessagePattern {
                mode: PatternMode::Regex,
                value,
                case_sensitive,
                ..
            } => RegexBuilder::new(value)
                .case_insensitive(!case_sensitive)
                .build()
                .map(Some)
                .map_err(|e| ChatFlowError::Config(format!("invalid trigger regex `{value}`: {e}"))),
            _ => Ok(None),
        }
    }
}

/// 触发统计，原子计数，不依赖执行是否成功
#[derive(Debug, Default)]
pub struct TriggerStats {
    trigger_count: AtomicU64,
    error_count: AtomicU64,
    last_triggered_at: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerStatsSnapshot {
    pub trigger_count: u64,
    pub error_count: u64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl TriggerStats {
    pub fn record(&self, at: DateTime<Utc>, error: Option<&str>) {
        self.trigger_count.fetch_add(1, Ordering::Relaxed);
        {
            let mut last = self.last_triggered_at.lock();
            if last.map_or(true, |prev| prev < at) {
                *last = Some(at);
            }
        }
        if let Some(error) = error {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            *self.last_error.lock() = Some(error.to_string());
        }
    }

    pub fn snapshot(&self) -> TriggerStatsSnapshot {
        TriggerStatsSnapshot {
            trigger_count: self.trigger_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_triggered_at: *self.last_triggered_at.lock(),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// 触发器：决定入站事件由哪个流程处理
#[derive(Clone, Debug)]
pub struct Trigger {
    pub id: String,
    pub tenant: String,
    pub flow_id: String,
    pub name: Option<String>,
    /// 缺省时从流程 start 进入
    pub entry_node: Option<String>,
    pub status: TriggerStatus,
    /// 越大越先匹配
    pub priority: i32,
    pub matcher: TriggerMatcher,
    pub created_at: DateTime<Utc>,
    pub(crate) seq: u64,
    pub(crate) compiled: Option<Regex>,
    pub(crate) stats: Arc<TriggerStats>,
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        self.matcher.kind()
    }

    pub fn is_active(&self) -> bool {
        self.status == TriggerStatus::Active
    }

    pub fn stats(&self) -> TriggerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn matches(&self, event: &InboundEvent) -> bool {
        match (&self.matcher, &event.payload) {
            (TriggerMatcher::Event { name }, InboundPayload::Event { name: got, .. }) => {
                name == got
            }
            (
                TriggerMatcher::Scheduled { schedule },
                InboundPayload::Scheduled { schedule: got },
            ) => schedule == got,
            (
                TriggerMatcher::MessagePattern {
                    mode,
                    value,
                    keywords,
                    case_sensitive,
                },
                payload,
            ) => {
                if matches!(
                    payload,
                    InboundPayload::Event { .. } | InboundPayload::Scheduled { .. }
                ) {
                    return false;
                }
                if *mode == PatternMode::Any {
                    return true;
                }
                let Some(text) = payload.text() else {
                    return false;
                };
                let fold = |s: &str| {
                    if *case_sensitive {
                        s.trim().to_string()
                    } else {
                        s.trim().to_lowercase()
                    }
                };
                let text = fold(text);
                match mode {
                    PatternMode::Any => true,
                    PatternMode::Exact => text == fold(value),
                    PatternMode::Contains => text.contains(&fold(value)),
                    PatternMode::StartsWith => text.starts_with(&fold(value)),
                    PatternMode::Keywords => keywords
                        .iter()
                        .map(|k| fold(k))
                        .any(|k| !k.is_empty() && text.contains(&k)),
                    PatternMode::Regex => self
                        .compiled
                        .as_ref()
                        .is_some_and(|re| re.is_match(&text)),
                }
            }
            _ => false,
        }
    }
}

/// 新建触发器的参数
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewTrigger {
    pub flow_id: String,
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub entry_node: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub status: TriggerStatus,
    pub matcher: TriggerMatcher,
}

impl NewTrigger {
    pub fn new(flow_id: impl Into<String>, matcher: TriggerMatcher) -> Self {
        Self {
            flow_id: flow_id.into(),
            tenant: String::new(),
            name: None,
            entry_node: None,
            priority: 0,
            status: TriggerStatus::Active,
            matcher,
        }
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn entry_node(mut self, node: impl Into<String>) -> Self {
        self.entry_node = Some(node.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// 部分更新
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TriggerUpdate {
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub entry_node: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub status: Option<TriggerStatus>,
    #[serde(default)]
    pub matcher: Option<TriggerMatcher>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TriggerFilter {
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub kind: Option<TriggerKind>,
    #[serde(default)]
    pub status: Option<TriggerStatus>,
}

impl TriggerFilter {
    pub fn matches(&self, trigger: &Trigger) -> bool {
        self.tenant.as_ref().map_or(true, |t| *t == trigger.tenant)
            && self.flow_id.as_ref().map_or(true, |f| *f == trigger.flow_id)
            && self.kind.map_or(true, |k| k == trigger.kind())
            && self.status.map_or(true, |s| s == trigger.status)
    }
}
