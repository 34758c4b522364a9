use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::broadcast::ExecutionPhase;
use crate::state::{AwaitingInput, ChannelCapability, DelayTimer};

/// 入站事件（由渠道适配器归一化）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(default = "event_id")]
    pub id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub contact_id: Option<String>,
    #[serde(default)]
    pub capability: ChannelCapability,
    pub payload: InboundPayload,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl InboundEvent {
    pub fn new(conversation_id: impl Into<String>, payload: InboundPayload) -> Self {
        Self {
            id: event_id(),
            conversation_id: conversation_id.into(),
            tenant: String::new(),
            contact_id: None,
            capability: ChannelCapability::default(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn text(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(conversation_id, InboundPayload::Text { text: text.into() })
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self
    }

    pub fn with_contact(mut self, contact_id: impl Into<String>) -> Self {
        self.contact_id = Some(contact_id.into());
        self
    }

    pub fn with_capability(mut self, capability: ChannelCapability) -> Self {
        self.capability = capability;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// 写入 `message` 变量的内容
    pub fn as_variable(&self) -> Value {
        let mut value = json!({
            "id": self.id,
            "type": self.payload.kind(),
            "timestamp": self.timestamp.to_rfc3339(),
        });
        if let Some(text) = self.payload.text() {
            value["text"] = Value::String(text.to_string());
        }
        match &self.payload {
            InboundPayload::Media { url, .. } => value["url"] = Value::String(url.clone()),
            InboundPayload::Interactive { id, .. } => {
                value["reply_id"] = Value::String(id.clone())
            }
            InboundPayload::Event { name, data } => {
                value["name"] = Value::String(name.clone());
                value["data"] = data.clone();
            }
            _ => {}
        }
        value
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundPayload {
    Text {
        text: String,
    },
    Media {
        url: String,
        #[serde(default)]
        media_type: Option<String>,
        #[serde(default)]
        caption: Option<String>,
    },
    /// 按钮或列表的回复
    Interactive {
        id: String,
        title: String,
    },
    Event {
        name: String,
        #[serde(default)]
        data: Value,
    },
    Scheduled {
        schedule: String,
    },
}

impl InboundPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundPayload::Text { .. } => "text",
            InboundPayload::Media { .. } => "media",
            InboundPayload::Interactive { .. } => "interactive",
            InboundPayload::Event { .. } => "event",
            InboundPayload::Scheduled { .. } => "scheduled",
        }
    }

    /// 用户可见文本：文本消息、媒体说明或交互回复的标题
    pub fn text(&self) -> Option<&str> {
        match self {
            InboundPayload::Text { text } => Some(text),
            InboundPayload::Media { caption, .. } => caption.as_deref(),
            InboundPayload::Interactive { title, .. } => Some(title),
            _ => None,
        }
    }
}

/// 出站消息类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    Text,
    Media,
    Template,
    Buttons,
    List,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub conversation_id: String,
    pub kind: OutboundKind,
    pub content: Value,
}

impl OutboundMessage {
    pub fn text(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            kind: OutboundKind::Text,
            content: json!({ "text": text.into() }),
        }
    }

    /// 文本内容（若有）
    pub fn text_content(&self) -> Option<&str> {
        self.content
            .get("text")
            .or_else(|| self.content.get("body"))
            .and_then(Value::as_str)
    }
}

/// 转人工请求
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub conversation_id: String,
    pub flow_id: Option<String>,
    pub node_id: String,
    pub queue: Option<String>,
    pub agent: Option<String>,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub conversation_id: String,
    pub flow_id: Option<String>,
    pub node_id: String,
    pub name: String,
    pub properties: Value,
    pub timestamp: DateTime<Utc>,
}

/// 执行器产生、由调度循环执行的副作用
#[derive(Clone, Debug, PartialEq)]
pub enum SideEffect {
    Send(OutboundMessage),
    Escalate(Escalation),
    Track(AnalyticsEvent),
}

/// 执行器对上下文的修改请求，由调度循环应用
#[derive(Clone, Debug, PartialEq)]
pub enum StateUpdate {
    SetVariable { path: String, value: Value },
    AwaitInput(AwaitingInput),
    ClearAwait,
    StartDelay(DelayTimer),
    ClearDelay,
}

/// 跳转请求；跨流程时切换 activeFlowId
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub target_flow: Option<String>,
    pub target_node: Option<String>,
    pub clear_context: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    Next(String),
    Suspend,
    Complete,
    Jump(TransitionRequest),
    /// 转人工，本次执行终止
    Handoff,
}

/// 节点执行结果
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutorResult {
    pub transition: Transition,
    pub effects: Vec<SideEffect>,
    pub updates: Vec<StateUpdate>,
    /// 节点失败但已按策略给出去向时的原因
    pub failure: Option<String>,
}

impl ExecutorResult {
    pub fn new(transition: Transition) -> Self {
        Self {
            transition,
            effects: Vec::new(),
            updates: Vec::new(),
            failure: None,
        }
    }

    pub fn next(node_id: impl Into<String>) -> Self {
        Self::new(Transition::Next(node_id.into()))
    }

    pub fn suspend() -> Self {
        Self::new(Transition::Suspend)
    }

    pub fn complete() -> Self {
        Self::new(Transition::Complete)
    }

    pub fn with_effect(mut self, effect: SideEffect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_update(mut self, update: StateUpdate) -> Self {
        self.updates.push(update);
        self
    }

    pub fn with_updates(mut self, updates: impl IntoIterator<Item = StateUpdate>) -> Self {
        self.updates.extend(updates);
        self
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    pub fn next_node_id(&self) -> Option<&str> {
        match &self.transition {
            Transition::Next(id) => Some(id),
            _ => None,
        }
    }

    pub fn suspends(&self) -> bool {
        matches!(self.transition, Transition::Suspend)
    }
}

/// 触发执行器的原因
#[derive(Clone, Copy, Debug)]
pub enum Stimulus<'a> {
    /// 首次进入节点
    Enter,
    /// 挂起中的问题收到输入
    Input(&'a InboundEvent),
    /// 问题等待超时
    Timeout,
    /// delay 到期
    Resume,
}

/// 被忽略的原因
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    BotInactive,
    DelayPending,
}

/// `handle_event` 的结果
#[derive(Clone, Debug, PartialEq)]
pub enum EngineOutcome {
    Advanced {
        flow_id: String,
        phase: ExecutionPhase,
    },
    Ignored(IgnoreReason),
    /// 无触发器命中且无默认流程
    Dropped,
}
