use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::variables::Variables;

/// 问题节点期望的输入类型
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedInput {
    Text,
    Number,
    Email,
    Phone,
    Date,
    Enum,
}

/// 渠道能力标志，决定交互/模板节点能否发送
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCapability {
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub templates: bool,
}

impl ChannelCapability {
    pub fn full() -> Self {
        Self {
            interactive: true,
            templates: true,
        }
    }

    pub fn text_only() -> Self {
        Self::default()
    }
}

/// 问题节点挂起时的等待描述
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AwaitingInput {
    pub node_id: String,
    pub since: DateTime<Utc>,
    pub expected: ExpectedInput,
    pub deadline: DateTime<Utc>,
    /// 已失败的作答/超时次数
    #[serde(default)]
    pub attempts: u32,
}

/// delay 节点的恢复定时
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DelayTimer {
    pub node_id: String,
    pub resume_at: DateTime<Utc>,
}

/// 每个会话唯一的可变执行状态
///
/// 只在持有该会话租约时读写。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub conversation_id: String,
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub contact_id: Option<String>,
    /// 最近一次入站事件的渠道能力
    #[serde(default)]
    pub channel: ChannelCapability,
    pub active_flow_id: Option<String>,
    #[serde(default)]
    pub flow_version: Option<u32>,
    /// None 表示机器人未在流程中（已完成或已转人工）
    pub current_node_id: Option<String>,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub awaiting_input: Option<AwaitingInput>,
    #[serde(default)]
    pub delay: Option<DelayTimer>,
    pub bot_active: bool,
    /// 会话绑定的默认流程，无触发器命中时使用
    #[serde(default)]
    pub default_flow_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(conversation_id: impl Into<String>, tenant: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            tenant: tenant.into(),
            contact_id: None,
            channel: ChannelCapability::default(),
            active_flow_id: None,
            flow_version: None,
            current_node_id: None,
            variables: Variables::new(),
            awaiting_input: None,
            delay: None,
            bot_active: true,
            default_flow_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_contact(mut self, contact_id: impl Into<String>) -> Self {
        self.contact_id = Some(contact_id.into());
        self
    }

    /// 是否停在问题或 delay 上
    pub fn is_suspended(&self) -> bool {
        self.awaiting_input.is_some() || self.delay.is_some()
    }

    /// 是否在流程中（不论是否挂起）
    pub fn in_flow(&self) -> bool {
        self.current_node_id.is_some()
    }

    /// 最早到期的时间点（问题截止或 delay 恢复）
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        let question = self.awaiting_input.as_ref().map(|a| a.deadline);
        let delay = self.delay.as_ref().map(|d| d.resume_at);
        match (question, delay) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_deadline().map(|d| d <= now).unwrap_or(false)
    }

    /// 流程结束：位置清空，机器人保持激活，等待下一次触发
    pub fn finish_flow(&mut self) {
        self.current_node_id = None;
        self.awaiting_input = None;
        self.delay = None;
    }

    /// 转人工或外部停用：机器人不再处理后续事件
    pub fn deactivate(&mut self) {
        self.finish_flow();
        self.bot_active = false;
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn next_deadline_picks_earliest() {
        let now = Utc::now();
        let mut ctx = ExecutionContext::new("c1", "t1");
        assert!(ctx.next_deadline().is_none());

        ctx.delay = Some(DelayTimer {
            node_id: "wait".into(),
            resume_at: now + Duration::seconds(30),
        });
        ctx.awaiting_input = Some(AwaitingInput {
            node_id: "ask".into(),
            since: now,
            expected: ExpectedInput::Text,
            deadline: now + Duration::seconds(10),
            attempts: 0,
        });
        assert_eq!(ctx.next_deadline(), Some(now + Duration::seconds(10)));
        assert!(ctx.is_due(now + Duration::seconds(10)));
        assert!(!ctx.is_due(now));
    }

    #[test]
    fn deactivate_clears_position() {
        let mut ctx = ExecutionContext::new("c1", "t1");
        ctx.current_node_id = Some("n1".into());
        ctx.deactivate();
        assert!(!ctx.bot_active);
        assert!(ctx.current_node_id.is_none());
    }
}
