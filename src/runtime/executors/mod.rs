// 节点执行器：每种节点一个，按类型标签分派

mod action;
mod basic;
mod condition;
mod datetime;
mod external;
mod interactive;
mod question;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::config::EngineConfig;
use crate::error::NodeError;
use crate::flow::nodes::{handles, HandoffNode};
use crate::flow::{Flow, Node, NodeKindTag};
use crate::state::{template, ExecutionContext};

use super::capability::CapabilityRegistry;
use super::random::RandomSource;
use super::types::{
    Escalation, ExecutorResult, OutboundMessage, SideEffect, Stimulus, Transition,
};

pub use action::ActionExecutor;
pub use basic::{
    AnalyticsExecutor, DelayExecutor, HandoffExecutor, JumpExecutor, MessageExecutor,
    SetVariableExecutor, StartExecutor,
};
pub use condition::{ConditionExecutor, RandomExecutor};
pub use datetime::DatetimeExecutor;
pub use external::{ApiCallExecutor, ExternalCapabilityExecutor};
pub use interactive::{ButtonsExecutor, ListExecutor, TemplateExecutor};
pub use question::{validate_answer, QuestionExecutor};

/// 执行器可读取的运行环境
pub struct ExecutorEnv<'a> {
    pub flow: &'a Flow,
    pub config: &'a EngineConfig,
    pub capabilities: &'a CapabilityRegistry,
    pub random: &'a dyn RandomSource,
    pub now: DateTime<Utc>,
}

impl ExecutorEnv<'_> {
    /// `now + duration`，超出可表示范围时取最大时间
    pub fn after(&self, duration: Duration) -> DateTime<Utc> {
        i64::try_from(duration.as_secs())
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|delta| self.now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// 节点执行器
///
/// 执行器只读上下文，把修改和副作用放进 `ExecutorResult` 交给调度循环，
/// 因此对同一上下文重复调用得到相同的去向。
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        stimulus: Stimulus<'_>,
        env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError>;
}

/// 类型标签 -> 执行器
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<NodeKindTag, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册全部内置执行器
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(NodeKindTag::Start, Arc::new(StartExecutor));
        registry.register(NodeKindTag::Message, Arc::new(MessageExecutor));
        registry.register(NodeKindTag::Question, Arc::new(QuestionExecutor));
        registry.register(NodeKindTag::Condition, Arc::new(ConditionExecutor));
        registry.register(NodeKindTag::Handoff, Arc::new(HandoffExecutor));
        registry.register(NodeKindTag::Delay, Arc::new(DelayExecutor));
        registry.register(NodeKindTag::Jump, Arc::new(JumpExecutor));
        registry.register(NodeKindTag::Action, Arc::new(ActionExecutor));
        registry.register(NodeKindTag::ApiCall, Arc::new(ApiCallExecutor));
        registry.register(NodeKindTag::SetVariable, Arc::new(SetVariableExecutor));
        registry.register(NodeKindTag::Random, Arc::new(RandomExecutor));
        registry.register(NodeKindTag::Datetime, Arc::new(DatetimeExecutor));
        registry.register(NodeKindTag::Analytics, Arc::new(AnalyticsExecutor));

        let external: Arc<dyn NodeExecutor> = Arc::new(ExternalCapabilityExecutor);
        registry.register(NodeKindTag::AiPrompt, Arc::clone(&external));
        registry.register(NodeKindTag::DatabaseQuery, Arc::clone(&external));
        registry.register(NodeKindTag::Script, external);

        registry.register(NodeKindTag::WhatsappTemplate, Arc::new(TemplateExecutor));
        registry.register(NodeKindTag::InteractiveButtons, Arc::new(ButtonsExecutor));
        registry.register(NodeKindTag::InteractiveList, Arc::new(ListExecutor));
        registry
    }

    pub fn register(&mut self, tag: NodeKindTag, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(tag, executor);
    }

    pub fn get(&self, tag: NodeKindTag) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(&tag).map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

/// 沿句柄前进；没有该出边时结束流程
pub(crate) fn follow(node: &Node, handle: &str) -> ExecutorResult {
    match node.edge(handle) {
        Some(target) => ExecutorResult::next(target),
        None => ExecutorResult::complete(),
    }
}

/// 转人工：可选告别语 + escalation 副作用，终止本次执行
pub(crate) fn escalation_result(
    node: &Node,
    ctx: &ExecutionContext,
    env: &ExecutorEnv<'_>,
    handoff: Option<&HandoffNode>,
    reason: &str,
) -> ExecutorResult {
    let mut result = ExecutorResult::new(Transition::Handoff);

    let farewell = handoff
        .and_then(|h| h.message.as_deref())
        .or(env.config.handoff_message.as_deref());
    if let Some(text) = farewell {
        let text = template::resolve(text, &ctx.variables);
        if !text.is_empty() {
            result = result.with_effect(SideEffect::Send(OutboundMessage::text(
                &ctx.conversation_id,
                text,
            )));
        }
    }

    result.with_effect(SideEffect::Escalate(Escalation {
        conversation_id: ctx.conversation_id.clone(),
        flow_id: ctx.active_flow_id.clone(),
        node_id: node.id.clone(),
        queue: handoff.and_then(|h| h.queue.clone()),
        agent: handoff.and_then(|h| h.agent.clone()),
        reason: handoff
            .and_then(|h| h.reason.clone())
            .unwrap_or_else(|| reason.to_string()),
    }))
}

/// 节点失败后的去向：有 `error` 出边走该边，否则转人工
pub(crate) fn fallback_result(
    node: &Node,
    ctx: &ExecutionContext,
    env: &ExecutorEnv<'_>,
    error: &NodeError,
) -> ExecutorResult {
    let reason = error.to_string();
    match node.edge(handles::ERROR) {
        Some(target) => ExecutorResult::next(target).failed(reason),
        None => escalation_result(node, ctx, env, None, &reason).failed(reason),
    }
}

pub(crate) fn mismatch(node: &Node) -> NodeError {
    NodeError::Configuration(format!(
        "executor cannot handle {} node `{}`",
        node.tag(),
        node.id
    ))
}


#[cfg(test)]
mod tests {
    use super::testing::TestEnv;
    use super::*;
    use crate::flow::nodes::NodeKind;

    #[test]
    fn deadline_saturates_instead_of_overflowing() {
        let test = TestEnv::new(Flow::new(
            "flow",
            "start",
            vec![Node::new("start", NodeKind::Start)],
        ));
        let env = test.env();
        assert_eq!(
            env.after(Duration::from_secs(30)),
            test.now + TimeDelta::seconds(30)
        );
        assert_eq!(env.after(Duration::from_secs(u64::MAX)), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            env.after(Duration::from_secs(i64::MAX as u64 / 1_000)),
            DateTime::<Utc>::MAX_UTC
        );
    }
}
