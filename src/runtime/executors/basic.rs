use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::error::NodeError;
use crate::flow::nodes::{handles, NodeKind};
use crate::flow::Node;
use crate::state::{template, DelayTimer, ExecutionContext};

use super::super::types::{
    AnalyticsEvent, ExecutorResult, OutboundKind, OutboundMessage, SideEffect, StateUpdate,
    Stimulus, Transition, TransitionRequest,
};
use super::{escalation_result, follow, mismatch, ExecutorEnv, NodeExecutor};

pub struct StartExecutor;

#[async_trait]
impl NodeExecutor for StartExecutor {
    async fn execute(
        &self,
        node: &Node,
        _ctx: &ExecutionContext,
        _stimulus: Stimulus<'_>,
        _env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError> {
        Ok(follow(node, handles::DEFAULT))
    }
}

/// 文本或媒体消息
pub struct MessageExecutor;

#[async_trait]
impl NodeExecutor for MessageExecutor {
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _stimulus: Stimulus<'_>,
        _env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError> {
        let NodeKind::Message(config) = &node.kind else {
            return Err(mismatch(node));
        };

        let mut result = follow(node, handles::DEFAULT);
        if let Some(text) = &config.text {
            let text = template::resolve(text, &ctx.variables);
            result = result.with_effect(SideEffect::Send(OutboundMessage::text(
                &ctx.conversation_id,
                text,
            )));
        }
        if let Some(media) = &config.media {
            let caption = media
                .caption
                .as_deref()
                .map(|c| template::resolve(c, &ctx.variables));
            result = result.with_effect(SideEffect::Send(OutboundMessage {
                conversation_id: ctx.conversation_id.clone(),
                kind: OutboundKind::Media,
                content: json!({
                    "url": template::resolve(&media.url, &ctx.variables),
                    "media_type": media.media_type,
                    "caption": caption,
                }),
            }));
        }
        Ok(result)
    }
}

/// 变量赋值；后面的赋值能看到前面赋值的结果
pub struct SetVariableExecutor;

#[async_trait]
impl NodeExecutor for SetVariableExecutor {
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _stimulus: Stimulus<'_>,
        _env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError> {
        let NodeKind::SetVariable(config) = &node.kind else {
            return Err(mismatch(node));
        };

        let mut working = ctx.variables.clone();
        let mut updates = Vec::with_capacity(config.assignments.len());
        for assignment in &config.assignments {
            let value = template::resolve_value(&assignment.value, &working);
            working.set(&assignment.variable, value.clone());
            updates.push(StateUpdate::SetVariable {
                path: assignment.variable.clone(),
                value,
            });
        }
        Ok(follow(node, handles::DEFAULT).with_updates(updates))
    }
}

/// 延迟，最多挂起 `max_delay_secs`
pub struct DelayExecutor;

#[async_trait]
impl NodeExecutor for DelayExecutor {
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        stimulus: Stimulus<'_>,
        env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError> {
        let NodeKind::Delay(config) = &node.kind else {
            return Err(mismatch(node));
        };

        match stimulus {
            Stimulus::Enter => {
                let resume_at = env.after(env.config.delay(config.seconds));
                debug!(
                    conversation_id = %ctx.conversation_id,
                    node_id = %node.id,
                    %resume_at,
                    "delay scheduled"
                );
                Ok(ExecutorResult::suspend().with_update(StateUpdate::StartDelay(DelayTimer {
                    node_id: node.id.clone(),
                    resume_at,
                })))
            }
            Stimulus::Resume | Stimulus::Timeout => {
                Ok(follow(node, handles::DEFAULT).with_update(StateUpdate::ClearDelay))
            }
            Stimulus::Input(_) => Ok(ExecutorResult::suspend()),
        }
    }
}

/// 跳转请求由调度循环解析和应用
pub struct JumpExecutor;

#[async_trait]
impl NodeExecutor for JumpExecutor {
    async fn execute(
        &self,
        node: &Node,
        _ctx: &ExecutionContext,
        _stimulus: Stimulus<'_>,
        _env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError> {
        let NodeKind::Jump(config) = &node.kind else {
            return Err(mismatch(node));
        };
        if config.target_flow.is_none() && config.target_node.is_none() {
            return Err(NodeError::Configuration(format!(
                "jump node `{}` has no target",
                node.id
            )));
        }

        Ok(ExecutorResult::new(Transition::Jump(TransitionRequest {
            target_flow: config.target_flow.clone(),
            target_node: config.target_node.clone(),
            clear_context: config.clear_context,
        })))
    }
}

pub struct HandoffExecutor;

#[async_trait]
impl NodeExecutor for HandoffExecutor {
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _stimulus: Stimulus<'_>,
        env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError> {
        let NodeKind::Handoff(config) = &node.kind else {
            return Err(mismatch(node));
        };
        Ok(escalation_result(node, ctx, env, Some(config), "handoff"))
    }
}

/// 分析事件，不阻塞也不会失败
pub struct AnalyticsExecutor;

#[async_trait]
impl NodeExecutor for AnalyticsExecutor {
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _stimulus: Stimulus<'_>,
        env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError> {
        let NodeKind::Analytics(config) = &node.kind else {
            return Err(mismatch(node));
        };

        let event = AnalyticsEvent {
            conversation_id: ctx.conversation_id.clone(),
            flow_id: ctx.active_flow_id.clone(),
            node_id: node.id.clone(),
            name: template::resolve(&config.event, &ctx.variables),
            properties: template::resolve_value(&config.properties, &ctx.variables),
            timestamp: env.now,
        };
        Ok(follow(node, handles::DEFAULT).with_effect(SideEffect::Track(event)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, TestEnv};
    use super::*;
    use crate::flow::nodes::{Assignment, SetVariableNode};
    use crate::flow::FlowBuilder;
    use serde_json::json;

    fn flow() -> crate::flow::Flow {
        FlowBuilder::new("flow")
            .add_start_node("start")
            .add_message_node("hello", "Hi {{user.name}}!")
            .add_node(
                "assign",
                NodeKind::SetVariable(SetVariableNode {
                    assignments: vec![
                        Assignment {
                            variable: "count".into(),
                            value: json!(3),
                        },
                        Assignment {
                            variable: "label".into(),
                            value: json!("n={{count}}"),
                        },
                    ],
                }),
            )
            .add_delay_node("wait", 600)
            .add_handoff_node("human", Some("support"), Some("Connecting you, {{user.name}}"))
            .add_message_node("end", "bye")
            .connect("start", "hello")
            .connect("hello", "assign")
            .connect("wait", "end")
            .build()
    }

    #[tokio::test]
    async fn message_renders_template_and_follows_default() {
        let test = TestEnv::new(flow());
        let mut ctx = context();
        ctx.variables.set("user.name", json!("Ana"));

        let result = MessageExecutor
            .execute(test.node("hello"), &ctx, Stimulus::Enter, &test.env())
            .await
            .unwrap();
        assert_eq!(result.next_node_id(), Some("assign"));
        match &result.effects[0] {
            SideEffect::Send(message) => assert_eq!(message.text_content(), Some("Hi Ana!")),
            other => panic!("unexpected effect {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_without_default_edge_completes() {
        let test = TestEnv::new(flow());
        let result = MessageExecutor
            .execute(test.node("end"), &context(), Stimulus::Enter, &test.env())
            .await
            .unwrap();
        assert_eq!(result.transition, Transition::Complete);
    }

    #[tokio::test]
    async fn later_assignments_see_earlier_ones() {
        let test = TestEnv::new(flow());
        let result = SetVariableExecutor
            .execute(test.node("assign"), &context(), Stimulus::Enter, &test.env())
            .await
            .unwrap();
        assert_eq!(
            result.updates[1],
            StateUpdate::SetVariable {
                path: "label".into(),
                value: json!("n=3"),
            }
        );
    }

    #[tokio::test]
    async fn delay_is_capped() {
        let test = TestEnv::new(flow());
        let result = DelayExecutor
            .execute(test.node("wait"), &context(), Stimulus::Enter, &test.env())
            .await
            .unwrap();
        assert!(result.suspends());
        match &result.updates[0] {
            StateUpdate::StartDelay(timer) => {
                assert!(timer.resume_at - test.now <= chrono::TimeDelta::seconds(60));
            }
            other => panic!("unexpected update {other:?}"),
        }

        let resumed = DelayExecutor
            .execute(test.node("wait"), &context(), Stimulus::Resume, &test.env())
            .await
            .unwrap();
        assert_eq!(resumed.next_node_id(), Some("end"));
    }

    #[tokio::test]
    async fn handoff_sends_farewell_and_escalates() {
        let test = TestEnv::new(flow());
        let mut ctx = context();
        ctx.variables.set("user.name", json!("Ana"));
        let result = HandoffExecutor
            .execute(test.node("human"), &ctx, Stimulus::Enter, &test.env())
            .await
            .unwrap();
        assert_eq!(result.transition, Transition::Handoff);
        assert_eq!(result.effects.len(), 2);
        match &result.effects[1] {
            SideEffect::Escalate(escalation) => {
                assert_eq!(escalation.queue.as_deref(), Some("support"))
            }
            other => panic!("unexpected effect {other:?}"),
        }
    }

    #[tokio::test]
    async fn re_running_a_node_is_idempotent() {
        let test = TestEnv::new(flow());
        let ctx = context();
        let first = StartExecutor
            .execute(test.node("start"), &ctx, Stimulus::Enter, &test.env())
            .await
            .unwrap();
        let second = StartExecutor
            .execute(test.node("start"), &ctx, Stimulus::Enter, &test.env())
            .await
            .unwrap();
        assert_eq!(first, second);
    }
}
