use tracing::warn;

use crate::state::ExecutionContext;

use super::capability::ChannelGateway;
use super::types::{SideEffect, StateUpdate};

/// 应用执行器返回的状态修改
pub(crate) fn apply_updates(ctx: &mut ExecutionContext, updates: Vec<StateUpdate>) {
    for update in updates {
        match update {
            StateUpdate::SetVariable { path, value } => ctx.variables.set(&path, value),
            StateUpdate::AwaitInput(awaiting) => ctx.awaiting_input = Some(awaiting),
            StateUpdate::ClearAwait => ctx.awaiting_input = None,
            StateUpdate::StartDelay(timer) => ctx.delay = Some(timer),
            StateUpdate::ClearDelay => ctx.delay = None,
        }
    }
    ctx.touch();
}

/// 按顺序执行副作用
///
/// 传输失败只记录日志；分析事件永远不影响流程。
pub(crate) async fn dispatch_effects(gateway: &dyn ChannelGateway, effects: Vec<SideEffect>) {
    for effect in effects {
        match effect {
            SideEffect::Send(message) => {
                let conversation_id = message.conversation_id.clone();
                if let Err(err) = gateway.send(message).await {
                    warn!(conversation_id = %conversation_id, error = %err, "outbound send failed");
                }
            }
            SideEffect::Escalate(escalation) => {
                let conversation_id = escalation.conversation_id.clone();
                if let Err(err) = gateway.escalate(escalation).await {
                    warn!(conversation_id = %conversation_id, error = %err, "escalation delivery failed");
                }
            }
            SideEffect::Track(event) => {
                let name = event.name.clone();
                if let Err(err) = gateway.track(event).await {
                    warn!(event = %name, error = %err, "analytics event dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::capability::RecordingGateway;
    use crate::runtime::types::OutboundMessage;
    use crate::state::DelayTimer;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn updates_apply_in_order() {
        let mut ctx = ExecutionContext::new("c1", "");
        apply_updates(
            &mut ctx,
            vec![
                StateUpdate::SetVariable {
                    path: "a.b".into(),
                    value: json!(1),
                },
                StateUpdate::StartDelay(DelayTimer {
                    node_id: "wait".into(),
                    resume_at: Utc::now(),
                }),
                StateUpdate::ClearDelay,
            ],
        );
        assert_eq!(ctx.variables.get("a.b"), Some(&json!(1)));
        assert!(ctx.delay.is_none());
    }

    #[tokio::test]
    async fn effects_reach_gateway() {
        let gateway = RecordingGateway::new();
        dispatch_effects(
            &gateway,
            vec![
                SideEffect::Send(OutboundMessage::text("c1", "one")),
                SideEffect::Send(OutboundMessage::text("c1", "two")),
            ],
        )
        .await;
        assert_eq!(gateway.sent_texts(), vec!["one", "two"]);
    }
}
