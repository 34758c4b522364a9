use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::NodeError;
use crate::flow::nodes::{handles, ActionKind, NodeKind};
use crate::flow::Node;
use crate::runtime::capability::CapabilityKind;
use crate::state::{template, ExecutionContext};

use super::super::types::{ExecutorResult, StateUpdate, Stimulus};
use super::external::invoke_capability;
use super::{fallback_result, follow, mismatch, ExecutorEnv, NodeExecutor};

/// 批量动作：按顺序执行，各自成败独立；blocking 动作失败时中断整批
pub struct ActionExecutor;

impl ActionExecutor {
    fn request(action: &ActionKind, ctx: &ExecutionContext) -> (CapabilityKind, Value) {
        let vars = &ctx.variables;
        match action {
            ActionKind::Webhook {
                url,
                method,
                headers,
                body,
            } => {
                let headers: serde_json::Map<String, Value> = headers
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(template::resolve(v, vars))))
                    .collect();
                (
                    CapabilityKind::Webhook,
                    json!({
                        "method": method,
                        "url": template::resolve(url, vars),
                        "headers": headers,
                        "body": template::resolve_value(body, vars),
                    }),
                )
            }
            ActionKind::UpsertContact { attributes } => (
                CapabilityKind::Contact,
                json!({
                    "contact_id": ctx.contact_id,
                    "attributes": template::resolve_value(&Value::Object(attributes.clone()), vars),
                }),
            ),
            ActionKind::Enqueue { queue, payload } => (
                CapabilityKind::Queue,
                json!({
                    "queue": template::resolve(queue, vars),
                    "payload": template::resolve_value(payload, vars),
                }),
            ),
        }
    }
}

#[async_trait]
impl NodeExecutor for ActionExecutor {
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _stimulus: Stimulus<'_>,
        env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError> {
        let NodeKind::Action(config) = &node.kind else {
            return Err(mismatch(node));
        };

        let mut outcomes = Vec::with_capacity(config.actions.len());
        let mut blocked: Option<NodeError> = None;
        for step in &config.actions {
            let (kind, input) = Self::request(&step.action, ctx);
            match invoke_capability(kind, input, None, 0, node, ctx, env).await {
                Ok(output) => outcomes.push(json!({
                    "action": step.action.name(),
                    "ok": true,
                    "output": output,
                })),
                Err(err) => {
                    warn!(
                        conversation_id = %ctx.conversation_id,
                        node_id = %node.id,
                        action = step.action.name(),
                        blocking = step.blocking,
                        error = %err,
                        "action failed"
                    );
                    outcomes.push(json!({
                        "action": step.action.name(),
                        "ok": false,
                        "error": err.to_string(),
                    }));
                    if step.blocking {
                        blocked = Some(err);
                        break;
                    }
                }
            }
        }

        let record = config.result_variable.as_ref().map(|path| StateUpdate::SetVariable {
            path: path.clone(),
            value: Value::Array(outcomes),
        });

        let result = match blocked {
            Some(err) => fallback_result(node, ctx, env, &err),
            None => follow(node, handles::DEFAULT),
        };
        Ok(result.with_updates(record))
    }
}
