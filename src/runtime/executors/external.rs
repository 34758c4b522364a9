use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::warn;

use crate::error::NodeError;
use crate::flow::nodes::{handles, ErrorPolicy, ExternalCallConfig, NodeKind};
use crate::flow::Node;
use crate::runtime::capability::{CapabilityKind, CapabilityRequest};
use crate::state::{template, ExecutionContext};

use super::super::types::{ExecutorResult, StateUpdate, Stimulus};
use super::{escalation_result, follow, mismatch, ExecutorEnv, NodeExecutor};

/// 带超时和重试地调用一次能力
///
/// 超时是对调用的硬取消；配置类错误不重试。
pub(crate) async fn invoke_capability(
    kind: CapabilityKind,
    input: Value,
    timeout_seconds: Option<u64>,
    retries: u32,
    node: &Node,
    ctx: &ExecutionContext,
    env: &ExecutorEnv<'_>,
) -> Result<Value, NodeError> {
    let capability = env
        .capabilities
        .get(kind)
        .ok_or_else(|| NodeError::UnsupportedCapability(kind.to_string()))?;
    let limit = env.config.external_timeout(timeout_seconds);
    let request = CapabilityRequest {
        kind,
        conversation_id: ctx.conversation_id.clone(),
        node_id: node.id.clone(),
        input,
    };

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let error = match timeout(limit, capability.invoke(request.clone())).await {
            Ok(Ok(output)) => return Ok(output),
            Ok(Err(err)) => NodeError::External(format!("{err:#}")),
            Err(_) => NodeError::Timeout {
                seconds: limit.as_secs(),
            },
        };

        if attempts > retries {
            return Err(error);
        }
        warn!(
            conversation_id = %ctx.conversation_id,
            node_id = %node.id,
            capability = %kind,
            attempt = attempts,
            retries,
            error = %error,
            "capability call failed, retrying"
        );
    }
}

/// 按节点的错误策略收尾
fn settle(
    node: &Node,
    ctx: &ExecutionContext,
    env: &ExecutorEnv<'_>,
    call: &ExternalCallConfig,
    outcome: Result<Value, NodeError>,
) -> Result<ExecutorResult, NodeError> {
    let error = match outcome {
        Ok(output) => {
            return Ok(follow(node, handles::DEFAULT).with_update(StateUpdate::SetVariable {
                path: call.output_variable.clone(),
                value: output,
            }))
        }
        Err(err) if err.is_configuration() => return Err(err),
        Err(err) => err,
    };

    warn!(
        conversation_id = %ctx.conversation_id,
        node_id = %node.id,
        error = %error,
        "external call failed"
    );
    let reason = error.to_string();
    Ok(match &call.on_error {
        ErrorPolicy::ContinueWithFallback { value } => {
            let handle = if node.edge(handles::ERROR).is_some() {
                handles::ERROR
            } else {
                handles::DEFAULT
            };
            follow(node, handle)
                .with_update(StateUpdate::SetVariable {
                    path: call.output_variable.clone(),
                    value: template::resolve_value(value, &ctx.variables),
                })
                .failed(reason)
        }
        ErrorPolicy::Escalate => escalation_result(node, ctx, env, None, &reason).failed(reason),
    })
}

/// HTTP 请求节点
pub struct ApiCallExecutor;

#[async_trait]
impl NodeExecutor for ApiCallExecutor {
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _stimulus: Stimulus<'_>,
        env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError> {
        let NodeKind::ApiCall(config) = &node.kind else {
            return Err(mismatch(node));
        };

        let request = &config.request;
        let headers: serde_json::Map<String, Value> = request
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(template::resolve(v, &ctx.variables))))
            .collect();
        let input = json!({
            "method": request.method,
            "url": template::resolve(&request.url, &ctx.variables),
            "headers": headers,
            "body": request.body.as_ref().map(|b| template::resolve_value(b, &ctx.variables)),
        });

        let outcome = invoke_capability(
            CapabilityKind::Http,
            input,
            config.call.timeout_seconds,
            config.call.retries,
            node,
            ctx,
            env,
        )
        .await;
        settle(node, ctx, env, &config.call, outcome)
    }
}

/// ai_prompt / database_query / script
///
/// 这些节点的逻辑都在能力实现里，引擎只传入解析后的输入。
/// 数据库参数与查询文本分开传递；脚本只拿到变量的只读快照。
pub struct ExternalCapabilityExecutor;

#[async_trait]
impl NodeExecutor for ExternalCapabilityExecutor {
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _stimulus: Stimulus<'_>,
        env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError> {
        let vars = &ctx.variables;
        let (kind, input, call) = match &node.kind {
            NodeKind::AiPrompt(config) => (
                CapabilityKind::Ai,
                json!({
                    "prompt": template::resolve(&config.prompt, vars),
                    "system": config.system.as_deref().map(|s| template::resolve(s, vars)),
                    "model": config.model,
                }),
                &config.call,
            ),
            NodeKind::DatabaseQuery(config) => {
                let params: Vec<Value> = config
                    .params
                    .iter()
                    .map(|p| template::resolve_value(&Value::String(p.clone()), vars))
                    .collect();
                (
                    CapabilityKind::Database,
                    json!({
                        "query": config.query,
                        "params": params,
                        "connection": config.connection,
                    }),
                    &config.call,
                )
            }
            NodeKind::Script(config) => (
                CapabilityKind::Script,
                json!({
                    "source": config.source,
                    "language": config.language,
                    "inputs": template::resolve_value(&config.inputs, vars),
                    "variables": vars.snapshot(),
                }),
                &config.call,
            ),
            _ => return Err(mismatch(node)),
        };

        let outcome = invoke_capability(
            kind,
            input,
            call.timeout_seconds,
            call.retries,
            node,
            ctx,
            env,
        )
        .await;
        settle(node, ctx, env, call, outcome)
    }
}
