use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::broadcast::{EventBroadcaster, ExecutionEvent, ExecutionPhase};
use crate::config::EngineConfig;
use crate::error::{ChatFlowError, NodeError, Result};
use crate::flow::{Flow, FlowRegistry};
use crate::state::{ExecutionContext, LeaseGuard};

use super::capability::{CapabilityRegistry, ChannelGateway};
use super::executors::{fallback_result, ExecutorEnv, ExecutorRegistry};
use super::handlers;
use super::random::RandomSource;
use super::types::{Stimulus, Transition, TransitionRequest};

/// 调度循环：反复执行节点直到挂起或结束
///
/// 只在持有会话租约时调用。每次执行器调用前后检查取消与租约超时。
pub(crate) struct Dispatcher<'a> {
    pub flows: &'a FlowRegistry,
    pub executors: &'a ExecutorRegistry,
    pub capabilities: &'a CapabilityRegistry,
    pub gateway: &'a dyn ChannelGateway,
    pub random: &'a dyn RandomSource,
    pub broadcaster: &'a EventBroadcaster,
    pub config: &'a EngineConfig,
}

impl Dispatcher<'_> {
    /// 从入口节点开始一个新流程
    pub async fn start(
        &self,
        ctx: &mut ExecutionContext,
        lease: &LeaseGuard,
        flow: Arc<Flow>,
        entry: String,
        stimulus: Stimulus<'_>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionPhase> {
        ctx.active_flow_id = Some(flow.id.clone());
        ctx.flow_version = Some(flow.version);
        ctx.current_node_id = Some(entry.clone());
        ctx.awaiting_input = None;
        ctx.delay = None;
        info!(
            conversation_id = %ctx.conversation_id,
            flow_id = %flow.id,
            version = flow.version,
            entry = %entry,
            "flow started"
        );
        self.emit(ctx, ExecutionPhase::Started, None, None);
        self.run(ctx, lease, flow, entry, stimulus, now).await
    }

    pub async fn run(
        &self,
        ctx: &mut ExecutionContext,
        lease: &LeaseGuard,
        mut flow: Arc<Flow>,
        mut node_id: String,
        mut stimulus: Stimulus<'_>,
        now: DateTime<Utc>,
    ) -> Result<ExecutionPhase> {
        let mut steps = 0u32;
        loop {
            if lease.is_cancelled() {
                return Ok(self.cancel(ctx, &node_id));
            }
            if lease.is_expired() {
                return Err(ChatFlowError::LeaseExpired(ctx.conversation_id.clone()));
            }

            steps += 1;
            if steps > self.config.max_steps_per_run {
                let err = ChatFlowError::MaxStepsExceeded(self.config.max_steps_per_run);
                return Ok(self.fail(ctx, &node_id, &err.to_string()));
            }

            let Some(node) = flow.node(&node_id) else {
                let err = ChatFlowError::UnknownNode {
                    flow: flow.id.clone(),
                    node: node_id.clone(),
                };
                return Ok(self.fail(ctx, &node_id, &err.to_string()));
            };
            let Some(executor) = self.executors.get(node.tag()) else {
                let reason = format!("no executor registered for {} nodes", node.tag());
                return Ok(self.fail(ctx, &node_id, &reason));
            };

            ctx.current_node_id = Some(node_id.clone());
            let phase = match stimulus {
                Stimulus::Enter => ExecutionPhase::NodeStarted,
                _ => ExecutionPhase::Resumed,
            };
            self.emit(ctx, phase, Some(&node_id), None);
            debug!(
                conversation_id = %ctx.conversation_id,
                flow_id = %flow.id,
                node_id = %node_id,
                kind = %node.tag(),
                "executing node"
            );

            let env = ExecutorEnv {
                flow: &flow,
                config: self.config,
                capabilities: self.capabilities,
                random: self.random,
                now,
            };
            let result = match executor.execute(node, ctx, stimulus, &env).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(
                        conversation_id = %ctx.conversation_id,
                        node_id = %node_id,
                        error = %err,
                        "node failed"
                    );
                    fallback_result(node, ctx, &env, &err)
                }
            };

            // 结果尚未应用，取消时直接丢弃
            if lease.is_cancelled() {
                return Ok(self.cancel(ctx, &node_id));
            }

            let mut jump = None;
            let result = match &result.transition {
                Transition::Jump(request) => match self.resolve_jump(&flow, request) {
                    Ok(target) => {
                        jump = Some(target);
                        result
                    }
                    Err(err) => {
                        warn!(
                            conversation_id = %ctx.conversation_id,
                            node_id = %node_id,
                            error = %err,
                            "jump target unresolved"
                        );
                        fallback_result(node, ctx, &env, &err)
                    }
                },
                _ => result,
            };

            handlers::apply_updates(ctx, result.updates);
            handlers::dispatch_effects(self.gateway, result.effects).await;

            match &result.failure {
                Some(reason) => self.emit(ctx, ExecutionPhase::NodeFailed, Some(&node_id), Some(reason)),
                None if !matches!(result.transition, Transition::Suspend) => {
                    self.emit(ctx, ExecutionPhase::NodeCompleted, Some(&node_id), None)
                }
                None => {}
            }

            match result.transition {
                Transition::Next(next) => {
                    node_id = next;
                    stimulus = Stimulus::Enter;
                }
                Transition::Suspend => {
                    ctx.current_node_id = Some(node_id.clone());
                    self.emit(ctx, ExecutionPhase::Suspended, Some(&node_id), None);
                    return Ok(ExecutionPhase::Suspended);
                }
                Transition::Complete => {
                    ctx.finish_flow();
                    info!(conversation_id = %ctx.conversation_id, flow_id = %flow.id, "flow completed");
                    self.emit(ctx, ExecutionPhase::Completed, Some(&node_id), None);
                    return Ok(ExecutionPhase::Completed);
                }
                Transition::Handoff => {
                    ctx.deactivate();
                    info!(conversation_id = %ctx.conversation_id, node_id = %node_id, "conversation handed off");
                    self.emit(ctx, ExecutionPhase::Completed, Some(&node_id), None);
                    return Ok(ExecutionPhase::Completed);
                }
                Transition::Jump(request) => {
                    let Some((target_flow, target_node)) = jump.take() else {
                        return Ok(self.fail(ctx, &node_id, "jump without resolved target"));
                    };
                    if request.clear_context {
                        ctx.variables.clear();
                    }
                    if target_flow.id != flow.id {
                        info!(
                            conversation_id = %ctx.conversation_id,
                            from = %flow.id,
                            to = %target_flow.id,
                            "cross-flow jump"
                        );
                        ctx.active_flow_id = Some(target_flow.id.clone());
                        ctx.flow_version = Some(target_flow.version);
                        self.emit(ctx, ExecutionPhase::Started, None, None);
                    }
                    flow = target_flow;
                    node_id = target_node;
                    stimulus = Stimulus::Enter;
                }
            }
        }
    }

    fn resolve_jump(
        &self,
        current: &Arc<Flow>,
        request: &TransitionRequest,
    ) -> std::result::Result<(Arc<Flow>, String), NodeError> {
        let flow = match request.target_flow.as_deref() {
            Some(id) if id != current.id => self
                .flows
                .get(id)
                .ok_or_else(|| NodeError::JumpTarget(format!("flow `{id}` not registered")))?,
            _ => Arc::clone(current),
        };
        let node = request
            .target_node
            .clone()
            .unwrap_or_else(|| flow.start.clone());
        if !flow.contains(&node) {
            return Err(NodeError::JumpTarget(format!(
                "node `{node}` not found in flow `{}`",
                flow.id
            )));
        }
        Ok((flow, node))
    }

    fn cancel(&self, ctx: &mut ExecutionContext, node_id: &str) -> ExecutionPhase {
        info!(conversation_id = %ctx.conversation_id, node_id = %node_id, "execution cancelled");
        let flow_id = ctx.active_flow_id.clone();
        ctx.deactivate();
        let event = ExecutionEvent::new(&ctx.conversation_id, flow_id, ExecutionPhase::Cancelled)
            .with_node(node_id);
        self.broadcaster.publish(event);
        ExecutionPhase::Cancelled
    }

    fn fail(&self, ctx: &mut ExecutionContext, node_id: &str, reason: &str) -> ExecutionPhase {
        warn!(
            conversation_id = %ctx.conversation_id,
            node_id = %node_id,
            reason = %reason,
            "flow failed"
        );
        self.emit(ctx, ExecutionPhase::Failed, Some(node_id), Some(reason));
        ctx.finish_flow();
        ExecutionPhase::Failed
    }

    fn emit(
        &self,
        ctx: &ExecutionContext,
        phase: ExecutionPhase,
        node_id: Option<&str>,
        error: Option<&str>,
    ) {
        let mut event = ExecutionEvent::new(&ctx.conversation_id, ctx.active_flow_id.clone(), phase)
            .with_variables(
                self.config
                    .broadcast_variables
                    .then(|| ctx.variables.snapshot()),
            );
        if let Some(node_id) = node_id {
            event = event.with_node(node_id);
        }
        if let Some(error) = error {
            event = event.with_error(error);
        }
        self.broadcaster.publish(event);
    }
}
