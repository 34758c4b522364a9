use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::broadcast::{EventBroadcaster, ExecutionEvent, ExecutionPhase};
use crate::config::EngineConfig;
use crate::error::{ChatFlowError, Result};
use crate::flow::{Flow, FlowRegistry};
use crate::state::{ContextStore, ExecutionContext, LeaseManager, MemoryStore};
use crate::triggers::TriggerRegistry;

use super::capability::{CapabilityRegistry, ChannelGateway, NullGateway};
use super::executors::ExecutorRegistry;
use super::processor::Dispatcher;
use super::random::{RandomSource, ThreadRandom};
use super::types::{EngineOutcome, IgnoreReason, InboundEvent, Stimulus};

/// 一次扫描中并发处理的会话数
const SWEEP_CONCURRENCY: usize = 16;

/// 会话流程引擎
///
/// 每个会话的处理都在租约内串行进行：加载上下文、推进流程、保存，最后释放租约。
#[derive(Clone)]
pub struct FlowEngine {
    config: Arc<EngineConfig>,
    flows: Arc<FlowRegistry>,
    triggers: Arc<TriggerRegistry>,
    store: Arc<dyn ContextStore>,
    leases: Arc<LeaseManager>,
    executors: Arc<ExecutorRegistry>,
    capabilities: Arc<CapabilityRegistry>,
    gateway: Arc<dyn ChannelGateway>,
    random: Arc<dyn RandomSource>,
    broadcaster: EventBroadcaster,
}

impl FlowEngine {
    pub fn new(config: EngineConfig) -> Self {
        let leases = Arc::new(LeaseManager::new(
            config.lease_acquire_timeout(),
            config.lease_max_hold(),
        ));
        let broadcaster = EventBroadcaster::new(config.broadcast_capacity);
        Self {
            config: Arc::new(config),
            flows: Arc::new(FlowRegistry::new()),
            triggers: Arc::new(TriggerRegistry::new()),
            store: Arc::new(MemoryStore::new()),
            leases,
            executors: Arc::new(ExecutorRegistry::with_defaults()),
            capabilities: Arc::new(CapabilityRegistry::new()),
            gateway: Arc::new(NullGateway),
            random: Arc::new(ThreadRandom),
            broadcaster,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ContextStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn ChannelGateway>) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityRegistry) -> Self {
        self.capabilities = Arc::new(capabilities);
        self
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = Arc::new(executors);
        self
    }

    pub fn with_flows(mut self, flows: Arc<FlowRegistry>) -> Self {
        self.flows = flows;
        self
    }

    pub fn with_triggers(mut self, triggers: Arc<TriggerRegistry>) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn flows(&self) -> &Arc<FlowRegistry> {
        &self.flows
    }

    pub fn triggers(&self) -> &Arc<TriggerRegistry> {
        &self.triggers
    }

    /// 发布流程（校验并分配版本）
    pub fn publish(&self, flow: Flow) -> Result<Arc<Flow>> {
        self.flows.publish(flow)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.broadcaster.subscribe()
    }

    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher {
            flows: &self.flows,
            executors: &self.executors,
            capabilities: &self.capabilities,
            gateway: self.gateway.as_ref(),
            random: self.random.as_ref(),
            broadcaster: &self.broadcaster,
            config: &self.config,
        }
    }

    /// 会话停留的流程版本
    fn pinned_flow(&self, ctx: &ExecutionContext) -> Result<Arc<Flow>> {
        let flow_id = ctx
            .active_flow_id
            .as_deref()
            .ok_or_else(|| ChatFlowError::FlowNotRegistered(String::new()))?;
        self.flows.resolve(flow_id, ctx.flow_version)
    }

    fn default_flow(&self, ctx: &ExecutionContext) -> Option<Arc<Flow>> {
        ctx.default_flow_id
            .as_deref()
            .or(self.config.default_flow_id.as_deref())
            .and_then(|id| self.flows.get(id))
    }

    async fn load_or_new(&self, conversation_id: &str, tenant: &str) -> Result<ExecutionContext> {
        Ok(self
            .store
            .load(conversation_id)
            .await?
            .unwrap_or_else(|| ExecutionContext::new(conversation_id, tenant)))
    }

    /// 处理一条入站事件
    ///
    /// 返回 `Err` 且 `is_fatal()` 时上下文未保存，调用方不应确认该事件。
    #[instrument(skip(self, event), fields(conversation_id = %event.conversation_id))]
    pub async fn handle_event(&self, event: InboundEvent) -> Result<EngineOutcome> {
        let lease = self.leases.acquire(&event.conversation_id).await?;
        let mut ctx = self
            .load_or_new(&event.conversation_id, &event.tenant)
            .await?;

        if !ctx.bot_active {
            debug!("bot inactive, event ignored");
            return Ok(EngineOutcome::Ignored(IgnoreReason::BotInactive));
        }
        if ctx.delay.is_some() {
            debug!("delay pending, event ignored");
            return Ok(EngineOutcome::Ignored(IgnoreReason::DelayPending));
        }

        if !event.tenant.is_empty() {
            ctx.tenant = event.tenant.clone();
        }
        if event.contact_id.is_some() {
            ctx.contact_id = event.contact_id.clone();
        }
        ctx.channel = event.capability;
        ctx.variables.set("message", event.as_variable());
        ctx.touch();

        let now = event.timestamp;
        let dispatcher = self.dispatcher();

        // 已在流程中：挂起的问题接收回答，中断在其他节点的从该节点重跑
        if let Some(node_id) = ctx.current_node_id.clone() {
            match self.pinned_flow(&ctx) {
                Ok(flow) => {
                    let (node_id, stimulus) = match &ctx.awaiting_input {
                        Some(awaiting) => (awaiting.node_id.clone(), Stimulus::Input(&event)),
                        None => (node_id, Stimulus::Enter),
                    };
                    let phase = dispatcher
                        .run(&mut ctx, &lease, flow, node_id, stimulus, now)
                        .await?;
                    self.store.save(&ctx).await?;
                    return Ok(EngineOutcome::Advanced {
                        flow_id: ctx.active_flow_id.clone().unwrap_or_default(),
                        phase,
                    });
                }
                Err(err) => {
                    warn!(error = %err, "pinned flow unavailable, leaving it");
                    ctx.finish_flow();
                }
            }
        }

        let mut selected = None;
        if let Some(trigger) = self.triggers.match_event(&ctx.tenant, &event) {
            match self.flows.get(&trigger.flow_id) {
                Some(flow) => selected = Some((flow, trigger.entry_node.clone(), Some(trigger))),
                None => {
                    let err = ChatFlowError::FlowNotRegistered(trigger.flow_id.clone());
                    warn!(trigger_id = %trigger.id, error = %err, "trigger points at missing flow");
                    self.triggers
                        .record_outcome(&trigger, now, Some(&err.to_string()));
                }
            }
        }
        let selected = selected.or_else(|| self.default_flow(&ctx).map(|flow| (flow, None, None)));

        let Some((flow, entry, trigger)) = selected else {
            debug!("no trigger matched and no default flow, event dropped");
            self.store.save(&ctx).await?;
            return Ok(EngineOutcome::Dropped);
        };

        let entry = entry.unwrap_or_else(|| flow.start.clone());
        let outcome = dispatcher
            .start(&mut ctx, &lease, Arc::clone(&flow), entry, Stimulus::Enter, now)
            .await;

        if let Some(trigger) = &trigger {
            let error = match &outcome {
                Err(err) => Some(err.to_string()),
                Ok(ExecutionPhase::Failed) => Some(format!("flow `{}` failed", flow.id)),
                Ok(_) => None,
            };
            self.triggers.record_outcome(trigger, now, error.as_deref());
        }

        let phase = outcome?;
        self.store.save(&ctx).await?;
        Ok(EngineOutcome::Advanced {
            flow_id: ctx.active_flow_id.clone().unwrap_or_else(|| flow.id.clone()),
            phase,
        })
    }

    /// 处理一个会话到期的问题或 delay
    ///
    /// 截止时间在租约内重新检查，同一截止时间只会处理一次。
    #[instrument(skip(self))]
    pub async fn expire(
        &self,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionPhase>> {
        let lease = self.leases.acquire(conversation_id).await?;
        let Some(mut ctx) = self.store.load(conversation_id).await? else {
            return Ok(None);
        };
        if !ctx.bot_active {
            return Ok(None);
        }

        let due = match (&ctx.awaiting_input, &ctx.delay) {
            (Some(awaiting), _) if awaiting.deadline <= now => {
                Some((awaiting.node_id.clone(), Stimulus::Timeout))
            }
            (_, Some(timer)) if timer.resume_at <= now => {
                Some((timer.node_id.clone(), Stimulus::Resume))
            }
            _ => None,
        };
        let Some((node_id, stimulus)) = due else {
            return Ok(None);
        };

        let flow = match self.pinned_flow(&ctx) {
            Ok(flow) => flow,
            Err(err) => {
                warn!(error = %err, "pinned flow unavailable, leaving it");
                ctx.finish_flow();
                self.store.save(&ctx).await?;
                return Ok(Some(ExecutionPhase::Failed));
            }
        };

        let phase = self
            .dispatcher()
            .run(&mut ctx, &lease, flow, node_id, stimulus, now)
            .await?;
        self.store.save(&ctx).await?;
        Ok(Some(phase))
    }

    /// 扫描所有到期会话，返回推进的数量
    ///
    /// 不同会话并发处理；单个会话失败只记录日志，不影响其他会话。
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.due(now).await?;
        let advanced = stream::iter(due)
            .map(|conversation_id| async move {
                match self.expire(&conversation_id, now).await {
                    Ok(phase) => phase.is_some(),
                    Err(err) => {
                        warn!(
                            conversation_id = %conversation_id,
                            error = %err,
                            "failed to expire conversation"
                        );
                        false
                    }
                }
            })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .filter(|advanced| futures::future::ready(*advanced))
            .count()
            .await;
        Ok(advanced)
    }

    /// 外部停用：在下一个安全检查点抢占正在执行的节点
    #[instrument(skip(self))]
    pub async fn deactivate(&self, conversation_id: &str) -> Result<()> {
        self.leases.request_cancel(conversation_id);
        let (ctx, was_running) = match self.deactivate_locked(conversation_id).await {
            Ok(done) => done,
            Err(err) => {
                // 停用失败时取消请求不能留给后续执行
                self.leases.clear_cancel(conversation_id);
                return Err(err);
            }
        };

        if was_running {
            self.broadcaster.publish(ExecutionEvent::new(
                conversation_id,
                ctx.active_flow_id.clone(),
                ExecutionPhase::Cancelled,
            ));
        }
        info!("conversation deactivated");
        Ok(())
    }

    async fn deactivate_locked(&self, conversation_id: &str) -> Result<(ExecutionContext, bool)> {
        let _lease = self.leases.acquire(conversation_id).await?;
        let mut ctx = self.load_or_new(conversation_id, "").await?;
        let was_running = ctx.in_flow();
        ctx.deactivate();
        ctx.touch();
        self.store.save(&ctx).await?;
        self.leases.clear_cancel(conversation_id);
        Ok((ctx, was_running))
    }

    /// 重新激活会话；给出流程时立即从其入口开始
    #[instrument(skip(self))]
    pub async fn activate(
        &self,
        conversation_id: &str,
        flow_id: Option<&str>,
    ) -> Result<Option<ExecutionPhase>> {
        let flow = flow_id
            .map(|id| {
                self.flows
                    .get(id)
                    .ok_or_else(|| ChatFlowError::FlowNotRegistered(id.to_string()))
            })
            .transpose()?;

        let lease = self.leases.acquire(conversation_id).await?;
        self.leases.clear_cancel(conversation_id);
        let mut ctx = self.load_or_new(conversation_id, "").await?;
        ctx.bot_active = true;
        ctx.finish_flow();
        ctx.touch();

        let phase = match flow {
            Some(flow) => {
                let entry = flow.start.clone();
                Some(
                    self.dispatcher()
                        .start(&mut ctx, &lease, flow, entry, Stimulus::Enter, Utc::now())
                        .await?,
                )
            }
            None => None,
        };
        self.store.save(&ctx).await?;
        info!("conversation activated");
        Ok(phase)
    }

    /// 绑定会话的默认流程，无触发器命中时使用
    pub async fn bind_default_flow(&self, conversation_id: &str, flow_id: Option<&str>) -> Result<()> {
        if let Some(id) = flow_id {
            if self.flows.get(id).is_none() {
                return Err(ChatFlowError::FlowNotRegistered(id.to_string()));
            }
        }
        let _lease = self.leases.acquire(conversation_id).await?;
        let mut ctx = self.load_or_new(conversation_id, "").await?;
        ctx.default_flow_id = flow_id.map(str::to_string);
        ctx.touch();
        self.store.save(&ctx).await
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let _lease = self.leases.acquire(conversation_id).await?;
        self.store.delete(conversation_id).await?;
        info!(conversation_id = %conversation_id, "conversation deleted");
        Ok(())
    }

    /// 读取上下文快照
    pub async fn context(&self, conversation_id: &str) -> Result<Option<ExecutionContext>> {
        self.store.load(conversation_id).await
    }
}
