pub mod broadcast;
pub mod config;
pub mod error;
pub mod flow;
pub mod runtime;
pub mod state;
pub mod supervisor;
pub mod triggers;
pub mod utils;

pub use broadcast::{EventBroadcaster, ExecutionEvent, ExecutionPhase};
pub use config::{EngineConfig, EnvConfig};
pub use error::{ChatFlowError, NodeError, Result};
pub use flow::{
    load_flow_from_str, load_flows_from_file, load_flows_from_value, validate_flow, Flow,
    FlowBuilder, FlowRegistry, Node, NodeKind, NodeKindTag,
};
pub use runtime::{
    capability_from_fn, AnalyticsEvent, Capability, CapabilityKind, CapabilityRegistry,
    CapabilityRequest, ChannelGateway, EngineOutcome, Escalation, FlowEngine, GatewayRecord,
    IgnoreReason, InboundEvent, InboundPayload, NullGateway, OutboundKind, OutboundMessage,
    RandomSource, RecordingGateway, SeededRandom, ThreadRandom,
};
#[cfg(feature = "http-client")]
pub use runtime::HttpCapability;
pub use state::{
    AwaitingInput, ChannelCapability, ContextStore, DelayTimer, ExecutionContext, ExpectedInput,
    LeaseManager, MemoryStore, Variables,
};
#[cfg(feature = "redis-store")]
pub use state::RedisStore;
pub use supervisor::{SupervisorHandle, TimeoutSupervisor};
pub use triggers::{
    NewTrigger, PatternMode, Trigger, TriggerFilter, TriggerKind, TriggerMatcher,
    TriggerStatsSnapshot, TriggerStatus, TriggerUpdate, TriggerRegistry,
};
pub use utils::{logging, LoggingConfig};
