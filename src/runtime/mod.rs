// 运行时：节点执行、调度循环与引擎入口

pub mod capability;
mod engine;
pub mod executors;
mod handlers;
mod processor;
pub mod random;
mod types;

pub use capability::{
    capability_from_fn, Capability, CapabilityKind, CapabilityRegistry, CapabilityRequest,
    ChannelGateway, GatewayRecord, NullGateway, RecordingGateway,
};
#[cfg(feature = "http-client")]
pub use capability::HttpCapability;
pub use engine::FlowEngine;
pub use executors::{ExecutorEnv, ExecutorRegistry, NodeExecutor};
pub use random::{pick_weighted, RandomSource, SeededRandom, ThreadRandom};
pub use types::{
    AnalyticsEvent, EngineOutcome, Escalation, ExecutorResult, IgnoreReason, InboundEvent,
    InboundPayload, OutboundKind, OutboundMessage, SideEffect, StateUpdate, Stimulus, Transition,
    TransitionRequest,
};
