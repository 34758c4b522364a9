// 触发器：匹配入站事件并按优先级选择流程

mod registry;
mod types;

pub use registry::TriggerRegistry;
pub use types::{
    NewTrigger, PatternMode, Trigger, TriggerFilter, TriggerKind, TriggerMatcher, TriggerStats,
    TriggerStatsSnapshot, TriggerStatus, TriggerUpdate,
};
