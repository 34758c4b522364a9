// 会话状态模块

mod context;
mod lease;
mod store;
pub mod template;
mod variables;

pub use context::{AwaitingInput, ChannelCapability, DelayTimer, ExecutionContext, ExpectedInput};
pub use lease::{LeaseGuard, LeaseManager};
#[cfg(feature = "redis-store")]
pub use store::redis::RedisStore;
pub use store::{ContextStore, MemoryStore};
pub use variables::{stringify, Variables};
