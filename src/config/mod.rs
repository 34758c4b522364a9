pub mod engine;
pub mod env;

pub use engine::{EngineConfig, DEFAULT_QUESTION_TIMEOUT_SECS, MAX_DELAY_SECS};
pub use env::EnvConfig;
