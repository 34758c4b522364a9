use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatFlowError>;

#[derive(Debug, Error)]
pub enum ChatFlowError {
    #[error("flow `{flow}` failed validation: {}", problems.join("; "))]
    Validation { flow: String, problems: Vec<String> },
    #[error("flow `{0}` not registered")]
    FlowNotRegistered(String),
    #[error("unknown node `{node}` in flow `{flow}`")]
    UnknownNode { flow: String, node: String },
    #[error("trigger `{0}` not found")]
    TriggerNotFound(String),
    #[error("lease for conversation `{0}` could not be acquired in time")]
    LeaseTimeout(String),
    #[error("lease for conversation `{0}` exceeded its maximum hold time")]
    LeaseExpired(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("maximum steps {0} exceeded")]
    MaxStepsExceeded(u32),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChatFlowError {
    /// 租约/存储失败：本次执行中止，入站事件不应被确认
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChatFlowError::LeaseTimeout(_)
                | ChatFlowError::LeaseExpired(_)
                | ChatFlowError::Storage(_)
        )
    }
}

impl From<serde_json::Error> for ChatFlowError {
    fn from(err: serde_json::Error) -> Self {
        ChatFlowError::Serialization(err.to_string())
    }
}

/// 节点级可恢复错误，不会越过调度循环
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("external call timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("external call failed: {0}")]
    External(String),
    #[error("node misconfigured: {0}")]
    Configuration(String),
    #[error("channel does not support {0}")]
    UnsupportedCapability(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("jump target unresolved: {0}")]
    JumpTarget(String),
}

impl NodeError {
    /// 配置类错误不应重试
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            NodeError::Configuration(_) | NodeError::UnsupportedCapability(_)
        )
    }
}
