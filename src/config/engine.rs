use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::env::EnvConfig;
use crate::error::{ChatFlowError, Result};

/// delay 节点的硬上限（秒）
pub const MAX_DELAY_SECS: u64 = 60;

/// 问题节点的默认等待时间（秒）
pub const DEFAULT_QUESTION_TIMEOUT_SECS: u64 = 3600;

/// 引擎配置
///
/// 支持 JSON 文件加载，并可通过 `CHATFLOW_*` 环境变量覆盖：
/// - CHATFLOW_QUESTION_TIMEOUT_SECS
/// - CHATFLOW_INACTIVITY_TIMEOUT_SECS
/// - CHATFLOW_EXTERNAL_TIMEOUT_SECS
/// - CHATFLOW_MAX_STEPS
/// - CHATFLOW_SWEEP_INTERVAL_MS
/// - CHATFLOW_HANDOFF_MESSAGE
/// - CHATFLOW_DEFAULT_FLOW
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_question_timeout_secs: u64,
    pub inactivity_timeout_secs: Option<u64>,
    pub max_delay_secs: u64,
    pub external_call_timeout_secs: u64,
    pub lease_acquire_timeout_ms: u64,
    pub lease_max_hold_secs: u64,
    pub max_steps_per_run: u32,
    pub sweep_interval_ms: u64,
    pub broadcast_capacity: usize,
    pub broadcast_variables: bool,
    pub handoff_message: Option<String>,
    pub default_flow_id: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_question_timeout_secs: DEFAULT_QUESTION_TIMEOUT_SECS,
            inactivity_timeout_secs: None,
            max_delay_secs: MAX_DELAY_SECS,
            external_call_timeout_secs: 30,
            lease_acquire_timeout_ms: 5_000,
            lease_max_hold_secs: 120,
            max_steps_per_run: 256,
            sweep_interval_ms: 1_000,
            broadcast_capacity: 1024,
            broadcast_variables: false,
            handoff_message: None,
            default_flow_id: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| ChatFlowError::Config(format!("failed to parse engine config: {}", e)))?;
        Ok(config.normalized())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ChatFlowError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// 读取环境变量覆盖当前配置
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(value) = EnvConfig::get_parsed::<u64>("CHATFLOW_QUESTION_TIMEOUT_SECS")? {
            self.default_question_timeout_secs = value;
        }
        if let Some(value) = EnvConfig::get_parsed::<u64>("CHATFLOW_INACTIVITY_TIMEOUT_SECS")? {
            self.inactivity_timeout_secs = Some(value);
        }
        if let Some(value) = EnvConfig::get_parsed::<u64>("CHATFLOW_EXTERNAL_TIMEOUT_SECS")? {
            self.external_call_timeout_secs = value;
        }
        if let Some(value) = EnvConfig::get_parsed::<u32>("CHATFLOW_MAX_STEPS")? {
            self.max_steps_per_run = value;
        }
        if let Some(value) = EnvConfig::get_parsed::<u64>("CHATFLOW_SWEEP_INTERVAL_MS")? {
            self.sweep_interval_ms = value;
        }
        if let Some(value) = EnvConfig::get_env_optional("CHATFLOW_HANDOFF_MESSAGE") {
            self.handoff_message = Some(value);
        }
        if let Some(value) = EnvConfig::get_env_optional("CHATFLOW_DEFAULT_FLOW") {
            self.default_flow_id = Some(value);
        }
        Ok(self.normalized())
    }

    fn normalized(mut self) -> Self {
        self.max_delay_secs = self.max_delay_secs.min(MAX_DELAY_SECS);
        self.max_steps_per_run = self.max_steps_per_run.max(1);
        self.broadcast_capacity = self.broadcast_capacity.max(1);
        self
    }

    /// 问题节点等待时长：节点配置 > 不活跃设置 > 默认值
    pub fn question_timeout(&self, node_timeout_secs: Option<u64>) -> Duration {
        let secs = node_timeout_secs
            .or(self.inactivity_timeout_secs)
            .unwrap_or(self.default_question_timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn delay(&self, configured_secs: u64) -> Duration {
        Duration::from_secs(configured_secs.min(self.max_delay_secs.min(MAX_DELAY_SECS)))
    }

    pub fn external_timeout(&self, node_timeout_secs: Option<u64>) -> Duration {
        Duration::from_secs(node_timeout_secs.unwrap_or(self.external_call_timeout_secs))
    }

    pub fn lease_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_acquire_timeout_ms)
    }

    pub fn lease_max_hold(&self) -> Duration {
        Duration::from_secs(self.lease_max_hold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_cap() {
        let config = EngineConfig {
            max_delay_secs: 600,
            ..EngineConfig::default()
        };
        assert_eq!(config.delay(300), Duration::from_secs(60));
        assert_eq!(config.delay(5), Duration::from_secs(5));
    }

    #[test]
    fn inactivity_setting_overrides_default_timeout() {
        let mut config = EngineConfig::default();
        assert_eq!(config.question_timeout(None), Duration::from_secs(3600));

        config.inactivity_timeout_secs = Some(900);
        assert_eq!(config.question_timeout(None), Duration::from_secs(900));
        assert_eq!(config.question_timeout(Some(5)), Duration::from_secs(5));
    }

    #[test]
    fn json_config_is_normalized() {
        let config = EngineConfig::from_json(r#"{"max_delay_secs": 3600, "max_steps_per_run": 0}"#)
            .expect("config parses");
        assert_eq!(config.max_delay_secs, MAX_DELAY_SECS);
        assert_eq!(config.max_steps_per_run, 1);
        assert_eq!(config.external_call_timeout_secs, 30);
    }
}
