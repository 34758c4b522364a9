use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::error::{ChatFlowError, Result};
use crate::flow::types::Flow;
use crate::flow::validation::validate_flow;

/// Flow 注册表
///
/// 发布即校验并生成新版本；已发布版本不会被原地修改。
#[derive(Default)]
pub struct FlowRegistry {
    flows: RwLock<HashMap<String, Vec<Arc<Flow>>>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
        }
    }

    /// 校验并发布，返回带版本号的不可变流程
    pub fn publish(&self, flow: Flow) -> Result<Arc<Flow>> {
        validate_flow(&flow)?;
        let mut flows = self.flows.write();
        let versions = flows.entry(flow.id.clone()).or_default();
        let version = versions.last().map(|f| f.version + 1).unwrap_or(1);
        let published = Arc::new(flow.with_version(version));
        versions.push(Arc::clone(&published));
        info!(flow_id = %published.id, version, "flow published");
        Ok(published)
    }

    /// 最新版本
    pub fn get(&self, id: &str) -> Option<Arc<Flow>> {
        self.flows.read().get(id).and_then(|v| v.last().cloned())
    }

    pub fn get_version(&self, id: &str, version: u32) -> Option<Arc<Flow>> {
        self.flows
            .read()
            .get(id)
            .and_then(|versions| versions.iter().find(|f| f.version == version).cloned())
    }

    /// 优先取指定版本，不存在时退回最新版本
    pub fn resolve(&self, id: &str, version: Option<u32>) -> Result<Arc<Flow>> {
        version
            .and_then(|v| self.get_version(id, v))
            .or_else(|| self.get(id))
            .ok_or_else(|| ChatFlowError::FlowNotRegistered(id.to_string()))
    }

    pub fn versions(&self, id: &str) -> Vec<u32> {
        self.flows
            .read()
            .get(id)
            .map(|versions| versions.iter().map(|f| f.version).collect())
            .unwrap_or_default()
    }

    pub fn list(&self) -> Vec<Arc<Flow>> {
        self.flows
            .read()
            .values()
            .filter_map(|versions| versions.last().cloned())
            .collect()
    }

    pub fn remove(&self, id: &str) -> bool {
        self.flows.write().remove(id).is_some()
    }
}
