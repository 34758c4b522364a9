use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::types::{AnalyticsEvent, Escalation, OutboundMessage};

/// 外部能力种类
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Http,
    Webhook,
    Contact,
    Queue,
    Ai,
    Database,
    Script,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Http => "http",
            CapabilityKind::Webhook => "webhook",
            CapabilityKind::Contact => "contact",
            CapabilityKind::Queue => "queue",
            CapabilityKind::Ai => "ai",
            CapabilityKind::Database => "database",
            CapabilityKind::Script => "script",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次能力调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub kind: CapabilityKind,
    pub conversation_id: String,
    pub node_id: String,
    /// 已解析模板的输入
    pub input: Value,
}

/// 外部能力：HTTP、数据库、脚本、AI 等
///
/// 引擎只负责超时、重试和错误策略，调用内部逻辑由实现方提供。
#[async_trait]
pub trait Capability: Send + Sync {
    fn kind(&self) -> CapabilityKind;
    async fn invoke(&self, request: CapabilityRequest) -> anyhow::Result<Value>;
}

struct FnCapability<F> {
    kind: CapabilityKind,
    handler: F,
}

#[async_trait]
impl<F> Capability for FnCapability<F>
where
    F: Fn(&CapabilityRequest) -> anyhow::Result<Value> + Send + Sync,
{
    fn kind(&self) -> CapabilityKind {
        self.kind
    }

    async fn invoke(&self, request: CapabilityRequest) -> anyhow::Result<Value> {
        (self.handler)(&request)
    }
}

/// 用同步闭包构造能力
pub fn capability_from_fn<F>(kind: CapabilityKind, handler: F) -> Arc<dyn Capability>
where
    F: Fn(&CapabilityRequest) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(FnCapability { kind, handler })
}

#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<CapabilityKind, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        self.capabilities.insert(capability.kind(), capability);
    }

    pub fn with(mut self, capability: Arc<dyn Capability>) -> Self {
        self.register(capability);
        self
    }

    pub fn get(&self, kind: CapabilityKind) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(&kind).map(Arc::clone)
    }

    pub fn contains(&self, kind: CapabilityKind) -> bool {
        self.capabilities.contains_key(&kind)
    }
}

/// 出站渠道
#[async_trait]
pub trait ChannelGateway: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<()>;
    async fn escalate(&self, escalation: Escalation) -> anyhow::Result<()>;
    async fn track(&self, _event: AnalyticsEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 只写日志的网关
#[derive(Clone, Copy, Debug, Default)]
pub struct NullGateway;

#[async_trait]
impl ChannelGateway for NullGateway {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<()> {
        info!(
            conversation_id = %message.conversation_id,
            kind = ?message.kind,
            "outbound message dropped (no gateway)"
        );
        Ok(())
    }

    async fn escalate(&self, escalation: Escalation) -> anyhow::Result<()> {
        info!(
            conversation_id = %escalation.conversation_id,
            node_id = %escalation.node_id,
            reason = %escalation.reason,
            "escalation dropped (no gateway)"
        );
        Ok(())
    }
}

/// 网关收到的记录
#[derive(Clone, Debug, PartialEq)]
pub enum GatewayRecord {
    Sent(OutboundMessage),
    Escalated(Escalation),
    Tracked(AnalyticsEvent),
}

/// 把所有出站内容记在内存里，供 CLI 模拟和测试读取
#[derive(Default)]
pub struct RecordingGateway {
    records: Mutex<Vec<GatewayRecord>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<GatewayRecord> {
        self.records.lock().clone()
    }

    pub fn drain(&self) -> Vec<GatewayRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                GatewayRecord::Sent(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    /// 发送过的文本
    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|m| m.text_content().map(str::to_string))
            .collect()
    }

    pub fn escalations(&self) -> Vec<Escalation> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                GatewayRecord::Escalated(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn tracked(&self) -> Vec<AnalyticsEvent> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                GatewayRecord::Tracked(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ChannelGateway for RecordingGateway {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<()> {
        self.records.lock().push(GatewayRecord::Sent(message));
        Ok(())
    }

    async fn escalate(&self, escalation: Escalation) -> anyhow::Result<()> {
        self.records.lock().push(GatewayRecord::Escalated(escalation));
        Ok(())
    }

    async fn track(&self, event: AnalyticsEvent) -> anyhow::Result<()> {
        self.records.lock().push(GatewayRecord::Tracked(event));
        Ok(())
    }
}

#[cfg(feature = "http-client")]
pub use http::HttpCapability;

#[cfg(feature = "http-client")]
mod http {
    use std::collections::BTreeMap;

    use anyhow::{anyhow, Context};
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::{json, Value};
    use tracing::instrument;

    use super::{Capability, CapabilityKind, CapabilityRequest};

    #[derive(Deserialize)]
    struct HttpInput {
        #[serde(default = "default_method")]
        method: String,
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<Value>,
    }

    fn default_method() -> String {
        "GET".to_string()
    }

    /// reqwest 实现的 HTTP / webhook 能力
    pub struct HttpCapability {
        client: reqwest::Client,
        kind: CapabilityKind,
    }

    impl HttpCapability {
        pub fn new() -> Self {
            Self {
                client: reqwest::Client::new(),
                kind: CapabilityKind::Http,
            }
        }

        pub fn webhook() -> Self {
            Self {
                client: reqwest::Client::new(),
                kind: CapabilityKind::Webhook,
            }
        }
    }

    impl Default for HttpCapability {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Capability for HttpCapability {
        fn kind(&self) -> CapabilityKind {
            self.kind
        }

        #[instrument(skip(self, request), fields(node_id = %request.node_id))]
        async fn invoke(&self, request: CapabilityRequest) -> anyhow::Result<Value> {
            let input: HttpInput =
                serde_json::from_value(request.input).context("invalid http request input")?;
            let method = reqwest::Method::from_bytes(input.method.to_uppercase().as_bytes())
                .map_err(|_| anyhow!("unsupported http method `{}`", input.method))?;

            let mut builder = self.client.request(method, &input.url);
            for (name, value) in &input.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = &input.body {
                builder = builder.json(body);
            }

            let response = builder.send().await?;
            let status = response.status();
            let text = response.text().await?;
            if !status.is_success() {
                return Err(anyhow!("request to {} failed with status {}", input.url, status));
            }
            let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
            Ok(json!({ "status": status.as_u16(), "body": body }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fn_capability_receives_request() {
        let registry = CapabilityRegistry::new().with(capability_from_fn(
            CapabilityKind::Database,
            |req| Ok(json!({ "echo": req.input.clone() })),
        ));
        let capability = registry.get(CapabilityKind::Database).unwrap();
        let output = capability
            .invoke(CapabilityRequest {
                kind: CapabilityKind::Database,
                conversation_id: "c1".into(),
                node_id: "n1".into(),
                input: json!({ "query": "select 1" }),
            })
            .await
            .unwrap();
        assert_eq!(output["echo"]["query"], "select 1");
        assert!(!registry.contains(CapabilityKind::Script));
    }
}
