use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::nodes::{handles, NodeKind, NodeKindTag};

/// Flow 节点
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct Node {
    pub id: String,
    pub name: Option<String>,
    pub kind: NodeKind,
    /// 句柄 -> 目标节点
    pub edges: BTreeMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            edges: BTreeMap::new(),
        }
    }

    pub fn with_edge(mut self, handle: impl Into<String>, target: impl Into<String>) -> Self {
        self.edges.insert(handle.into(), target.into());
        self
    }

    pub fn tag(&self) -> NodeKindTag {
        self.kind.tag()
    }

    pub fn edge(&self, handle: &str) -> Option<&str> {
        self.edges.get(handle).map(String::as_str)
    }

    pub fn default_edge(&self) -> Option<&str> {
        self.edge(handles::DEFAULT)
    }
}

/// JSON 中的节点表示：`type` + `config` + `edges`
#[derive(Clone, Debug, Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "type")]
    node_type: NodeKindTag,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    config: Value,
    #[serde(default)]
    edges: BTreeMap<String, String>,
}

impl TryFrom<RawNode> for Node {
    type Error = String;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let kind = NodeKind::from_config(raw.node_type, raw.config).map_err(|e| {
            format!(
                "invalid config for {} node `{}`: {}",
                raw.node_type, raw.id, e
            )
        })?;
        Ok(Node {
            id: raw.id,
            name: raw.name,
            kind,
            edges: raw.edges,
        })
    }
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        let node_type = node.kind.tag();
        RawNode {
            id: node.id,
            name: node.name,
            node_type,
            config: node.kind.to_config().unwrap_or(Value::Null),
            edges: node.edges,
        }
    }
}

/// 已发布的流程定义，发布后不可变
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "FlowDefinition", into = "FlowDefinition")]
pub struct Flow {
    pub id: String,
    pub name: Option<String>,
    pub version: u32,
    pub start: String,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct FlowDefinition {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    version: u32,
    start: String,
    nodes: Vec<Node>,
}

impl From<FlowDefinition> for Flow {
    fn from(def: FlowDefinition) -> Self {
        let mut flow = Flow::new(def.id, def.start, def.nodes);
        flow.name = def.name;
        flow.version = def.version;
        flow
    }
}

impl From<Flow> for FlowDefinition {
    fn from(flow: Flow) -> Self {
        FlowDefinition {
            id: flow.id,
            name: flow.name,
            version: flow.version,
            start: flow.start,
            nodes: flow.nodes,
        }
    }
}

impl Flow {
    pub fn new(id: impl Into<String>, start: impl Into<String>, nodes: Vec<Node>) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(pos, node)| (node.id.clone(), pos))
            .collect();
        Self {
            id: id.into(),
            name: None,
            version: 0,
            start: start.into(),
            nodes,
            index,
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).and_then(|pos| self.nodes.get(*pos))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// 按定义顺序
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.node(&self.start)
    }

    pub(crate) fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}
