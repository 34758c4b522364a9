use std::path::Path;

use serde_json::Value;

use crate::error::{ChatFlowError, Result};
use crate::flow::types::Flow;

/// 从 JSON 文本加载单个流程
pub fn load_flow_from_str(json: &str) -> Result<Flow> {
    serde_json::from_str(json)
        .map_err(|e| ChatFlowError::Serialization(format!("failed to parse flow: {}", e)))
}

/// 从 JSON 值加载：单个流程对象、流程数组，或 `{"flows": [...]}`
pub fn load_flows_from_value(value: Value) -> Result<Vec<Flow>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) if map.contains_key("flows") => match map.remove("flows") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(ChatFlowError::Serialization(
                    "`flows` must be an array".to_string(),
                ))
            }
        },
        single @ Value::Object(_) => vec![single],
        other => {
            return Err(ChatFlowError::Serialization(format!(
                "expected flow object or array, got {}",
                other
            )))
        }
    };

    items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item)
                .map_err(|e| ChatFlowError::Serialization(format!("failed to parse flow: {}", e)))
        })
        .collect()
}

pub fn load_flows_from_file(path: impl AsRef<Path>) -> Result<Vec<Flow>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ChatFlowError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let value: Value = serde_json::from_str(&raw)?;
    load_flows_from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::nodes::NodeKind;
    use serde_json::json;

    #[test]
    fn parses_typed_node_configs() {
        let flow = load_flow_from_str(
            r#"{
                "id": "survey",
                "start": "start",
                "nodes": [
                    {"id": "start", "type": "start", "edges": {"default": "ask"}},
                    {"id": "ask", "type": "question",
                     "config": {"prompt": "Age?", "variable": "age", "expected": "number", "timeout_seconds": 5},
                     "edges": {"default": "done"}},
                    {"id": "done", "type": "message", "config": {"text": "Thanks {{age}}"}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(flow.nodes().len(), 3);
        match &flow.node("ask").unwrap().kind {
            NodeKind::Question(q) => {
                assert_eq!(q.variable, "age");
                assert_eq!(q.timeout_seconds, Some(5));
                assert_eq!(q.retries, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_an_error() {
        let err = load_flow_from_str(
            r#"{"id": "x", "start": "a", "nodes": [{"id": "a", "type": "teleport"}]}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn flows_wrapper_object() {
        let flows = load_flows_from_value(json!({
            "flows": [
                {"id": "a", "start": "s", "nodes": [{"id": "s", "type": "start", "edges": {"default": "s"}}]},
                {"id": "b", "start": "s", "nodes": [{"id": "s", "type": "start", "edges": {"default": "s"}}]}
            ]
        }))
        .unwrap();
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[1].id, "b");
    }

    #[test]
    fn round_trips_through_serde() {
        let source = json!({
            "id": "r", "start": "s",
            "nodes": [
                {"id": "s", "type": "start", "edges": {"default": "m"}},
                {"id": "m", "type": "message", "config": {"text": "hey"}}
            ]
        });
        let flow: Flow = serde_json::from_value(source).unwrap();
        let back = serde_json::to_value(&flow).unwrap();
        assert_eq!(back["nodes"][1]["type"], "message");
        assert_eq!(back["nodes"][1]["config"]["text"], "hey");
    }
}
