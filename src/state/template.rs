use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use super::variables::{stringify, Variables};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder regex is valid"));

/// 渲染 `{{a.b.c}}` 占位符
///
/// 无法解析的路径渲染为空串，只记录日志，不让消息发送失败。
pub fn resolve(template: &str, scope: &Variables) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let path = caps[1].trim();
            match scope.get(path) {
                Some(value) => stringify(value),
                None => {
                    debug!(path = %path, "unresolved template path rendered as empty string");
                    String::new()
                }
            }
        })
        .into_owned()
}

/// 模板是否恰好是单个占位符（如 `{{age}}`），是则返回路径
pub fn single_placeholder(template: &str) -> Option<&str> {
    let caps = PLACEHOLDER.captures(template.trim())?;
    let whole = caps.get(0)?;
    if whole.as_str().len() == template.trim().len() {
        caps.get(1).map(|m| m.as_str().trim())
    } else {
        None
    }
}

/// 递归解析 JSON 值中的字符串模板
///
/// 单占位符字符串保留原始类型，其余字符串按 [`resolve`] 渲染。
pub fn resolve_value(value: &Value, scope: &Variables) -> Value {
    match value {
        Value::String(template) => {
            if let Some(path) = single_placeholder(template) {
                return match scope.get(path) {
                    Some(found) => found.clone(),
                    None => {
                        debug!(path = %path, "unresolved template path rendered as empty string");
                        Value::String(String::new())
                    }
                };
            }
            Value::String(resolve(template, scope))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, scope)).collect()),
        Value::Object(map) => {
            let resolved: Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, scope)))
                .collect();
            Value::Object(resolved)
        }
        other => other.clone(),
    }
}

/// 解析条件左操作数：含占位符按模板渲染，否则视为变量路径
pub fn resolve_operand(operand: &str, scope: &Variables) -> String {
    if operand.contains("{{") {
        resolve(operand, scope)
    } else {
        scope.get_string(operand).unwrap_or_default()
    }
}
