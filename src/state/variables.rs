use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 会话变量存储
///
/// 值保持类型（数字/布尔/列表/嵌套对象），只在模板渲染时字符串化。
/// 支持点路径读写，如 `user.address.city`，数组下标写作 `items.0`。
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables {
    inner: Map<String, Value>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = split_path(path);
        let first = segments.next()?;
        let mut current = self.inner.get(first)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// 读取变量并转为字符串，缺失时为 None
    pub fn get_string(&self, path: &str) -> Option<String> {
        self.get(path).map(stringify)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// 按点路径写入，必要时创建中间对象；非对象的中间值会被替换
    pub fn set(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = split_path(path).collect();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };

        let mut current = &mut self.inner;
        for segment in parents {
            let entry = current
                .entry((*segment).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                _ => unreachable!("entry was just coerced into an object"),
            };
        }
        current.insert((*last).to_string(), value);
    }

    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let segments: Vec<&str> = split_path(path).collect();
        let (last, parents) = segments.split_last()?;
        let mut current = &mut self.inner;
        for segment in parents {
            current = match current.get_mut(*segment)? {
                Value::Object(map) => map,
                _ => return None,
            };
        }
        current.remove(*last)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.inner.keys()
    }

    /// 整体快照，用于事件广播与模板上下文
    pub fn snapshot(&self) -> Value {
        Value::Object(self.inner.clone())
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.inner
    }
}

impl From<Map<String, Value>> for Variables {
    fn from(inner: Map<String, Value>) -> Self {
        Self { inner }
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('.')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
}

/// 值的字符串化规则：null 为空串，字符串原样，其余为 JSON 文本
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_creates_intermediate_maps() {
        let mut vars = Variables::new();
        vars.set("user.address.city", json!("Lisbon"));
        assert_eq!(vars.get_string("user.address.city").as_deref(), Some("Lisbon"));
        assert!(vars.get("user.address").unwrap().is_object());
    }

    #[test]
    fn set_replaces_scalar_parent() {
        let mut vars = Variables::new();
        vars.set("user", json!("alice"));
        vars.set("user.name", json!("alice"));
        assert_eq!(vars.get("user"), Some(&json!({"name": "alice"})));
    }

    #[test]
    fn typed_values_are_preserved() {
        let mut vars = Variables::new();
        vars.set("age", json!(42));
        vars.set("vip", json!(true));
        assert_eq!(vars.get("age"), Some(&json!(42)));
        assert_eq!(vars.get_string("vip").as_deref(), Some("true"));
    }

    #[test]
    fn array_index_lookup() {
        let mut vars = Variables::new();
        vars.set("items", json!([{"sku": "a"}, {"sku": "b"}]));
        assert_eq!(vars.get_string("items.1.sku").as_deref(), Some("b"));
        assert!(vars.get("items.5.sku").is_none());
    }

    #[test]
    fn remove_nested_value() {
        let mut vars = Variables::new();
        vars.set("a.b", json!(1));
        vars.set("a.c", json!(2));
        assert_eq!(vars.remove("a.b"), Some(json!(1)));
        assert!(!vars.contains("a.b"));
        assert!(vars.contains("a.c"));
    }
}
