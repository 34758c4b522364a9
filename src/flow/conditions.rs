use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::state::template::{resolve, resolve_operand};
use crate::state::Variables;

/// 比较运算符
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    #[serde(alias = "starts_with")]
    StartsWith,
    #[serde(alias = "ends_with")]
    EndsWith,
    In,
    #[serde(alias = "not_in")]
    NotIn,
    #[serde(alias = "is_empty")]
    IsEmpty,
    #[serde(alias = "is_not_empty")]
    IsNotEmpty,
}

impl Operator {
    /// 是否需要右操作数
    pub fn is_unary(&self) -> bool {
        matches!(self, Operator::IsEmpty | Operator::IsNotEmpty)
    }
}

/// 多个谓词的组合方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Logic {
    #[default]
    All,
    Any,
}

/// 单个谓词：左操作数为变量路径或模板，右操作数为模板
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub left: String,
    pub operator: Operator,
    #[serde(default)]
    pub right: Option<String>,
}

impl Predicate {
    pub fn new(left: impl Into<String>, operator: Operator, right: impl Into<String>) -> Self {
        Self {
            left: left.into(),
            operator,
            right: Some(right.into()),
        }
    }

    pub fn unary(left: impl Into<String>, operator: Operator) -> Self {
        Self {
            left: left.into(),
            operator,
            right: None,
        }
    }

    pub fn evaluate(&self, scope: &Variables) -> bool {
        let left = resolve_operand(&self.left, scope);
        if self.operator.is_unary() {
            return evaluate(self.operator, &left, "");
        }
        match &self.right {
            Some(right) => evaluate(self.operator, &left, &resolve(right, scope)),
            None => {
                warn!(operator = ?self.operator, left = %self.left, "predicate missing right operand");
                false
            }
        }
    }
}

/// 按组合方式求值；空列表视为 false
pub fn evaluate_all(predicates: &[Predicate], logic: Logic, scope: &Variables) -> bool {
    if predicates.is_empty() {
        return false;
    }
    match logic {
        Logic::All => predicates.iter().all(|p| p.evaluate(scope)),
        Logic::Any => predicates.iter().any(|p| p.evaluate(scope)),
    }
}

/// 求值单个比较，永不失败
///
/// 任一操作数是数字时，排序运算按数值比较；另一侧不是数字则视为格式错误，返回 false。
/// 相等与列表成员只做区分大小写的字符串比较，`"007"` 不等于 `"7"`。
pub fn evaluate(operator: Operator, left: &str, right: &str) -> bool {
    match operator {
        Operator::Eq => left == right,
        Operator::Neq => left != right,
        Operator::Gt | Operator::Lt | Operator::Gte | Operator::Lte => {
            compare(operator, left, right)
        }
        Operator::Contains => left.contains(right),
        Operator::StartsWith => left.starts_with(right),
        Operator::EndsWith => left.ends_with(right),
        Operator::In => list_items(right).iter().any(|item| item == left),
        Operator::NotIn => !list_items(right).iter().any(|item| item == left),
        Operator::IsEmpty => left.trim().is_empty(),
        Operator::IsNotEmpty => !left.trim().is_empty(),
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn compare(operator: Operator, left: &str, right: &str) -> bool {
    let ordering = match (parse_number(left), parse_number(right)) {
        (Some(l), Some(r)) => l.partial_cmp(&r),
        (None, None) => Some(left.cmp(right)),
        _ => {
            warn!(
                operator = ?operator,
                left = %left,
                right = %right,
                "malformed operand for numeric comparison"
            );
            None
        }
    };

    let Some(ordering) = ordering else {
        return false;
    };
    match operator {
        Operator::Gt => ordering.is_gt(),
        Operator::Lt => ordering.is_lt(),
        Operator::Gte => ordering.is_ge(),
        Operator::Lte => ordering.is_le(),
        _ => false,
    }
}

/// 右操作数列表：JSON 数组文本或逗号分隔
fn list_items(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
            return items.iter().map(crate::state::stringify).collect();
        }
    }
    trimmed
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}
