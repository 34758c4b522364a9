use async_trait::async_trait;
use chrono::format::{Item, StrftimeItems};
use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc,
};
use serde_json::Value;

use crate::error::NodeError;
use crate::flow::nodes::{handles, DatetimeOffset, DatetimeOp, NodeKind};
use crate::flow::Node;
use crate::state::{template, ExecutionContext, Variables};

use super::super::types::{ExecutorResult, StateUpdate, Stimulus};
use super::{follow, mismatch, ExecutorEnv, NodeExecutor};

/// 日期时间运算，结果写入输出变量
pub struct DatetimeExecutor;

fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// 缺省或空的来源取当前时间
fn source_instant(
    source: Option<&str>,
    vars: &Variables,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, NodeError> {
    let Some(source) = source else {
        return Ok(now);
    };
    let text = template::resolve(source, vars);
    let text = text.trim();
    if text.is_empty() {
        return Ok(now);
    }
    parse_instant(text).ok_or_else(|| NodeError::InvalidInput(format!("`{text}` is not a datetime")))
}

fn render(instant: DateTime<Utc>, format: Option<&str>) -> Result<Value, NodeError> {
    let Some(format) = format else {
        return Ok(Value::String(instant.to_rfc3339()));
    };
    let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(NodeError::Configuration(format!("invalid datetime format `{format}`")));
    }
    Ok(Value::String(
        instant.format_with_items(items.into_iter()).to_string(),
    ))
}

fn offset(delta: &DatetimeOffset) -> Result<TimeDelta, NodeError> {
    [
        TimeDelta::try_days(delta.days),
        TimeDelta::try_hours(delta.hours),
        TimeDelta::try_minutes(delta.minutes),
        TimeDelta::try_seconds(delta.seconds),
    ]
    .into_iter()
    .try_fold(TimeDelta::zero(), |total, part| total.checked_add(&part?))
    .ok_or_else(|| NodeError::InvalidInput("datetime offset out of range".into()))
}

fn parse_clock(text: &str) -> Result<NaiveTime, NodeError> {
    NaiveTime::parse_from_str(text, "%H:%M")
        .map_err(|_| NodeError::Configuration(format!("invalid clock time `{text}`")))
}

/// 以 `utc_offset_minutes` 换算到本地时间后判断是否在营业时间内
pub fn within_business_hours(
    instant: DateTime<Utc>,
    utc_offset_minutes: i32,
    days: &[u32],
    start: NaiveTime,
    end: NaiveTime,
) -> Option<bool> {
    let zone = FixedOffset::east_opt(utc_offset_minutes.checked_mul(60)?)?;
    let local = instant.with_timezone(&zone);
    let weekday = local.weekday().number_from_monday();
    let time = local.time();
    Some(days.contains(&weekday) && time >= start && time < end)
}

impl DatetimeExecutor {
    fn compute(op: &DatetimeOp, vars: &Variables, now: DateTime<Utc>) -> Result<Value, NodeError> {
        match op {
            DatetimeOp::Now { format } => render(now, format.as_deref()),
            DatetimeOp::Add {
                source,
                offset: delta,
                format,
            } => {
                let instant = source_instant(source.as_deref(), vars, now)?;
                let shifted = instant
                    .checked_add_signed(offset(delta)?)
                    .ok_or_else(|| NodeError::InvalidInput("datetime out of range".into()))?;
                render(shifted, format.as_deref())
            }
            DatetimeOp::Subtract {
                source,
                offset: delta,
                format,
            } => {
                let instant = source_instant(source.as_deref(), vars, now)?;
                let shifted = instant
                    .checked_sub_signed(offset(delta)?)
                    .ok_or_else(|| NodeError::InvalidInput("datetime out of range".into()))?;
                render(shifted, format.as_deref())
            }
            DatetimeOp::Format { source, format } => {
                let instant = source_instant(source.as_deref(), vars, now)?;
                render(instant, Some(format))
            }
            DatetimeOp::BusinessHours {
                source,
                utc_offset_minutes,
                days,
                start,
                end,
            } => {
                let instant = source_instant(source.as_deref(), vars, now)?;
                let open = within_business_hours(
                    instant,
                    *utc_offset_minutes,
                    days,
                    parse_clock(start)?,
                    parse_clock(end)?,
                )
                .ok_or_else(|| {
                    NodeError::Configuration(format!("invalid utc offset {utc_offset_minutes}"))
                })?;
                Ok(Value::Bool(open))
            }
        }
    }
}

#[async_trait]
impl NodeExecutor for DatetimeExecutor {
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _stimulus: Stimulus<'_>,
        env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError> {
        let NodeKind::Datetime(config) = &node.kind else {
            return Err(mismatch(node));
        };

        let value = Self::compute(&config.operation, &ctx.variables, env.now)?;
        Ok(follow(node, handles::DEFAULT).with_update(StateUpdate::SetVariable {
            path: config.output_variable.clone(),
            value,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        // 2024-03-08 是周五
        Utc.with_ymd_and_hms(2024, 3, 8, 20, 30, 0).unwrap()
    }

    #[test]
    fn adds_offset_to_variable_source() {
        let mut vars = Variables::new();
        vars.set("due", json!("2024-01-31"));
        let op = DatetimeOp::Add {
            source: Some("{{due}}".into()),
            offset: DatetimeOffset {
                days: 1,
                hours: 2,
                ..Default::default()
            },
            format: Some("%Y-%m-%d %H:%M".into()),
        };
        assert_eq!(
            DatetimeExecutor::compute(&op, &vars, now()).unwrap(),
            json!("2024-02-01 02:00")
        );
    }

    #[test]
    fn subtract_defaults_to_now() {
        let op = DatetimeOp::Subtract {
            source: None,
            offset: DatetimeOffset {
                minutes: 30,
                ..Default::default()
            },
            format: Some("%H:%M".into()),
        };
        assert_eq!(
            DatetimeExecutor::compute(&op, &Variables::new(), now()).unwrap(),
            json!("20:00")
        );
    }

    #[test]
    fn invalid_format_is_a_configuration_error() {
        let op = DatetimeOp::Format {
            source: None,
            format: "%Q".into(),
        };
        let err = DatetimeExecutor::compute(&op, &Variables::new(), now()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn business_hours_respect_local_offset() {
        let open = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let close = NaiveTime::from_hms_opt(18, 0, 0).unwrap();
        let weekdays = [1, 2, 3, 4, 5];
        // 20:30 UTC，UTC-3 为 17:30，仍在营业
        assert_eq!(
            within_business_hours(now(), -180, &weekdays, open, close),
            Some(true)
        );
        assert_eq!(within_business_hours(now(), 0, &weekdays, open, close), Some(false));
        // UTC+9 已是周六
        assert_eq!(
            within_business_hours(now(), 540, &weekdays, open, close),
            Some(false)
        );
    }

    #[test]
    fn oversized_offset_is_invalid_input() {
        let op = DatetimeOp::Add {
            source: None,
            offset: DatetimeOffset {
                days: 9_000_000_000_000_000,
                ..Default::default()
            },
            format: None,
        };
        assert!(matches!(
            DatetimeExecutor::compute(&op, &Variables::new(), now()),
            Err(NodeError::InvalidInput(_))
        ));

        let op = DatetimeOp::Subtract {
            source: None,
            offset: DatetimeOffset {
                days: 100_000_000,
                ..Default::default()
            },
            format: None,
        };
        assert!(matches!(
            DatetimeExecutor::compute(&op, &Variables::new(), now()),
            Err(NodeError::InvalidInput(_))
        ));
    }

    #[test]
    fn unparseable_source_fails() {
        let mut vars = Variables::new();
        vars.set("when", json!("soon"));
        let op = DatetimeOp::Format {
            source: Some("{{when}}".into()),
            format: "%Y".into(),
        };
        assert!(matches!(
            DatetimeExecutor::compute(&op, &vars, now()),
            Err(NodeError::InvalidInput(_))
        ));
    }
}
