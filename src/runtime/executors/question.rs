use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Number, Value};
use tracing::{debug, info};

use crate::error::NodeError;
use crate::flow::nodes::{handles, NodeKind, QuestionNode, TimeoutAction};
use crate::flow::Node;
use crate::state::{template, AwaitingInput, ExecutionContext, ExpectedInput};

use super::super::types::{
    ExecutorResult, InboundPayload, OutboundMessage, SideEffect, StateUpdate, Stimulus,
};
use super::{escalation_result, follow, mismatch, ExecutorEnv, NodeExecutor};

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"));
static PHONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+?\d{7,15}$").expect("valid phone regex"));

/// 校验回答并转换为要写入变量的值
pub fn validate_answer(config: &QuestionNode, payload: &InboundPayload) -> Result<Value, NodeError> {
    let text = || {
        payload
            .text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| NodeError::InvalidInput(format!("expected {:?} answer", config.expected)))
    };

    match config.expected {
        ExpectedInput::Enum => match_option(config, payload),
        ExpectedInput::Text => Ok(Value::String(text()?.to_string())),
        ExpectedInput::Number => parse_number(text()?),
        ExpectedInput::Email => {
            let text = text()?;
            if EMAIL.is_match(text) {
                Ok(Value::String(text.to_lowercase()))
            } else {
                Err(NodeError::InvalidInput(format!("`{text}` is not an email")))
            }
        }
        ExpectedInput::Phone => {
            let text = text()?;
            let normalized: String = text
                .chars()
                .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
                .collect();
            if PHONE.is_match(&normalized) {
                Ok(Value::String(normalized))
            } else {
                Err(NodeError::InvalidInput(format!("`{text}` is not a phone number")))
            }
        }
        ExpectedInput::Date => {
            let text = text()?;
            parse_date(text)
                .map(|date| Value::String(date.format("%Y-%m-%d").to_string()))
                .ok_or_else(|| NodeError::InvalidInput(format!("`{text}` is not a date")))
        }
    }
}

fn parse_number(text: &str) -> Result<Value, NodeError> {
    let invalid = || NodeError::InvalidInput(format!("`{text}` is not a number"));
    if let Ok(int) = text.parse::<i64>() {
        return Ok(Value::Number(int.into()));
    }
    let float: f64 = text.replace(',', ".").parse().map_err(|_| invalid())?;
    Number::from_f64(float).map(Value::Number).ok_or_else(invalid)
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(text, "%d/%m/%Y"))
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.date_naive()))
}

/// 交互回复先按 id 再按标题匹配；文本按值或标签忽略大小写匹配
fn match_option(config: &QuestionNode, payload: &InboundPayload) -> Result<Value, NodeError> {
    let matches = |candidate: &str| {
        config.options.iter().find(|option| {
            option.value.eq_ignore_ascii_case(candidate)
                || option
                    .label
                    .as_deref()
                    .is_some_and(|label| label.eq_ignore_ascii_case(candidate))
        })
    };

    let found = match payload {
        InboundPayload::Interactive { id, title } => config
            .options
            .iter()
            .find(|option| option.value == *id)
            .or_else(|| matches(title.trim())),
        other => other.text().and_then(|text| matches(text.trim())),
    };

    found
        .map(|option| Value::String(option.value.clone()))
        .ok_or_else(|| NodeError::InvalidInput("answer does not match any option".to_string()))
}

/// 问题节点：提问后挂起，收到回答或超时后恢复
pub struct QuestionExecutor;

impl QuestionExecutor {
    fn prompt(ctx: &ExecutionContext, config: &QuestionNode, text: &str) -> SideEffect {
        let text = template::resolve(text, &ctx.variables);
        let mut message = OutboundMessage::text(&ctx.conversation_id, text);
        if !config.options.is_empty() {
            let options: Vec<Value> = config
                .options
                .iter()
                .map(|o| json!({ "value": o.value, "label": o.label.as_deref().unwrap_or(&o.value) }))
                .collect();
            message.content["options"] = Value::Array(options);
        }
        SideEffect::Send(message)
    }

    fn await_input(
        node: &Node,
        config: &QuestionNode,
        env: &ExecutorEnv<'_>,
        attempts: u32,
    ) -> StateUpdate {
        StateUpdate::AwaitInput(AwaitingInput {
            node_id: node.id.clone(),
            since: env.now,
            expected: config.expected.clone(),
            deadline: env.after(env.config.question_timeout(config.timeout_seconds)),
            attempts,
        })
    }

    fn attempts(ctx: &ExecutionContext, node: &Node) -> u32 {
        ctx.awaiting_input
            .as_ref()
            .filter(|a| a.node_id == node.id)
            .map(|a| a.attempts)
            .unwrap_or(0)
    }
}

#[async_trait]
impl NodeExecutor for QuestionExecutor {
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        stimulus: Stimulus<'_>,
        env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError> {
        let NodeKind::Question(config) = &node.kind else {
            return Err(mismatch(node));
        };

        match stimulus {
            Stimulus::Enter | Stimulus::Resume => Ok(ExecutorResult::suspend()
                .with_effect(Self::prompt(ctx, config, &config.prompt))
                .with_update(Self::await_input(node, config, env, 0))),
            Stimulus::Input(event) => {
                let attempts = Self::attempts(ctx, node);
                match validate_answer(config, &event.payload) {
                    Ok(value) => {
                        debug!(
                            conversation_id = %ctx.conversation_id,
                            node_id = %node.id,
                            variable = %config.variable,
                            "answer accepted"
                        );
                        Ok(follow(node, handles::DEFAULT)
                            .with_update(StateUpdate::SetVariable {
                                path: config.variable.clone(),
                                value,
                            })
                            .with_update(StateUpdate::ClearAwait))
                    }
                    Err(err) if attempts < config.retries => {
                        debug!(
                            conversation_id = %ctx.conversation_id,
                            node_id = %node.id,
                            attempt = attempts + 1,
                            error = %err,
                            "answer rejected, re-prompting"
                        );
                        let text = config.retry_message.as_deref().unwrap_or(&config.prompt);
                        Ok(ExecutorResult::suspend()
                            .with_effect(Self::prompt(ctx, config, text))
                            .with_update(Self::await_input(node, config, env, attempts + 1)))
                    }
                    Err(err) => {
                        info!(
                            conversation_id = %ctx.conversation_id,
                            node_id = %node.id,
                            "retries exhausted"
                        );
                        let reason = format!("retries exhausted: {err}");
                        let result = match node.edge(handles::INVALID) {
                            Some(target) => ExecutorResult::next(target),
                            None => escalation_result(
                                node,
                                ctx,
                                env,
                                config.escalation.as_ref(),
                                "invalid answer",
                            ),
                        };
                        Ok(result.with_update(StateUpdate::ClearAwait).failed(reason))
                    }
                }
            }
            Stimulus::Timeout => {
                let attempts = Self::attempts(ctx, node);
                if config.on_timeout == TimeoutAction::Reprompt && attempts < config.retries {
                    return Ok(ExecutorResult::suspend()
                        .with_effect(Self::prompt(ctx, config, &config.prompt))
                        .with_update(Self::await_input(node, config, env, attempts + 1)));
                }

                info!(
                    conversation_id = %ctx.conversation_id,
                    node_id = %node.id,
                    "question timed out"
                );
                let result = match node.edge(handles::TIMEOUT) {
                    Some(target) => ExecutorResult::next(target),
                    None => escalation_result(
                        node,
                        ctx,
                        env,
                        config.escalation.as_ref(),
                        "question timed out",
                    ),
                };
                Ok(result
                    .with_update(StateUpdate::ClearAwait)
                    .failed("question timed out"))
            }
        }
    }
}
