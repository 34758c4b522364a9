use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::NodeError;
use crate::flow::nodes::{handles, NodeKind, MAX_BUTTONS, MAX_LIST_ROWS};
use crate::flow::Node;
use crate::state::{template, ExecutionContext};

use super::super::types::{ExecutorResult, OutboundKind, OutboundMessage, SideEffect, Stimulus};
use super::{follow, mismatch, ExecutorEnv, NodeExecutor};

fn send(ctx: &ExecutionContext, node: &Node, kind: OutboundKind, content: Value) -> ExecutorResult {
    follow(node, handles::DEFAULT).with_effect(SideEffect::Send(OutboundMessage {
        conversation_id: ctx.conversation_id.clone(),
        kind,
        content,
    }))
}

/// 审核过的消息模板，渠道需支持模板
pub struct TemplateExecutor;

#[async_trait]
impl NodeExecutor for TemplateExecutor {
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _stimulus: Stimulus<'_>,
        _env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError> {
        let NodeKind::WhatsappTemplate(config) = &node.kind else {
            return Err(mismatch(node));
        };
        if !ctx.channel.templates {
            return Err(NodeError::UnsupportedCapability("templates".into()));
        }

        let parameters: Vec<String> = config
            .parameters
            .iter()
            .map(|p| template::resolve(p, &ctx.variables))
            .collect();
        Ok(send(
            ctx,
            node,
            OutboundKind::Template,
            json!({
                "name": config.name,
                "language": config.language,
                "parameters": parameters,
            }),
        ))
    }
}

pub struct ButtonsExecutor;

#[async_trait]
impl NodeExecutor for ButtonsExecutor {
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _stimulus: Stimulus<'_>,
        _env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError> {
        let NodeKind::InteractiveButtons(config) = &node.kind else {
            return Err(mismatch(node));
        };
        if !ctx.channel.interactive {
            return Err(NodeError::UnsupportedCapability("interactive messages".into()));
        }
        if config.buttons.is_empty() || config.buttons.len() > MAX_BUTTONS {
            return Err(NodeError::Configuration(format!(
                "buttons node `{}` needs 1..={MAX_BUTTONS} buttons",
                node.id
            )));
        }

        let vars = &ctx.variables;
        let buttons: Vec<Value> = config
            .buttons
            .iter()
            .map(|b| json!({ "id": b.id, "title": template::resolve(&b.title, vars) }))
            .collect();
        Ok(send(
            ctx,
            node,
            OutboundKind::Buttons,
            json!({
                "body": template::resolve(&config.body, vars),
                "header": config.header.as_deref().map(|h| template::resolve(h, vars)),
                "footer": config.footer.as_deref().map(|f| template::resolve(f, vars)),
                "buttons": buttons,
            }),
        ))
    }
}

pub struct ListExecutor;

#[async_trait]
impl NodeExecutor for ListExecutor {
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _stimulus: Stimulus<'_>,
        _env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError> {
        let NodeKind::InteractiveList(config) = &node.kind else {
            return Err(mismatch(node));
        };
        if !ctx.channel.interactive {
            return Err(NodeError::UnsupportedCapability("interactive messages".into()));
        }
        let rows = config.row_count();
        if rows == 0 || rows > MAX_LIST_ROWS {
            return Err(NodeError::Configuration(format!(
                "list node `{}` needs 1..={MAX_LIST_ROWS} rows, has {rows}",
                node.id
            )));
        }

        let vars = &ctx.variables;
        let sections: Vec<Value> = config
            .sections
            .iter()
            .map(|section| {
                let rows: Vec<Value> = section
                    .rows
                    .iter()
                    .map(|row| {
                        json!({
                            "id": row.id,
                            "title": template::resolve(&row.title, vars),
                            "description": row.description.as_deref().map(|d| template::resolve(d, vars)),
                        })
                    })
                    .collect();
                json!({ "title": template::resolve(&section.title, vars), "rows": rows })
            })
            .collect();
        Ok(send(
            ctx,
            node,
            OutboundKind::List,
            json!({
                "body": template::resolve(&config.body, vars),
                "button": config.button,
                "sections": sections,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, TestEnv};
    use super::*;
    use crate::flow::nodes::{ButtonsNode, Choice, TemplateMessageNode};
    use crate::flow::FlowBuilder;
    use crate::state::ChannelCapability;

    fn flow() -> crate::flow::Flow {
        FlowBuilder::new("flow")
            .add_node(
                "menu",
                NodeKind::InteractiveButtons(ButtonsNode {
                    body: "Hi {{name}}, pick one".into(),
                    header: None,
                    footer: None,
                    buttons: vec![
                        Choice {
                            id: "sales".into(),
                            title: "Sales".into(),
                        },
                        Choice {
                            id: "support".into(),
                            title: "Support".into(),
                        },
                    ],
                }),
            )
            .add_node(
                "promo",
                NodeKind::WhatsappTemplate(TemplateMessageNode {
                    name: "promo_march".into(),
                    language: "pt_BR".into(),
                    parameters: vec!["{{name}}".into()],
                }),
            )
            .set_start("menu")
            .build()
    }

    #[tokio::test]
    async fn text_only_channel_rejects_interactive_nodes() {
        let test = TestEnv::new(flow());
        let mut ctx = context();
        ctx.channel = ChannelCapability::text_only();

        let err = ButtonsExecutor
            .execute(test.node("menu"), &ctx, Stimulus::Enter, &test.env())
            .await
            .unwrap_err();
        assert!(err.is_configuration());

        let err = TemplateExecutor
            .execute(test.node("promo"), &ctx, Stimulus::Enter, &test.env())
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::UnsupportedCapability(_)));
    }

    #[tokio::test]
    async fn capable_channel_renders_buttons() {
        let test = TestEnv::new(flow());
        let mut ctx = context();
        ctx.channel = ChannelCapability::full();
        ctx.variables.set("name", json!("Ana"));

        let result = ButtonsExecutor
            .execute(test.node("menu"), &ctx, Stimulus::Enter, &test.env())
            .await
            .unwrap();
        assert!(result.next_node_id().is_none());
        match &result.effects[0] {
            SideEffect::Send(message) => {
                assert_eq!(message.kind, OutboundKind::Buttons);
                assert_eq!(message.content["body"], "Hi Ana, pick one");
                assert_eq!(message.content["buttons"][1]["id"], "support");
            }
            other => panic!("unexpected effect {other:?}"),
        }
    }
}
