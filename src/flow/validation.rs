use std::collections::HashSet;

use crate::error::{ChatFlowError, Result};
use crate::flow::nodes::{handles, NodeKind, MAX_BUTTONS, MAX_LIST_ROWS, MAX_WAIT_SECONDS};
use crate::flow::types::{Flow, Node};

/// 发布前校验流程图，收集全部问题后一次返回
pub fn validate_flow(flow: &Flow) -> Result<()> {
    let problems = collect_problems(flow);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ChatFlowError::Validation {
            flow: flow.id.clone(),
            problems,
        })
    }
}

pub fn collect_problems(flow: &Flow) -> Vec<String> {
    let mut problems = Vec::new();

    if flow.id.trim().is_empty() {
        problems.push("flow id must not be empty".to_string());
    }

    let mut seen = HashSet::new();
    for node in flow.nodes() {
        if node.id.trim().is_empty() {
            problems.push("node id must not be empty".to_string());
        }
        if !seen.insert(node.id.as_str()) {
            problems.push(format!("duplicate node id `{}`", node.id));
        }
    }

    if !flow.contains(&flow.start) {
        problems.push(format!("start node `{}` does not exist", flow.start));
    }

    for node in flow.nodes() {
        for (handle, target) in &node.edges {
            if !flow.contains(target) {
                problems.push(format!(
                    "node `{}` edge `{}` points to unknown node `{}`",
                    node.id, handle, target
                ));
            }
        }
        check_node(flow, node, &mut problems);
    }

    problems
}

fn require_edge(node: &Node, handle: &str, problems: &mut Vec<String>) {
    if node.edge(handle).is_none() {
        problems.push(format!(
            "{} node `{}` requires a `{}` edge",
            node.tag(),
            node.id,
            handle
        ));
    }
}

fn check_node(flow: &Flow, node: &Node, problems: &mut Vec<String>) {
    match &node.kind {
        NodeKind::Start => require_edge(node, handles::DEFAULT, problems),
        NodeKind::Delay(delay) => {
            require_edge(node, handles::DEFAULT, problems);
            if delay.seconds > MAX_WAIT_SECONDS {
                problems.push(format!(
                    "delay node `{}` waits longer than {} seconds",
                    node.id, MAX_WAIT_SECONDS
                ));
            }
        }
        NodeKind::Message(message) => {
            if message.text.is_none() && message.media.is_none() {
                problems.push(format!("message node `{}` has neither text nor media", node.id));
            }
        }
        NodeKind::Question(question) => {
            require_edge(node, handles::DEFAULT, problems);
            if question.variable.trim().is_empty() {
                problems.push(format!("question node `{}` has no target variable", node.id));
            }
            if question.expected == crate::state::ExpectedInput::Enum && question.options.is_empty()
            {
                problems.push(format!("question node `{}` expects enum but lists no options", node.id));
            }
            if question.timeout_seconds.is_some_and(|secs| secs > MAX_WAIT_SECONDS) {
                problems.push(format!(
                    "question node `{}` timeout exceeds {} seconds",
                    node.id, MAX_WAIT_SECONDS
                ));
            }
        }
        NodeKind::Condition(condition) => {
            if condition.is_multi_branch() {
                for branch in &condition.branches {
                    require_edge(node, &branch.id, problems);
                    if branch.predicates.is_empty() {
                        problems.push(format!(
                            "condition node `{}` branch `{}` has no predicates",
                            node.id, branch.id
                        ));
                    }
                }
                require_edge(node, handles::DEFAULT, problems);
            } else {
                require_edge(node, handles::TRUE, problems);
                require_edge(node, handles::FALSE, problems);
                if condition.predicates.is_empty() {
                    problems.push(format!("condition node `{}` has no predicates", node.id));
                }
            }
        }
        NodeKind::Jump(jump) => match (&jump.target_flow, &jump.target_node) {
            (None, None) => problems.push(format!("jump node `{}` has no target", node.id)),
            (None, Some(target)) => {
                if !flow.contains(target) {
                    problems.push(format!(
                        "jump node `{}` targets unknown node `{}`",
                        node.id, target
                    ));
                }
            }
            (Some(target_flow), Some(target)) if *target_flow == flow.id => {
                if !flow.contains(target) {
                    problems.push(format!(
                        "jump node `{}` targets unknown node `{}`",
                        node.id, target
                    ));
                }
            }
            // 跨流程目标在运行时解析
            _ => {}
        },
        NodeKind::Random(random) => {
            let total: u64 = random.branches.iter().map(|b| u64::from(b.weight)).sum();
            if total == 0 {
                problems.push(format!("random node `{}` has no positive weights", node.id));
            }
            for branch in &random.branches {
                require_edge(node, &branch.id, problems);
            }
        }
        NodeKind::SetVariable(set) => {
            if set.assignments.is_empty() {
                problems.push(format!("set_variable node `{}` has no assignments", node.id));
            }
        }
        NodeKind::Action(action) => {
            if action.actions.is_empty() {
                problems.push(format!("action node `{}` has no actions", node.id));
            }
        }
        NodeKind::InteractiveButtons(buttons) => {
            if buttons.buttons.is_empty() || buttons.buttons.len() > MAX_BUTTONS {
                problems.push(format!(
                    "interactive_buttons node `{}` must have 1..={} buttons",
                    node.id, MAX_BUTTONS
                ));
            }
        }
        NodeKind::InteractiveList(list) => {
            let rows = list.row_count();
            if rows == 0 || rows > MAX_LIST_ROWS {
                problems.push(format!(
                    "interactive_list node `{}` must have 1..={} rows",
                    node.id, MAX_LIST_ROWS
                ));
            }
        }
        NodeKind::Handoff(_)
        | NodeKind::ApiCall(_)
        | NodeKind::Datetime(_)
        | NodeKind::Analytics(_)
        | NodeKind::AiPrompt(_)
        | NodeKind::DatabaseQuery(_)
        | NodeKind::Script(_)
        | NodeKind::WhatsappTemplate(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::conditions::{Operator, Predicate};
    use crate::flow::nodes::{ConditionNode, DelayNode, MessageNode, RandomNode, WeightedBranch};

    fn message(text: &str) -> NodeKind {
        NodeKind::Message(MessageNode {
            text: Some(text.into()),
            media: None,
        })
    }

    #[test]
    fn valid_linear_flow_passes() {
        let flow = Flow::new(
            "f",
            "start",
            vec![
                Node::new("start", NodeKind::Start).with_edge("default", "hi"),
                Node::new("hi", message("Hi")),
            ],
        );
        assert!(validate_flow(&flow).is_ok());
    }

    #[test]
    fn collects_every_problem() {
        let flow = Flow::new(
            "f",
            "missing",
            vec![
                Node::new("start", NodeKind::Start),
                Node::new(
                    "check",
                    NodeKind::Condition(ConditionNode {
                        predicates: vec![Predicate::new("age", Operator::Gt, "18")],
                        ..Default::default()
                    }),
                )
                .with_edge("true", "ghost"),
                Node::new("wait", NodeKind::Delay(DelayNode { seconds: 5 })),
            ],
        );
        let problems = collect_problems(&flow);
        assert!(problems.iter().any(|p| p.contains("start node `missing`")));
        assert!(problems.iter().any(|p| p.contains("unknown node `ghost`")));
        assert!(problems.iter().any(|p| p.contains("requires a `false` edge")));
        assert!(problems.iter().any(|p| p.contains("`start` requires a `default` edge")));
        assert!(problems.iter().any(|p| p.contains("`wait` requires a `default` edge")));
    }

    #[test]
    fn random_requires_weights_and_edges() {
        let flow = Flow::new(
            "f",
            "pick",
            vec![Node::new(
                "pick",
                NodeKind::Random(RandomNode {
                    branches: vec![
                        WeightedBranch { id: "a".into(), weight: 0 },
                        WeightedBranch { id: "b".into(), weight: 0 },
                    ],
                }),
            )],
        );
        let problems = collect_problems(&flow);
        assert!(problems.iter().any(|p| p.contains("no positive weights")));
        assert!(problems.iter().any(|p| p.contains("requires a `a` edge")));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let flow = Flow::new(
            "f",
            "a",
            vec![Node::new("a", message("x")), Node::new("a", message("y"))],
        );
        let err = validate_flow(&flow).unwrap_err();
        assert!(err.to_string().contains("duplicate node id `a`"));
    }

    #[test]
    fn unbounded_waits_rejected() {
        let flow = crate::flow::FlowBuilder::new("f")
            .add_start_node("start")
            .add_question_node(
                "ask",
                "Name?",
                "name",
                crate::state::ExpectedInput::Text,
                Some(u64::MAX),
            )
            .add_delay_node("pause", MAX_WAIT_SECONDS + 1)
            .add_message_node("done", "ok")
            .connect("start", "ask")
            .connect("ask", "pause")
            .connect("pause", "done")
            .build();
        let problems = collect_problems(&flow);
        assert!(problems.iter().any(|p| p.contains("question node `ask` timeout exceeds")));
        assert!(problems.iter().any(|p| p.contains("delay node `pause` waits longer")));
        assert_eq!(problems.len(), 2, "problems: {problems:?}");
    }
}
