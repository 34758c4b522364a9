use async_trait::async_trait;
use tracing::debug;

use crate::error::NodeError;
use crate::flow::conditions::evaluate_all;
use crate::flow::nodes::{handles, NodeKind};
use crate::flow::Node;
use crate::runtime::random::pick_weighted;
use crate::state::ExecutionContext;

use super::super::types::{ExecutorResult, Stimulus};
use super::{follow, mismatch, ExecutorEnv, NodeExecutor};

/// 条件分支：二元走 true/false，多分支取第一个命中的分支，都不命中走 default
pub struct ConditionExecutor;

#[async_trait]
impl NodeExecutor for ConditionExecutor {
    async fn execute(
        &self,
        node: &Node,
        ctx: &ExecutionContext,
        _stimulus: Stimulus<'_>,
        _env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError> {
        let NodeKind::Condition(config) = &node.kind else {
            return Err(mismatch(node));
        };

        let handle = if config.is_multi_branch() {
            config
                .branches
                .iter()
                .find(|branch| evaluate_all(&branch.predicates, branch.logic, &ctx.variables))
                .map(|branch| branch.id.as_str())
                .unwrap_or(handles::DEFAULT)
        } else if evaluate_all(&config.predicates, config.logic, &ctx.variables) {
            handles::TRUE
        } else {
            handles::FALSE
        };

        debug!(
            conversation_id = %ctx.conversation_id,
            node_id = %node.id,
            branch = handle,
            "condition evaluated"
        );
        Ok(follow(node, handle))
    }
}

/// 加权随机分支
pub struct RandomExecutor;

#[async_trait]
impl NodeExecutor for RandomExecutor {
    async fn execute(
        &self,
        node: &Node,
        _ctx: &ExecutionContext,
        _stimulus: Stimulus<'_>,
        env: &ExecutorEnv<'_>,
    ) -> Result<ExecutorResult, NodeError> {
        let NodeKind::Random(config) = &node.kind else {
            return Err(mismatch(node));
        };

        let branch = pick_weighted(&config.branches, env.random).ok_or_else(|| {
            NodeError::Configuration(format!("random node `{}` has no positive weight", node.id))
        })?;
        Ok(follow(node, &branch.id))
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{context, TestEnv};
    use super::*;
    use crate::flow::conditions::{Logic, Operator, Predicate};
    use crate::flow::nodes::{ConditionBranch, ConditionNode, RandomNode, WeightedBranch};
    use crate::flow::FlowBuilder;
    use serde_json::json;

    fn flow() -> crate::flow::Flow {
        FlowBuilder::new("flow")
            .add_start_node("start")
            .add_condition_node("adult", vec![Predicate::new("age", Operator::Gt, "18")])
            .add_node(
                "tier",
                NodeKind::Condition(ConditionNode {
                    branches: vec![
                        ConditionBranch {
                            id: "gold".into(),
                            predicates: vec![Predicate::new("points", Operator::Gte, "1000")],
                            logic: Logic::All,
                        },
                        ConditionBranch {
                            id: "silver".into(),
                            predicates: vec![Predicate::new("points", Operator::Gte, "100")],
                            logic: Logic::All,
                        },
                    ],
                    ..Default::default()
                }),
            )
            .add_node(
                "split",
                NodeKind::Random(RandomNode {
                    branches: vec![
                        WeightedBranch {
                            id: "a".into(),
                            weight: 0,
                        },
                        WeightedBranch {
                            id: "b".into(),
                            weight: 1,
                        },
                    ],
                }),
            )
            .add_message_node("yes", "adult")
            .add_message_node("no", "minor")
            .connect_handle("adult", handles::TRUE, "yes")
            .connect_handle("adult", handles::FALSE, "no")
            .connect_handle("tier", "gold", "yes")
            .connect_handle("tier", "silver", "no")
            .connect_handle("tier", handles::DEFAULT, "start")
            .connect_handle("split", "a", "yes")
            .connect_handle("split", "b", "no")
            .build()
    }

    #[tokio::test]
    async fn numeric_strings_compare_numerically() {
        let test = TestEnv::new(flow());
        let mut ctx = context();
        ctx.variables.set("age", json!("20"));
        let result = ConditionExecutor
            .execute(test.node("adult"), &ctx, Stimulus::Enter, &test.env())
            .await
            .unwrap();
        assert_eq!(result.next_node_id(), Some("yes"));

        ctx.variables.set("age", json!(9));
        let result = ConditionExecutor
            .execute(test.node("adult"), &ctx, Stimulus::Enter, &test.env())
            .await
            .unwrap();
        assert_eq!(result.next_node_id(), Some("no"));
    }

    #[tokio::test]
    async fn missing_variable_takes_false_branch() {
        let test = TestEnv::new(flow());
        let result = ConditionExecutor
            .execute(test.node("adult"), &context(), Stimulus::Enter, &test.env())
            .await
            .unwrap();
        assert_eq!(result.next_node_id(), Some("no"));
    }

    #[tokio::test]
    async fn multi_branch_picks_first_match_or_default() {
        let test = TestEnv::new(flow());
        let mut ctx = context();
        ctx.variables.set("points", json!(150));
        let result = ConditionExecutor
            .execute(test.node("tier"), &ctx, Stimulus::Enter, &test.env())
            .await
            .unwrap();
        assert_eq!(result.next_node_id(), Some("no"));

        ctx.variables.set("points", json!(5));
        let result = ConditionExecutor
            .execute(test.node("tier"), &ctx, Stimulus::Enter, &test.env())
            .await
            .unwrap();
        assert_eq!(result.next_node_id(), Some("start"));
    }

    #[tokio::test]
    async fn random_uses_injected_source() {
        let test = TestEnv::new(flow());
        for _ in 0..20 {
            let result = RandomExecutor
                .execute(test.node("split"), &context(), Stimulus::Enter, &test.env())
                .await
                .unwrap();
            assert_eq!(result.next_node_id(), Some("no"));
        }
    }
}
