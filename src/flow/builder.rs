use crate::flow::conditions::Predicate;
use crate::flow::nodes::{
    handles, ConditionNode, DelayNode, HandoffNode, JumpNode, MessageNode, NodeKind, QuestionNode,
    TimeoutAction,
};
use crate::flow::types::{Flow, Node};
use crate::state::ExpectedInput;

/// Flow 构建器
pub struct FlowBuilder {
    id: String,
    name: Option<String>,
    start: Option<String>,
    nodes: Vec<Node>,
}

impl FlowBuilder {
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self {
            id: id.into(),
            name: None,
            start: None,
            nodes: Vec::new(),
        }
    }

    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    pub fn add_node(&mut self, id: &str, kind: NodeKind) -> &mut Self {
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.id == id) {
            existing.kind = kind;
        } else {
            self.nodes.push(Node::new(id, kind));
        }
        self
    }

    pub fn add_start_node(&mut self, id: &str) -> &mut Self {
        self.add_node(id, NodeKind::Start);
        if self.start.is_none() {
            self.start = Some(id.to_string());
        }
        self
    }

    pub fn add_message_node(&mut self, id: &str, text: &str) -> &mut Self {
        self.add_node(
            id,
            NodeKind::Message(MessageNode {
                text: Some(text.to_string()),
                media: None,
            }),
        )
    }

    pub fn add_question_node(
        &mut self,
        id: &str,
        prompt: &str,
        variable: &str,
        expected: ExpectedInput,
        timeout_seconds: Option<u64>,
    ) -> &mut Self {
        self.add_node(
            id,
            NodeKind::Question(QuestionNode {
                prompt: prompt.to_string(),
                variable: variable.to_string(),
                expected,
                options: Vec::new(),
                retries: 2,
                retry_message: None,
                timeout_seconds,
                on_timeout: TimeoutAction::Escalate,
                escalation: None,
            }),
        )
    }

    pub fn add_condition_node(&mut self, id: &str, predicates: Vec<Predicate>) -> &mut Self {
        self.add_node(
            id,
            NodeKind::Condition(ConditionNode {
                predicates,
                ..Default::default()
            }),
        )
    }

    pub fn add_delay_node(&mut self, id: &str, seconds: u64) -> &mut Self {
        self.add_node(id, NodeKind::Delay(DelayNode { seconds }))
    }

    pub fn add_handoff_node(&mut self, id: &str, queue: Option<&str>, message: Option<&str>) -> &mut Self {
        self.add_node(
            id,
            NodeKind::Handoff(HandoffNode {
                queue: queue.map(str::to_string),
                message: message.map(str::to_string),
                ..Default::default()
            }),
        )
    }

    pub fn add_jump_node(
        &mut self,
        id: &str,
        target_flow: Option<&str>,
        target_node: Option<&str>,
        clear_context: bool,
    ) -> &mut Self {
        self.add_node(
            id,
            NodeKind::Jump(JumpNode {
                target_flow: target_flow.map(str::to_string),
                target_node: target_node.map(str::to_string),
                clear_context,
            }),
        )
    }

    pub fn set_start(&mut self, id: &str) -> &mut Self {
        self.start = Some(id.to_string());
        self
    }

    pub fn connect(&mut self, from: &str, to: &str) -> &mut Self {
        self.connect_handle(from, handles::DEFAULT, to)
    }

    pub fn connect_handle(&mut self, from: &str, handle: &str, to: &str) -> &mut Self {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.id == from) {
            node.edges.insert(handle.to_string(), to.to_string());
        }
        self
    }

    /// 构建未校验的流程；校验在发布时进行
    pub fn build(&self) -> Flow {
        let start = self
            .start
            .clone()
            .or_else(|| self.nodes.first().map(|n| n.id.clone()))
            .unwrap_or_default();
        let mut flow = Flow::new(self.id.clone(), start, self.nodes.clone());
        flow.name = self.name.clone();
        flow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_wires_edges() {
        let mut builder = FlowBuilder::new("demo");
        builder
            .add_start_node("start")
            .add_message_node("hi", "Hi")
            .connect("start", "hi");
        let flow = builder.build();
        assert_eq!(flow.start, "start");
        assert_eq!(flow.node("start").unwrap().default_edge(), Some("hi"));
    }
}
