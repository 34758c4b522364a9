use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::conditions::{Logic, Predicate};
use crate::state::ExpectedInput;

/// 出边句柄
pub mod handles {
    pub const DEFAULT: &str = "default";
    pub const TRUE: &str = "true";
    pub const FALSE: &str = "false";
    pub const ERROR: &str = "error";
    pub const TIMEOUT: &str = "timeout";
    pub const INVALID: &str = "invalid";
}

/// 节点类型标签，用作执行器注册表的键
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKindTag {
    Start,
    Message,
    Question,
    Condition,
    Handoff,
    Delay,
    Jump,
    Action,
    ApiCall,
    SetVariable,
    Random,
    Datetime,
    Analytics,
    AiPrompt,
    DatabaseQuery,
    Script,
    WhatsappTemplate,
    InteractiveButtons,
    InteractiveList,
}

impl NodeKindTag {
    pub const ALL: [NodeKindTag; 19] = [
        NodeKindTag::Start,
        NodeKindTag::Message,
        NodeKindTag::Question,
        NodeKindTag::Condition,
        NodeKindTag::Handoff,
        NodeKindTag::Delay,
        NodeKindTag::Jump,
        NodeKindTag::Action,
        NodeKindTag::ApiCall,
        NodeKindTag::SetVariable,
        NodeKindTag::Random,
        NodeKindTag::Datetime,
        NodeKindTag::Analytics,
        NodeKindTag::AiPrompt,
        NodeKindTag::DatabaseQuery,
        NodeKindTag::Script,
        NodeKindTag::WhatsappTemplate,
        NodeKindTag::InteractiveButtons,
        NodeKindTag::InteractiveList,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKindTag::Start => "start",
            NodeKindTag::Message => "message",
            NodeKindTag::Question => "question",
            NodeKindTag::Condition => "condition",
            NodeKindTag::Handoff => "handoff",
            NodeKindTag::Delay => "delay",
            NodeKindTag::Jump => "jump",
            NodeKindTag::Action => "action",
            NodeKindTag::ApiCall => "api_call",
            NodeKindTag::SetVariable => "set_variable",
            NodeKindTag::Random => "random",
            NodeKindTag::Datetime => "datetime",
            NodeKindTag::Analytics => "analytics",
            NodeKindTag::AiPrompt => "ai_prompt",
            NodeKindTag::DatabaseQuery => "database_query",
            NodeKindTag::Script => "script",
            NodeKindTag::WhatsappTemplate => "whatsapp_template",
            NodeKindTag::InteractiveButtons => "interactive_buttons",
            NodeKindTag::InteractiveList => "interactive_list",
        }
    }
}

impl fmt::Display for NodeKindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 节点类型及其配置
#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Start,
    Message(MessageNode),
    Question(QuestionNode),
    Condition(ConditionNode),
    Handoff(HandoffNode),
    Delay(DelayNode),
    Jump(JumpNode),
    Action(ActionNode),
    ApiCall(ApiCallNode),
    SetVariable(SetVariableNode),
    Random(RandomNode),
    Datetime(DatetimeNode),
    Analytics(AnalyticsNode),
    AiPrompt(AiPromptNode),
    DatabaseQuery(DatabaseQueryNode),
    Script(ScriptNode),
    WhatsappTemplate(TemplateMessageNode),
    InteractiveButtons(ButtonsNode),
    InteractiveList(ListNode),
}

impl NodeKind {
    pub fn tag(&self) -> NodeKindTag {
        match self {
            NodeKind::Start => NodeKindTag::Start,
            NodeKind::Message(_) => NodeKindTag::Message,
            NodeKind::Question(_) => NodeKindTag::Question,
            NodeKind::Condition(_) => NodeKindTag::Condition,
            NodeKind::Handoff(_) => NodeKindTag::Handoff,
            NodeKind::Delay(_) => NodeKindTag::Delay,
            NodeKind::Jump(_) => NodeKindTag::Jump,
            NodeKind::Action(_) => NodeKindTag::Action,
            NodeKind::ApiCall(_) => NodeKindTag::ApiCall,
            NodeKind::SetVariable(_) => NodeKindTag::SetVariable,
            NodeKind::Random(_) => NodeKindTag::Random,
            NodeKind::Datetime(_) => NodeKindTag::Datetime,
            NodeKind::Analytics(_) => NodeKindTag::Analytics,
            NodeKind::AiPrompt(_) => NodeKindTag::AiPrompt,
            NodeKind::DatabaseQuery(_) => NodeKindTag::DatabaseQuery,
            NodeKind::Script(_) => NodeKindTag::Script,
            NodeKind::WhatsappTemplate(_) => NodeKindTag::WhatsappTemplate,
            NodeKind::InteractiveButtons(_) => NodeKindTag::InteractiveButtons,
            NodeKind::InteractiveList(_) => NodeKindTag::InteractiveList,
        }
    }

    /// 从类型标签和 JSON 配置构造
    pub fn from_config(tag: NodeKindTag, config: Value) -> serde_json::Result<Self> {
        fn parse<T: serde::de::DeserializeOwned>(config: Value) -> serde_json::Result<T> {
            let config = if config.is_null() {
                Value::Object(Default::default())
            } else {
                config
            };
            serde_json::from_value(config)
        }

        Ok(match tag {
            NodeKindTag::Start => NodeKind::Start,
            NodeKindTag::Message => NodeKind::Message(parse(config)?),
            NodeKindTag::Question => NodeKind::Question(parse(config)?),
            NodeKindTag::Condition => NodeKind::Condition(parse(config)?),
            NodeKindTag::Handoff => NodeKind::Handoff(parse(config)?),
            NodeKindTag::Delay => NodeKind::Delay(parse(config)?),
            NodeKindTag::Jump => NodeKind::Jump(parse(config)?),
            NodeKindTag::Action => NodeKind::Action(parse(config)?),
            NodeKindTag::ApiCall => NodeKind::ApiCall(parse(config)?),
            NodeKindTag::SetVariable => NodeKind::SetVariable(parse(config)?),
            NodeKindTag::Random => NodeKind::Random(parse(config)?),
            NodeKindTag::Datetime => NodeKind::Datetime(parse(config)?),
            NodeKindTag::Analytics => NodeKind::Analytics(parse(config)?),
            NodeKindTag::AiPrompt => NodeKind::AiPrompt(parse(config)?),
            NodeKindTag::DatabaseQuery => NodeKind::DatabaseQuery(parse(config)?),
            NodeKindTag::Script => NodeKind::Script(parse(config)?),
            NodeKindTag::WhatsappTemplate => NodeKind::WhatsappTemplate(parse(config)?),
            NodeKindTag::InteractiveButtons => NodeKind::InteractiveButtons(parse(config)?),
            NodeKindTag::InteractiveList => NodeKind::InteractiveList(parse(config)?),
        })
    }

    pub fn to_config(&self) -> serde_json::Result<Value> {
        match self {
            NodeKind::Start => Ok(Value::Null),
            NodeKind::Message(c) => serde_json::to_value(c),
            NodeKind::Question(c) => serde_json::to_value(c),
            NodeKind::Condition(c) => serde_json::to_value(c),
            NodeKind::Handoff(c) => serde_json::to_value(c),
            NodeKind::Delay(c) => serde_json::to_value(c),
            NodeKind::Jump(c) => serde_json::to_value(c),
            NodeKind::Action(c) => serde_json::to_value(c),
            NodeKind::ApiCall(c) => serde_json::to_value(c),
            NodeKind::SetVariable(c) => serde_json::to_value(c),
            NodeKind::Random(c) => serde_json::to_value(c),
            NodeKind::Datetime(c) => serde_json::to_value(c),
            NodeKind::Analytics(c) => serde_json::to_value(c),
            NodeKind::AiPrompt(c) => serde_json::to_value(c),
            NodeKind::DatabaseQuery(c) => serde_json::to_value(c),
            NodeKind::Script(c) => serde_json::to_value(c),
            NodeKind::WhatsappTemplate(c) => serde_json::to_value(c),
            NodeKind::InteractiveButtons(c) => serde_json::to_value(c),
            NodeKind::InteractiveList(c) => serde_json::to_value(c),
        }
    }
}

/// 文本或媒体消息
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageNode {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<MediaRef>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    #[serde(default)]
    pub media_type: MediaType,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    #[default]
    Image,
    Video,
    Audio,
    Document,
}

/// 问题节点
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuestionNode {
    pub prompt: String,
    pub variable: String,
    #[serde(default = "default_expected")]
    pub expected: ExpectedInput,
    #[serde(default)]
    pub options: Vec<ChoiceOption>,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub retry_message: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub on_timeout: TimeoutAction,
    #[serde(default)]
    pub escalation: Option<HandoffNode>,
}

fn default_expected() -> ExpectedInput {
    ExpectedInput::Text
}

fn default_retries() -> u32 {
    2
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub value: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// 问题超时后的处理
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    Escalate,
    Reprompt,
}

/// 条件节点：二元（true/false）或多分支
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionNode {
    #[serde(default)]
    pub predicates: Vec<Predicate>,
    #[serde(default)]
    pub logic: Logic,
    #[serde(default)]
    pub branches: Vec<ConditionBranch>,
}

impl ConditionNode {
    pub fn is_multi_branch(&self) -> bool {
        !self.branches.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionBranch {
    pub id: String,
    pub predicates: Vec<Predicate>,
    #[serde(default)]
    pub logic: Logic,
}

/// 转人工
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffNode {
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayNode {
    pub seconds: u64,
}

/// 跳转：同流程节点，或其他流程的入口
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpNode {
    #[serde(default)]
    pub target_flow: Option<String>,
    #[serde(default)]
    pub target_node: Option<String>,
    #[serde(default)]
    pub clear_context: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionNode {
    pub actions: Vec<ActionStep>,
    #[serde(default)]
    pub result_variable: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    pub action: ActionKind,
    /// 失败时是否中断整批
    #[serde(default)]
    pub blocking: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Webhook {
        url: String,
        #[serde(default = "default_post")]
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Value,
    },
    UpsertContact {
        attributes: serde_json::Map<String, Value>,
    },
    Enqueue {
        queue: String,
        #[serde(default)]
        payload: Value,
    },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Webhook { .. } => "webhook",
            ActionKind::UpsertContact { .. } => "upsert_contact",
            ActionKind::Enqueue { .. } => "enqueue",
        }
    }
}

fn default_post() -> String {
    "POST".to_string()
}

fn default_get() -> String {
    "GET".to_string()
}

/// 外部调用共享配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExternalCallConfig {
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub on_error: ErrorPolicy,
    pub output_variable: String,
}

/// 外部调用失败策略
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ErrorPolicy {
    ContinueWithFallback {
        #[serde(default)]
        value: Value,
    },
    Escalate,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy::ContinueWithFallback { value: Value::Null }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestSpec {
    #[serde(default = "default_get")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiCallNode {
    pub request: HttpRequestSpec,
    #[serde(flatten)]
    pub call: ExternalCallConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetVariableNode {
    pub assignments: Vec<Assignment>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub variable: String,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomNode {
    pub branches: Vec<WeightedBranch>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedBranch {
    pub id: String,
    pub weight: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatetimeNode {
    pub operation: DatetimeOp,
    pub output_variable: String,
}

/// 日期时间运算；`source` 为模板，缺省时取当前时间
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DatetimeOp {
    Now {
        #[serde(default)]
        format: Option<String>,
    },
    Add {
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        offset: DatetimeOffset,
        #[serde(default)]
        format: Option<String>,
    },
    Subtract {
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        offset: DatetimeOffset,
        #[serde(default)]
        format: Option<String>,
    },
    Format {
        #[serde(default)]
        source: Option<String>,
        format: String,
    },
    BusinessHours {
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        utc_offset_minutes: i32,
        #[serde(default = "default_business_days")]
        days: Vec<u32>,
        #[serde(default = "default_open")]
        start: String,
        #[serde(default = "default_close")]
        end: String,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatetimeOffset {
    #[serde(default)]
    pub days: i64,
    #[serde(default)]
    pub hours: i64,
    #[serde(default)]
    pub minutes: i64,
    #[serde(default)]
    pub seconds: i64,
}

fn default_business_days() -> Vec<u32> {
    vec![1, 2, 3, 4, 5]
}

fn default_open() -> String {
    "09:00".to_string()
}

fn default_close() -> String {
    "18:00".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsNode {
    pub event: String,
    #[serde(default)]
    pub properties: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AiPromptNode {
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(flatten)]
    pub call: ExternalCallConfig,
}

/// 数据库查询：查询文本与参数分开传递，参数不会拼接进查询
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatabaseQueryNode {
    pub query: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub connection: Option<String>,
    #[serde(flatten)]
    pub call: ExternalCallConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScriptNode {
    pub source: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub inputs: Value,
    #[serde(flatten)]
    pub call: ExternalCallConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMessageNode {
    pub name: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub parameters: Vec<String>,
}

fn default_language() -> String {
    "en".to_string()
}

/// 按钮上限
pub const MAX_BUTTONS: usize = 3;
/// 列表行上限
pub const MAX_LIST_ROWS: usize = 10;
/// 问题超时与延迟的上限（一年）
pub const MAX_WAIT_SECONDS: u64 = 365 * 24 * 60 * 60;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonsNode {
    pub body: String,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub footer: Option<String>,
    pub buttons: Vec<Choice>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub id: String,
    pub title: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListNode {
    pub body: String,
    pub button: String,
    pub sections: Vec<ListSection>,
}

impl ListNode {
    pub fn row_count(&self) -> usize {
        self.sections.iter().map(|s| s.rows.len()).sum()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSection {
    pub title: String,
    pub rows: Vec<ListRow>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}
