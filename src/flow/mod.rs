// Flow 模块 - 流程定义、校验与注册

pub mod builder;
pub mod conditions;
pub mod loader;
pub mod nodes;
pub mod registry;
pub mod types;
pub mod validation;

// 重新导出核心类型
pub use builder::FlowBuilder;
pub use conditions::{evaluate, evaluate_all, Logic, Operator, Predicate};
pub use loader::{load_flow_from_str, load_flows_from_file, load_flows_from_value};
pub use nodes::{handles, NodeKind, NodeKindTag};
pub use registry::FlowRegistry;
pub use types::{Flow, Node};
pub use validation::validate_flow;
