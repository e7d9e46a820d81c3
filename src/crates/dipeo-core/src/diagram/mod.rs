//! Diagram data model: declarative specs, typed nodes, edges, and the
//! compiled executable form.

pub mod edge;
pub mod executable;
pub mod node;
pub mod spec;

pub use edge::{ExecutableEdge, Packing, TransformRule, BRANCH_FALSE, BRANCH_TRUE, DEFAULT_HANDLE};
pub use executable::{ExecutableDiagram, NodeIndex};
pub use node::{
    ApiAuth, CodeLanguage, ConditionEvaluator, DbOperation, ExecutableNode, MemoryPolicy,
    NodeConfig, NodeId, NodeType, Person, ProviderInputs, TriggerMode,
};
pub use spec::{ArrowSpec, DiagramSpec, NodeSpec};
