//! DiPeO core: the diagram execution engine.
//!
//! DiPeO executes user-authored diagrams whose nodes represent actions (LLM
//! calls, HTTP requests, code snippets, conditionals, file I/O) connected by
//! typed arrows carrying data. This crate is the execution core:
//!
//! - [`compile`] turns a declarative [`DiagramSpec`] into an immutable
//!   [`ExecutableDiagram`], collecting diagnostics instead of bailing on the
//!   first problem.
//! - [`Envelope`] is the typed, immutable message that travels along edges.
//! - [`resolve`] is the per-node input-resolution pipeline (collect, filter,
//!   providers, transform, defaults).
//! - [`ExecutionContext`] is the per-execution state store: node statuses,
//!   outputs, branch decisions, loop state, and variables.
//! - [`ExecutionEngine`] owns the dynamic scheduler loop: ready-set
//!   computation, bounded-parallel handler dispatch, condition/loop control
//!   flow, cancellation, and timeouts.
//! - [`HandlerRegistry`] maps node type tags to handlers; the built-in set
//!   covers every node type in the closed union.
//! - [`EventBus`] streams per-execution lifecycle events to any number of
//!   concurrent subscribers.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dipeo_core::{compile, DiagramSpec, ExecutionEngine, ExecutionOptions, ServiceRegistry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let spec = DiagramSpec::from_yaml(r#"
//! nodes:
//!   - id: start
//!     type: start
//!     properties: { custom_data: { greeting: "hi" } }
//!   - id: end
//!     type: end
//! arrows:
//!   - source: start
//!     target: end
//! "#)?;
//!
//! let diagram = Arc::new(compile(&spec).into_diagram().map_err(|e| e.to_string())?);
//! let engine = ExecutionEngine::with_builtins();
//! let services = ServiceRegistry::local("./workspace");
//!
//! let mut handle = engine.execute(diagram, ExecutionOptions::default(), services);
//! let mut events = handle.take_events().unwrap();
//! while let Some(event) = events.next().await {
//!     println!("{:?} {:?}", event.event_type, event.node_id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod compile;
pub mod diagram;
pub mod engine;
pub mod envelope;
pub mod events;
pub mod expr;
pub mod handlers;
pub mod resolve;
pub mod services;
pub mod state;

pub use compile::{compile, decompile, CompileResult, Diagnostic, Severity};
pub use diagram::{
    ConditionEvaluator, DiagramSpec, ExecutableDiagram, ExecutableEdge, ExecutableNode,
    MemoryPolicy, NodeConfig, NodeId, NodeType, Packing, Person, TransformRule,
};
pub use engine::{ControlSignal, EngineError, ExecutionEngine, ExecutionHandle, ExecutionOptions};
pub use envelope::{ContentType, ConversationState, Envelope, EnvelopeBody, EnvelopeError};
pub use events::{EventBus, EventStream, EventType, ExecutionEvent};
pub use handlers::{HandlerCtx, HandlerError, HandlerRegistry, NodeHandler};
pub use resolve::{resolve_inputs, ResolutionError, ResolutionErrorKind, ResolvedInputs};
pub use services::{ServiceError, ServiceRegistry};
pub use state::{
    ExecutionContext, ExecutionState, ExecutionStatus, NodeState, StateError, Status, TokenUsage,
};
