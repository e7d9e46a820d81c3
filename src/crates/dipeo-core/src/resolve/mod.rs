//! Input-resolution pipeline
//!
//! Runs once per node per scheduling, turning upstream envelopes into the
//! `inputs` map a handler consumes. The pipeline is a fixed sequence of
//! focused stages sharing a [`PipelineCtx`]:
//!
//! 1. **IncomingEdges**: collect edges targeting the node and fetch each
//!    source's last output envelope; edges without an output carry nothing.
//! 2. **Filter**: node-type strategy filtering (`person_job` first-only
//!    edges), then iteration and branch filters on envelope metadata.
//! 3. **Providers**: explicit, opt-in provider inputs (`_conversation`,
//!    `_variables`). No implicit injection.
//! 4. **Transform**: extract the addressed output, apply edge transform
//!    rules, then pack or spread into the accumulator.
//! 5. **Defaults**: fill missing required inputs from declared defaults or
//!    type-based zero values; whatever is still missing becomes a warning
//!    for the handler to act on.

mod defaults;
mod error;
mod filter;
mod incoming;
mod providers;
mod transform;

pub use error::{ResolutionError, ResolutionErrorKind};

use serde_json::Value;
use std::collections::BTreeMap;

use crate::diagram::{ExecutableDiagram, ExecutableEdge, ExecutableNode};
use crate::envelope::Envelope;
use crate::services::ServiceRegistry;
use crate::state::ExecutionContext;

/// An incoming edge paired with its source's output envelope.
pub(crate) struct EdgeValue<'a> {
    pub edge: &'a ExecutableEdge,
    pub envelope: Envelope,
}

/// Shared state threaded through the pipeline stages.
pub(crate) struct PipelineCtx<'a> {
    pub node: &'a ExecutableNode,
    pub context: &'a ExecutionContext,
    pub diagram: &'a ExecutableDiagram,
    pub services: &'a ServiceRegistry,
    pub edge_values: Vec<EdgeValue<'a>>,
    pub inputs: BTreeMap<String, Value>,
    pub envelopes: BTreeMap<String, Envelope>,
    pub warnings: Vec<String>,
}

/// The resolved inputs handed to a handler.
#[derive(Debug, Default)]
pub struct ResolvedInputs {
    /// Input values keyed by target input name.
    pub inputs: BTreeMap<String, Value>,
    /// Source envelopes for handlers that need attribution, keyed like
    /// `inputs` (provider inputs included).
    pub envelopes: BTreeMap<String, Envelope>,
    /// Non-fatal findings (e.g. missing required inputs without defaults).
    pub warnings: Vec<String>,
}

impl ResolvedInputs {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key)
    }

    /// The `default` input, present on most single-input nodes.
    pub fn default_input(&self) -> Option<&Value> {
        self.inputs.get(crate::diagram::DEFAULT_HANDLE)
    }

    /// Flatten inputs into a JSON object, e.g. for template scopes.
    pub fn to_object(&self) -> Value {
        Value::Object(self.inputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    /// Fail if a required input is absent, mapping the pipeline warning into
    /// a hard error for handlers that demand the value.
    pub fn require(&self, key: &str, node_id: &str) -> Result<&Value, ResolutionError> {
        self.inputs
            .get(key)
            .ok_or_else(|| ResolutionError::dependency_not_ready(key, node_id))
    }
}

/// Resolve inputs for one scheduling of `node`.
pub async fn resolve_inputs(
    node: &ExecutableNode,
    context: &ExecutionContext,
    diagram: &ExecutableDiagram,
    services: &ServiceRegistry,
) -> Result<ResolvedInputs, ResolutionError> {
    let mut ctx = PipelineCtx {
        node,
        context,
        diagram,
        services,
        edge_values: Vec::new(),
        inputs: BTreeMap::new(),
        envelopes: BTreeMap::new(),
        warnings: Vec::new(),
    };

    incoming::collect(&mut ctx);
    filter::apply(&mut ctx);
    providers::apply(&mut ctx).await?;
    transform::apply(&mut ctx)?;
    defaults::apply(&mut ctx);

    for warning in &ctx.warnings {
        tracing::warn!(node_id = %node.id, "input resolution: {warning}");
    }

    Ok(ResolvedInputs {
        inputs: ctx.inputs,
        envelopes: ctx.envelopes,
        warnings: ctx.warnings,
    })
}
