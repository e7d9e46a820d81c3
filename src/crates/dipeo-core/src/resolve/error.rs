//! Error types for runtime input resolution.

use thiserror::Error;

/// Failure while resolving a node's inputs, enriched with the node and edge
/// it occurred on.
#[derive(Debug)]
pub struct ResolutionError {
    pub kind: ResolutionErrorKind,
    pub node_id: String,
    pub edge_id: Option<String>,
}

impl std::fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (node '{}'", self.kind, self.node_id)?;
        if let Some(edge_id) = &self.edge_id {
            write!(f, ", edge '{edge_id}'")?;
        }
        f.write_str(")")
    }
}

impl std::error::Error for ResolutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

#[derive(Debug, Error)]
pub enum ResolutionErrorKind {
    #[error("input resolution failed: {0}")]
    Input(String),

    #[error("transformation failed: {message} ({source_type} -> {target_type})")]
    Transformation {
        message: String,
        source_type: String,
        target_type: String,
    },

    #[error("spread collision on keys [{}]", keys.join(", "))]
    SpreadCollision { keys: Vec<String> },

    #[error("required input '{input}' has no upstream output and no default")]
    DependencyNotReady { input: String },
}

impl ResolutionError {
    pub fn input(message: impl Into<String>, node_id: &str) -> Self {
        Self {
            kind: ResolutionErrorKind::Input(message.into()),
            node_id: node_id.to_string(),
            edge_id: None,
        }
    }

    pub fn transformation(
        message: impl Into<String>,
        source_type: &str,
        target_type: &str,
        node_id: &str,
        edge_id: &str,
    ) -> Self {
        Self {
            kind: ResolutionErrorKind::Transformation {
                message: message.into(),
                source_type: source_type.to_string(),
                target_type: target_type.to_string(),
            },
            node_id: node_id.to_string(),
            edge_id: Some(edge_id.to_string()),
        }
    }

    pub fn spread_collision(keys: Vec<String>, node_id: &str, edge_id: &str) -> Self {
        Self {
            kind: ResolutionErrorKind::SpreadCollision { keys },
            node_id: node_id.to_string(),
            edge_id: Some(edge_id.to_string()),
        }
    }

    pub fn dependency_not_ready(input: &str, node_id: &str) -> Self {
        Self {
            kind: ResolutionErrorKind::DependencyNotReady { input: input.to_string() },
            node_id: node_id.to_string(),
            edge_id: None,
        }
    }

    /// Short tag used as `error_type` in failure envelopes and events.
    pub fn kind_tag(&self) -> &'static str {
        match self.kind {
            ResolutionErrorKind::Input(_) => "InputResolutionError",
            ResolutionErrorKind::Transformation { .. } => "TransformationError",
            ResolutionErrorKind::SpreadCollision { .. } => "SpreadCollisionError",
            ResolutionErrorKind::DependencyNotReady { .. } => "DependencyNotReadyError",
        }
    }
}
