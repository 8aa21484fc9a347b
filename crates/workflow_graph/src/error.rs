// SPDX-License-Identifier: MIT OR Apache-2.0
//! Errors returned by the mutation service.

use crate::graph::GraphError;
use crate::history::HistoryError;
use crate::serialization::CodecError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a failed mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationErrorKind {
    /// Node not found
    NodeNotFound,
    /// Slot not found
    SlotNotFound,
    /// Slot types do not match
    IncompatibleTypes,
    /// Link not found
    LinkNotFound,
    /// Group not found
    GroupNotFound,
    /// Reroute not found
    RerouteNotFound,
    /// Subgraph definition not found
    SubgraphNotFound,
    /// Node does not instantiate a subgraph
    NotASubgraphNode,
    /// Node type is not registered
    UnknownNodeType,
    /// Document could not be read
    MalformedDocument,
    /// The mutation would break a graph invariant
    ValidationFailed,
    /// Nothing was copied
    ClipboardEmpty,
    /// Undo stack is empty
    NothingToUndo,
    /// Redo stack is empty
    NothingToRedo,
}

impl fmt::Display for MutationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A mutation that was rejected. The graph is unchanged.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{operation} failed ({kind}): {message}")]
pub struct GraphMutationError {
    /// Category
    pub kind: MutationErrorKind,
    /// Details
    pub message: String,
    /// Name of the operation that failed
    pub operation: String,
}

impl GraphMutationError {
    /// Create an error
    pub fn new(kind: MutationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            operation: String::new(),
        }
    }

    /// Attach the name of the failed operation
    pub fn in_operation(mut self, operation: &str) -> Self {
        self.operation = operation.to_string();
        self
    }
}

impl From<GraphError> for GraphMutationError {
    fn from(err: GraphError) -> Self {
        let kind = match &err {
            GraphError::NodeNotFound(_) => MutationErrorKind::NodeNotFound,
            GraphError::SlotNotFound { .. } => MutationErrorKind::SlotNotFound,
            GraphError::IncompatibleTypes { .. } => MutationErrorKind::IncompatibleTypes,
            GraphError::LinkNotFound(_) => MutationErrorKind::LinkNotFound,
            GraphError::GroupNotFound(_) => MutationErrorKind::GroupNotFound,
            GraphError::RerouteNotFound(_) => MutationErrorKind::RerouteNotFound,
            GraphError::SubgraphNotFound(_) => MutationErrorKind::SubgraphNotFound,
            GraphError::NotASubgraphNode(_) => MutationErrorKind::NotASubgraphNode,
            GraphError::UnknownNodeType(_) => MutationErrorKind::UnknownNodeType,
            GraphError::EmptySelection | GraphError::Invariant(_) => MutationErrorKind::ValidationFailed,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<CodecError> for GraphMutationError {
    fn from(err: CodecError) -> Self {
        let kind = match &err {
            CodecError::UnknownNodeType(_) => MutationErrorKind::UnknownNodeType,
            CodecError::MalformedDocument(_) | CodecError::Json(_) => MutationErrorKind::MalformedDocument,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<HistoryError> for GraphMutationError {
    fn from(err: HistoryError) -> Self {
        let kind = match &err {
            HistoryError::NothingToUndo => MutationErrorKind::NothingToUndo,
            HistoryError::NothingToRedo => MutationErrorKind::NothingToRedo,
            HistoryError::Serialization(_) => MutationErrorKind::MalformedDocument,
        };
        Self::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;

    #[test]
    fn test_graph_error_kinds() {
        let err = GraphMutationError::from(GraphError::NodeNotFound(NodeId(4))).in_operation("remove_node");
        assert_eq!(err.kind, MutationErrorKind::NodeNotFound);
        assert_eq!(err.operation, "remove_node");
        assert!(err.to_string().starts_with("remove_node failed (NodeNotFound)"));

        let err = GraphMutationError::from(GraphError::Invariant("x".into()));
        assert_eq!(err.kind, MutationErrorKind::ValidationFailed);
    }

    #[test]
    fn test_history_error_kinds() {
        assert_eq!(
            GraphMutationError::from(HistoryError::NothingToRedo).kind,
            MutationErrorKind::NothingToRedo
        );
    }
}
