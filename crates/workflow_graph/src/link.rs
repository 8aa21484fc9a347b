// SPDX-License-Identifier: MIT OR Apache-2.0
//! Link (edge) definitions for the graph.

use crate::node::{NodeId, SUBGRAPH_INPUT_ID, SUBGRAPH_OUTPUT_ID};
use crate::reroute::RerouteId;
use crate::slot::SlotType;
use crate::subgraph::SubgraphId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a link, never reused within a root graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A directed link from an output slot to an input slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    /// Unique link ID
    pub id: LinkId,
    /// Source node ID ([`SUBGRAPH_INPUT_ID`] for the boundary input)
    pub origin_id: NodeId,
    /// Source slot index
    pub origin_slot: usize,
    /// Target node ID ([`SUBGRAPH_OUTPUT_ID`] for the boundary output)
    pub target_id: NodeId,
    /// Target slot index
    pub target_slot: usize,
    /// Type carried by the link
    #[serde(rename = "type")]
    pub link_type: SlotType,
    /// Reroute nearest to the target, if the link is routed
    #[serde(rename = "parentId", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<RerouteId>,
}

impl Link {
    /// Create a new link
    pub fn new(
        id: LinkId,
        origin_id: NodeId,
        origin_slot: usize,
        target_id: NodeId,
        target_slot: usize,
        link_type: SlotType,
    ) -> Self {
        Self {
            id,
            origin_id,
            origin_slot,
            target_id,
            target_slot,
            link_type,
            parent_id: None,
        }
    }

    /// Check if this link involves a specific node
    pub fn involves_node(&self, node_id: NodeId) -> bool {
        self.origin_id == node_id || self.target_id == node_id
    }

    /// Check if this link starts at the enclosing subgraph's boundary input
    pub fn origin_is_boundary(&self) -> bool {
        self.origin_id == SUBGRAPH_INPUT_ID
    }

    /// Check if this link ends at the enclosing subgraph's boundary output
    pub fn target_is_boundary(&self) -> bool {
        self.target_id == SUBGRAPH_OUTPUT_ID
    }

    /// Origin end of the link
    pub fn origin(&self) -> LinkEndpoint {
        if self.origin_is_boundary() {
            LinkEndpoint::SubgraphInput {
                index: self.origin_slot,
            }
        } else {
            LinkEndpoint::Node {
                node_id: self.origin_id,
                slot: self.origin_slot,
            }
        }
    }

    /// Target end of the link
    pub fn target(&self) -> LinkEndpoint {
        if self.target_is_boundary() {
            LinkEndpoint::SubgraphOutput {
                index: self.target_slot,
            }
        } else {
            LinkEndpoint::Node {
                node_id: self.target_id,
                slot: self.target_slot,
            }
        }
    }
}

/// Reference to a slot on a node (or a boundary sentinel) in one graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRef {
    /// Node owning the slot
    pub node_id: NodeId,
    /// Slot index
    pub slot: usize,
}

impl SlotRef {
    /// Create a slot reference
    pub fn new(node_id: NodeId, slot: usize) -> Self {
        Self { node_id, slot }
    }

    /// Boundary input slot of the enclosing subgraph
    pub fn subgraph_input(index: usize) -> Self {
        Self::new(SUBGRAPH_INPUT_ID, index)
    }

    /// Boundary output slot of the enclosing subgraph
    pub fn subgraph_output(index: usize) -> Self {
        Self::new(SUBGRAPH_OUTPUT_ID, index)
    }
}

/// One end of a resolved link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkEndpoint {
    /// An ordinary node slot
    Node {
        /// Node ID
        node_id: NodeId,
        /// Slot index
        slot: usize,
    },
    /// A boundary input of the subgraph the link lives in
    SubgraphInput {
        /// Boundary slot index
        index: usize,
    },
    /// A boundary output of the subgraph the link lives in
    SubgraphOutput {
        /// Boundary slot index
        index: usize,
    },
}

impl LinkEndpoint {
    /// Node ID, if this endpoint is an ordinary node slot
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            Self::Node { node_id, .. } => Some(*node_id),
            _ => None,
        }
    }
}

/// A boundary slot of a subgraph definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundarySlotRef {
    /// Subgraph definition
    pub subgraph_id: SubgraphId,
    /// Index in the boundary list
    pub index: usize,
}

/// A link with its endpoints looked up.
///
/// A link can end at a node slot, at a boundary proxy of the subgraph it
/// lives in, or at a subgraph node whose slot mirrors a boundary slot of
/// another graph. Callers must handle every shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConnection {
    /// The link itself
    pub link: Link,
    /// Output end
    pub origin: LinkEndpoint,
    /// Input end
    pub target: LinkEndpoint,
    /// Type of the output end
    pub origin_type: SlotType,
    /// Type of the input end
    pub target_type: SlotType,
    /// Boundary input behind the target, when the target is a subgraph node
    pub subgraph_input: Option<BoundarySlotRef>,
    /// Boundary output behind the origin, when the origin is a subgraph node
    pub subgraph_output: Option<BoundarySlotRef>,
    /// Reroutes the link passes through, from the input side outwards
    pub reroutes: Vec<RerouteId>,
}

/// Something a reroute can be inserted in front of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum LinkSegment {
    /// A link (the reroute goes next to its target)
    Link(LinkId),
    /// An existing reroute (the new one goes between it and its parent)
    Reroute(RerouteId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_serialization_shape() {
        let link = Link::new(LinkId(3), NodeId(1), 0, NodeId(2), 1, SlotType::new("MODEL"));
        let json = serde_json::to_value(&link).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 3,
                "origin_id": 1,
                "origin_slot": 0,
                "target_id": 2,
                "target_slot": 1,
                "type": "MODEL"
            })
        );
    }

    #[test]
    fn test_boundary_endpoints() {
        let link = Link::new(LinkId(1), SUBGRAPH_INPUT_ID, 2, SUBGRAPH_OUTPUT_ID, 0, SlotType::wildcard());
        assert_eq!(link.origin(), LinkEndpoint::SubgraphInput { index: 2 });
        assert_eq!(link.target(), LinkEndpoint::SubgraphOutput { index: 0 });
        assert_eq!(link.origin().node_id(), None);
    }
}
