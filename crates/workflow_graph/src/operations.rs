// SPDX-License-Identifier: MIT OR Apache-2.0
//! Serializable mutation commands.
//!
//! [`GraphMutationOperation`] is the command boundary of the engine: a host
//! can send these over any channel and feed them to
//! [`GraphMutationService::apply_operation`](crate::mutation::GraphMutationService::apply_operation).

use crate::group::GroupId;
use crate::link::{LinkId, LinkSegment, SlotRef};
use crate::measure::Rect;
use crate::node::{NodeId, NodeMode};
use crate::reroute::RerouteId;
use crate::slot::{SlotDirection, SlotType};
use crate::subgraph::SubgraphId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A mutation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum GraphMutationOperation {
    CreateNode {
        node_type: String,
        #[serde(default)]
        pos: [f64; 2],
    },
    RemoveNode {
        node_id: NodeId,
    },
    UpdateNodeProperty {
        node_id: NodeId,
        key: String,
        value: Value,
    },
    UpdateNodeTitle {
        node_id: NodeId,
        title: String,
    },
    ChangeNodeMode {
        node_id: NodeId,
        mode: NodeMode,
    },
    BypassNode {
        node_id: NodeId,
    },
    UnbypassNode {
        node_id: NodeId,
    },
    CloneNode {
        node_id: NodeId,
    },
    SetSlotType {
        node_id: NodeId,
        direction: SlotDirection,
        slot: usize,
        slot_type: SlotType,
    },
    Connect {
        origin: SlotRef,
        target: SlotRef,
    },
    Disconnect {
        node_id: NodeId,
        direction: SlotDirection,
        slot: usize,
    },
    DisconnectLink {
        link_id: LinkId,
    },
    CreateGroup {
        title: String,
        bounding: Rect,
    },
    RemoveGroup {
        group_id: GroupId,
    },
    UpdateGroupTitle {
        group_id: GroupId,
        title: String,
    },
    AddNodesToGroup {
        group_id: GroupId,
        node_ids: Vec<NodeId>,
    },
    RecomputeGroupNodes {
        group_id: GroupId,
    },
    AddReroute {
        pos: [f64; 2],
        before: LinkSegment,
    },
    RemoveReroute {
        reroute_id: RerouteId,
    },
    CopyNodes {
        node_ids: Vec<NodeId>,
    },
    CutNodes {
        node_ids: Vec<NodeId>,
    },
    PasteNodes {
        #[serde(default)]
        pos: Option<[f64; 2]>,
    },
    AddSubgraphNodeInput {
        node_id: NodeId,
        name: String,
        slot_type: SlotType,
    },
    AddSubgraphNodeOutput {
        node_id: NodeId,
        name: String,
        slot_type: SlotType,
    },
    RemoveSubgraphNodeInput {
        node_id: NodeId,
        index: usize,
    },
    RemoveSubgraphNodeOutput {
        node_id: NodeId,
        index: usize,
    },
    CreateSubgraph {
        node_ids: Vec<NodeId>,
    },
    UnpackSubgraph {
        node_id: NodeId,
    },
    AddSubgraphInput {
        subgraph_id: SubgraphId,
        name: String,
        slot_type: SlotType,
    },
    AddSubgraphOutput {
        subgraph_id: SubgraphId,
        name: String,
        slot_type: SlotType,
    },
    RemoveSubgraphInput {
        subgraph_id: SubgraphId,
        index: usize,
    },
    RemoveSubgraphOutput {
        subgraph_id: SubgraphId,
        index: usize,
    },
    ClearGraph,
    Undo,
    Redo,
}

impl GraphMutationOperation {
    /// Operation name, as used in history entries and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateNode { .. } => "create_node",
            Self::RemoveNode { .. } => "remove_node",
            Self::UpdateNodeProperty { .. } => "update_node_property",
            Self::UpdateNodeTitle { .. } => "update_node_title",
            Self::ChangeNodeMode { .. } => "change_node_mode",
            Self::BypassNode { .. } => "bypass_node",
            Self::UnbypassNode { .. } => "unbypass_node",
            Self::CloneNode { .. } => "clone_node",
            Self::SetSlotType { .. } => "set_slot_type",
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::DisconnectLink { .. } => "disconnect_link",
            Self::CreateGroup { .. } => "create_group",
            Self::RemoveGroup { .. } => "remove_group",
            Self::UpdateGroupTitle { .. } => "update_group_title",
            Self::AddNodesToGroup { .. } => "add_nodes_to_group",
            Self::RecomputeGroupNodes { .. } => "recompute_group_nodes",
            Self::AddReroute { .. } => "add_reroute",
            Self::RemoveReroute { .. } => "remove_reroute",
            Self::CopyNodes { .. } => "copy_nodes",
            Self::CutNodes { .. } => "cut_nodes",
            Self::PasteNodes { .. } => "paste_nodes",
            Self::AddSubgraphNodeInput { .. } => "add_subgraph_node_input",
            Self::AddSubgraphNodeOutput { .. } => "add_subgraph_node_output",
            Self::RemoveSubgraphNodeInput { .. } => "remove_subgraph_node_input",
            Self::RemoveSubgraphNodeOutput { .. } => "remove_subgraph_node_output",
            Self::CreateSubgraph { .. } => "create_subgraph",
            Self::UnpackSubgraph { .. } => "unpack_subgraph",
            Self::AddSubgraphInput { .. } => "add_subgraph_input",
            Self::AddSubgraphOutput { .. } => "add_subgraph_output",
            Self::RemoveSubgraphInput { .. } => "remove_subgraph_input",
            Self::RemoveSubgraphOutput { .. } => "remove_subgraph_output",
            Self::ClearGraph => "clear_graph",
            Self::Undo => "undo",
            Self::Redo => "redo",
        }
    }
}

/// Result of an applied operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum OperationOutput {
    None,
    Node(NodeId),
    Nodes(Vec<NodeId>),
    Link(LinkId),
    Links(Vec<LinkId>),
    Group(GroupId),
    Reroute(RerouteId),
    Slot(usize),
    Count(usize),
    Subgraph { subgraph_id: SubgraphId, node_id: NodeId },
}
