// SPDX-License-Identifier: MIT OR Apache-2.0
//! The mutation service: the single write path into a graph.
//!
//! Every mutating operation runs against a staged clone of the graph while
//! the event bus is held. The clone replaces the live graph only when the
//! operation and the invariant check both succeed; otherwise the clone and
//! its buffered events are dropped and the live graph is untouched. Each
//! committed operation is recorded in the undo history as a pair of
//! document snapshots.

use crate::config::EngineConfig;
use crate::error::{GraphMutationError, MutationErrorKind};
use crate::events::EventBus;
use crate::graph::{Graph, GraphError, GraphScope};
use crate::group::{Group, GroupId};
use crate::history::{History, StateSnapshot};
use crate::link::{Link, LinkId, LinkSegment, SlotRef};
use crate::measure::Rect;
use crate::node::{NodeId, NodeMode, NodeRegistry};
use crate::operations::{GraphMutationOperation, OperationOutput};
use crate::reroute::RerouteId;
use crate::serialization::{
    deserialize_into, restore_node, serialize, serialize_node, Document, GraphDocument, SerialisedNode,
};
use crate::slot::{SlotDirection, SlotType};
use crate::subgraph::SubgraphId;
use indexmap::IndexSet;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Nodes and the links between them, held for pasting
#[derive(Debug, Clone, PartialEq)]
pub struct Clipboard {
    /// Copied nodes
    pub nodes: Vec<SerialisedNode>,
    /// Links whose both ends were copied
    pub links: Vec<Link>,
    /// Top-left corner of the copied nodes
    pub anchor: [f64; 2],
}

/// Mutation façade over a [`Graph`]
#[derive(Debug)]
pub struct GraphMutationService {
    graph: Graph,
    registry: NodeRegistry,
    history: History,
    clipboard: Option<Clipboard>,
    config: EngineConfig,
    scope: GraphScope,
}

impl GraphMutationService {
    /// Create a service over an empty graph
    pub fn new(registry: NodeRegistry) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    /// Create a service over an empty graph with custom settings
    pub fn with_config(registry: NodeRegistry, config: EngineConfig) -> Self {
        Self::from_graph(Graph::new(), registry, config)
    }

    /// Wrap an existing graph
    pub fn from_graph(graph: Graph, registry: NodeRegistry, config: EngineConfig) -> Self {
        Self {
            graph,
            registry,
            history: History::with_max_depth(config.max_history),
            clipboard: None,
            config,
            scope: GraphScope::Root,
        }
    }

    /// The live graph
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Node kinds available to `create_node` and document loads
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Settings
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Undo history
    pub fn history(&self) -> &History {
        &self.history
    }

    /// Event bus of the live graph
    pub fn events(&self) -> &EventBus {
        self.graph.events()
    }

    /// Current clipboard contents
    pub fn clipboard(&self) -> Option<&Clipboard> {
        self.clipboard.as_ref()
    }

    /// Body that node, link, group and reroute operations address
    pub fn scope(&self) -> GraphScope {
        self.scope
    }

    /// Direct node, link, group and reroute operations at a subgraph's body
    pub fn enter_subgraph(&mut self, subgraph_id: SubgraphId) -> Result<(), GraphMutationError> {
        if self.graph.subgraph(subgraph_id).is_none() {
            return Err(GraphMutationError::from(GraphError::SubgraphNotFound(subgraph_id)).in_operation("enter_subgraph"));
        }
        self.scope = GraphScope::Subgraph(subgraph_id);
        Ok(())
    }

    /// Direct operations at the root body again
    pub fn exit_to_root(&mut self) {
        self.scope = GraphScope::Root;
    }

    /// Current document
    pub fn document(&self) -> GraphDocument {
        serialize(&self.graph)
    }

    /// Replace the graph with a document. Clears the history.
    pub fn load(&mut self, document: &Document) -> Result<(), GraphMutationError> {
        deserialize_into(&mut self.graph, document, &self.registry)
            .map_err(|e| GraphMutationError::from(e).in_operation("load"))?;
        self.history.clear();
        self.scope = GraphScope::Root;
        Ok(())
    }

    /// Run `op` on a staged clone and commit it if it and the invariant
    /// check succeed
    fn mutate<T>(
        &mut self,
        operation: &str,
        op: impl FnOnce(&mut Graph, &NodeRegistry) -> Result<T, GraphMutationError>,
    ) -> Result<T, GraphMutationError> {
        let before = StateSnapshot::from_value(&serialize(&self.graph))
            .map_err(|e| GraphMutationError::from(e).in_operation(operation))?;

        let events = self.graph.events().clone();
        let mut staged = self.graph.clone();
        events.hold();

        let result = op(&mut staged, &self.registry).and_then(|value| {
            staged
                .validate()
                .map_err(|e| GraphMutationError::new(MutationErrorKind::ValidationFailed, e.to_string()))?;
            staged.revision += 1;
            let after = StateSnapshot::from_value(&serialize(&staged))?;
            Ok((value, after))
        });

        match result {
            Ok((value, after)) => {
                self.graph = staged;
                self.history.record(operation, before, after);
                if let GraphScope::Subgraph(id) = self.scope {
                    if self.graph.subgraph(id).is_none() {
                        self.scope = GraphScope::Root;
                    }
                }
                events.release(true);
                debug!(operation, revision = self.graph.revision(), "applied mutation");
                Ok(value)
            }
            Err(err) => {
                events.release(false);
                debug!(operation, kind = %err.kind, "rejected mutation: {}", err.message);
                Err(err.in_operation(operation))
            }
        }
    }

    /// Add a node of a registered type
    pub fn create_node(&mut self, node_type: &str, pos: [f64; 2]) -> Result<NodeId, GraphMutationError> {
        let scope = self.scope;
        self.mutate("create_node", |graph, registry| {
            let node = registry
                .create_node(node_type)
                .ok_or_else(|| GraphError::UnknownNodeType(node_type.to_string()))?
                .with_position(pos[0], pos[1]);
            Ok(graph.scope_mut(scope)?.add_node(node))
        })
    }

    /// Remove a node and its links
    pub fn remove_node(&mut self, node_id: NodeId) -> Result<(), GraphMutationError> {
        let scope = self.scope;
        self.mutate("remove_node", |graph, _| {
            graph.scope_mut(scope)?.remove_node(node_id)?;
            Ok(())
        })
    }

    /// Set a node property
    pub fn update_node_property(&mut self, node_id: NodeId, key: &str, value: Value) -> Result<(), GraphMutationError> {
        let scope = self.scope;
        self.mutate("update_node_property", |graph, _| {
            graph.scope_mut(scope)?.node_mut(node_id)?.set_property(key, value);
            Ok(())
        })
    }

    /// Rename a node
    pub fn update_node_title(&mut self, node_id: NodeId, title: &str) -> Result<(), GraphMutationError> {
        let scope = self.scope;
        self.mutate("update_node_title", |graph, _| {
            graph.scope_mut(scope)?.node_mut(node_id)?.set_title(title);
            Ok(())
        })
    }

    /// Change a node's mode
    pub fn change_node_mode(&mut self, node_id: NodeId, mode: NodeMode) -> Result<(), GraphMutationError> {
        self.set_mode("change_node_mode", node_id, mode)
    }

    /// Put a node in bypass mode
    pub fn bypass_node(&mut self, node_id: NodeId) -> Result<(), GraphMutationError> {
        self.set_mode("bypass_node", node_id, NodeMode::Bypass)
    }

    /// Take a node out of bypass mode
    pub fn unbypass_node(&mut self, node_id: NodeId) -> Result<(), GraphMutationError> {
        self.set_mode("unbypass_node", node_id, NodeMode::Always)
    }

    fn set_mode(&mut self, operation: &str, node_id: NodeId, mode: NodeMode) -> Result<(), GraphMutationError> {
        let scope = self.scope;
        self.mutate(operation, |graph, _| {
            graph.scope_mut(scope)?.node_mut(node_id)?.set_mode(mode);
            Ok(())
        })
    }

    /// Duplicate a node without its links, offset by `clone_offset`
    pub fn clone_node(&mut self, node_id: NodeId) -> Result<NodeId, GraphMutationError> {
        let scope = self.scope;
        let [dx, dy] = self.config.clone_offset;
        self.mutate("clone_node", |graph, _| {
            let mut target = graph.scope_mut(scope)?;
            let mut copy = target
                .body()
                .node(node_id)
                .ok_or(GraphError::NodeNotFound(node_id))?
                .clone();
            copy.id = NodeId::UNASSIGNED;
            for input in &mut copy.inputs {
                input.link = None;
            }
            for output in &mut copy.outputs {
                output.links.clear();
            }
            copy.translate(dx, dy);
            let id = target.add_node(copy);
            target.recompute_dynamic([id]);
            Ok(id)
        })
    }

    /// Change a slot's type, disconnecting links it invalidates
    pub fn set_slot_type(
        &mut self,
        node_id: NodeId,
        direction: SlotDirection,
        slot: usize,
        slot_type: SlotType,
    ) -> Result<Vec<LinkId>, GraphMutationError> {
        let scope = self.scope;
        self.mutate("set_slot_type", |graph, _| {
            Ok(graph
                .scope_mut(scope)?
                .set_slot_type(node_id, direction, slot, slot_type)?)
        })
    }

    /// Link an output to an input, replacing any link on the input
    pub fn connect(&mut self, origin: SlotRef, target: SlotRef) -> Result<LinkId, GraphMutationError> {
        let scope = self.scope;
        self.mutate("connect", |graph, _| Ok(graph.scope_mut(scope)?.connect(origin, target)?))
    }

    /// Remove every link on one slot
    pub fn disconnect(&mut self, node_id: NodeId, direction: SlotDirection, slot: usize) -> Result<Vec<LinkId>, GraphMutationError> {
        let scope = self.scope;
        self.mutate("disconnect", |graph, _| {
            Ok(graph.scope_mut(scope)?.disconnect_slot(node_id, direction, slot)?)
        })
    }

    /// Remove one link
    pub fn disconnect_link(&mut self, link_id: LinkId) -> Result<(), GraphMutationError> {
        let scope = self.scope;
        self.mutate("disconnect_link", |graph, _| {
            graph.scope_mut(scope)?.remove_link(link_id)?;
            Ok(())
        })
    }

    /// Add a group
    pub fn create_group(&mut self, title: &str, bounding: Rect) -> Result<GroupId, GraphMutationError> {
        let scope = self.scope;
        self.mutate("create_group", |graph, _| {
            Ok(graph.scope_mut(scope)?.add_group(Group::new(title, bounding)))
        })
    }

    /// Remove a group, keeping its nodes
    pub fn remove_group(&mut self, group_id: GroupId) -> Result<(), GraphMutationError> {
        let scope = self.scope;
        self.mutate("remove_group", |graph, _| {
            graph.scope_mut(scope)?.remove_group(group_id)?;
            Ok(())
        })
    }

    /// Rename a group
    pub fn update_group_title(&mut self, group_id: GroupId, title: &str) -> Result<(), GraphMutationError> {
        let scope = self.scope;
        self.mutate("update_group_title", |graph, _| {
            graph.scope_mut(scope)?.set_group_title(group_id, title)?;
            Ok(())
        })
    }

    /// Grow a group around extra nodes
    pub fn add_nodes_to_group(&mut self, group_id: GroupId, node_ids: &[NodeId]) -> Result<(), GraphMutationError> {
        let scope = self.scope;
        self.mutate("add_nodes_to_group", |graph, _| {
            graph.scope_mut(scope)?.add_nodes_to_group(group_id, node_ids)?;
            Ok(())
        })
    }

    /// Recompute a group's members from node positions.
    ///
    /// Membership is not part of the document, so this is not recorded.
    pub fn recompute_group_nodes(&mut self, group_id: GroupId) -> Result<Vec<NodeId>, GraphMutationError> {
        self.graph
            .scope_mut(self.scope)
            .and_then(|mut target| target.recompute_group_members(group_id))
            .map_err(|e| GraphMutationError::from(e).in_operation("recompute_group_nodes"))
    }

    /// Insert a reroute in front of a link or reroute
    pub fn add_reroute(&mut self, pos: [f64; 2], before: LinkSegment) -> Result<RerouteId, GraphMutationError> {
        let scope = self.scope;
        self.mutate("add_reroute", |graph, _| Ok(graph.scope_mut(scope)?.create_reroute(pos, before)?))
    }

    /// Remove a reroute
    pub fn remove_reroute(&mut self, reroute_id: RerouteId) -> Result<(), GraphMutationError> {
        let scope = self.scope;
        self.mutate("remove_reroute", |graph, _| {
            graph.scope_mut(scope)?.remove_reroute(reroute_id)?;
            Ok(())
        })
    }

    fn copy_selection(&self, node_ids: &IndexSet<NodeId>) -> Result<Clipboard, GraphError> {
        if node_ids.is_empty() {
            return Err(GraphError::EmptySelection);
        }
        let body = self.graph.body(self.scope)?;
        let mut nodes = Vec::with_capacity(node_ids.len());
        let mut anchor = [f64::INFINITY, f64::INFINITY];
        for id in node_ids {
            let node = body.node(*id).ok_or(GraphError::NodeNotFound(*id))?;
            anchor = [anchor[0].min(node.pos()[0]), anchor[1].min(node.pos()[1])];
            nodes.push(serialize_node(node));
        }
        let links = body
            .links()
            .filter(|l| node_ids.contains(&l.origin_id) && node_ids.contains(&l.target_id))
            .cloned()
            .collect();
        Ok(Clipboard { nodes, links, anchor })
    }

    /// Copy nodes and the links between them. Not recorded in history.
    pub fn copy_nodes(&mut self, node_ids: &[NodeId]) -> Result<usize, GraphMutationError> {
        let node_ids: IndexSet<NodeId> = node_ids.iter().copied().collect();
        let clipboard = self
            .copy_selection(&node_ids)
            .map_err(|e| GraphMutationError::from(e).in_operation("copy_nodes"))?;
        let count = clipboard.nodes.len();
        self.clipboard = Some(clipboard);
        debug!(count, "copied nodes");
        Ok(count)
    }

    /// Copy nodes, then remove them. One history entry.
    pub fn cut_nodes(&mut self, node_ids: &[NodeId]) -> Result<usize, GraphMutationError> {
        let node_ids: IndexSet<NodeId> = node_ids.iter().copied().collect();
        let clipboard = self
            .copy_selection(&node_ids)
            .map_err(|e| GraphMutationError::from(e).in_operation("cut_nodes"))?;
        let scope = self.scope;
        self.mutate("cut_nodes", |graph, _| {
            let mut target = graph.scope_mut(scope)?;
            for id in &node_ids {
                target.remove_node(*id)?;
            }
            Ok(())
        })?;
        let count = clipboard.nodes.len();
        self.clipboard = Some(clipboard);
        Ok(count)
    }

    /// Paste the clipboard with fresh ids and its internal links.
    ///
    /// With `pos`, the copied nodes' top-left corner lands there; otherwise
    /// they are offset by `paste_offset` from where they were copied.
    pub fn paste_nodes(&mut self, pos: Option<[f64; 2]>) -> Result<Vec<NodeId>, GraphMutationError> {
        let clipboard = self.clipboard.clone().ok_or_else(|| {
            GraphMutationError::new(MutationErrorKind::ClipboardEmpty, "Nothing has been copied").in_operation("paste_nodes")
        })?;
        let [dx, dy] = match pos {
            Some([x, y]) => [x - clipboard.anchor[0], y - clipboard.anchor[1]],
            None => self.config.paste_offset,
        };
        let scope = self.scope;

        self.mutate("paste_nodes", |graph, registry| {
            let definitions: HashSet<SubgraphId> = graph.subgraphs().map(|sg| sg.id).collect();
            let mut target = graph.scope_mut(scope)?;
            let mut ids = HashMap::new();
            let mut added = Vec::with_capacity(clipboard.nodes.len());
            for stored in &clipboard.nodes {
                let mut node = restore_node(stored, registry, &definitions)?;
                node.id = NodeId::UNASSIGNED;
                node.translate(dx, dy);
                let id = target.add_node(node);
                ids.insert(stored.id, id);
                added.push(id);
            }
            for link in &clipboard.links {
                if let (Some(origin), Some(dest)) = (ids.get(&link.origin_id), ids.get(&link.target_id)) {
                    target.connect(
                        SlotRef::new(*origin, link.origin_slot),
                        SlotRef::new(*dest, link.target_slot),
                    )?;
                }
            }
            Ok(added)
        })
    }

    /// Add an input to a subgraph node (and its definition)
    pub fn add_subgraph_node_input(&mut self, node_id: NodeId, name: &str, slot_type: SlotType) -> Result<usize, GraphMutationError> {
        let scope = self.scope;
        self.mutate("add_subgraph_node_input", |graph, _| {
            Ok(graph.add_subgraph_node_input(scope, node_id, name, slot_type)?)
        })
    }

    /// Add an output to a subgraph node (and its definition)
    pub fn add_subgraph_node_output(&mut self, node_id: NodeId, name: &str, slot_type: SlotType) -> Result<usize, GraphMutationError> {
        let scope = self.scope;
        self.mutate("add_subgraph_node_output", |graph, _| {
            Ok(graph.add_subgraph_node_output(scope, node_id, name, slot_type)?)
        })
    }

    /// Remove an input from a subgraph node (and its definition)
    pub fn remove_subgraph_node_input(&mut self, node_id: NodeId, index: usize) -> Result<(), GraphMutationError> {
        let scope = self.scope;
        self.mutate("remove_subgraph_node_input", |graph, _| {
            Ok(graph.remove_subgraph_node_input(scope, node_id, index)?)
        })
    }

    /// Remove an output from a subgraph node (and its definition)
    pub fn remove_subgraph_node_output(&mut self, node_id: NodeId, index: usize) -> Result<(), GraphMutationError> {
        let scope = self.scope;
        self.mutate("remove_subgraph_node_output", |graph, _| {
            Ok(graph.remove_subgraph_node_output(scope, node_id, index)?)
        })
    }

    /// Move a selection into a new subgraph
    pub fn create_subgraph(&mut self, node_ids: &[NodeId]) -> Result<(SubgraphId, NodeId), GraphMutationError> {
        let scope = self.scope;
        self.mutate("create_subgraph", |graph, _| Ok(graph.create_subgraph(scope, node_ids)?))
    }

    /// Inline a subgraph node
    pub fn unpack_subgraph(&mut self, node_id: NodeId) -> Result<Vec<NodeId>, GraphMutationError> {
        let scope = self.scope;
        self.mutate("unpack_subgraph", |graph, _| Ok(graph.unpack_subgraph(scope, node_id)?))
    }

    /// Add a boundary input to a subgraph definition
    pub fn add_subgraph_input(&mut self, subgraph_id: SubgraphId, name: &str, slot_type: SlotType) -> Result<usize, GraphMutationError> {
        self.mutate("add_subgraph_input", |graph, _| {
            Ok(graph.add_subgraph_input(subgraph_id, name, slot_type)?)
        })
    }

    /// Add a boundary output to a subgraph definition
    pub fn add_subgraph_output(&mut self, subgraph_id: SubgraphId, name: &str, slot_type: SlotType) -> Result<usize, GraphMutationError> {
        self.mutate("add_subgraph_output", |graph, _| {
            Ok(graph.add_subgraph_output(subgraph_id, name, slot_type)?)
        })
    }

    /// Remove a boundary input from a subgraph definition
    pub fn remove_subgraph_input(&mut self, subgraph_id: SubgraphId, index: usize) -> Result<(), GraphMutationError> {
        self.mutate("remove_subgraph_input", |graph, _| {
            Ok(graph.remove_subgraph_input(subgraph_id, index)?)
        })
    }

    /// Remove a boundary output from a subgraph definition
    pub fn remove_subgraph_output(&mut self, subgraph_id: SubgraphId, index: usize) -> Result<(), GraphMutationError> {
        self.mutate("remove_subgraph_output", |graph, _| {
            Ok(graph.remove_subgraph_output(subgraph_id, index)?)
        })
    }

    /// Remove all content and subgraph definitions. Id counters are kept.
    pub fn clear_graph(&mut self) -> Result<(), GraphMutationError> {
        self.mutate("clear_graph", |graph, _| {
            graph.clear();
            Ok(())
        })
    }

    /// Restore the state before the last recorded mutation
    pub fn undo(&mut self) -> Result<(), GraphMutationError> {
        let operation = self
            .history
            .undo()
            .map_err(|e| GraphMutationError::from(e).in_operation("undo"))?;
        if let Err(err) = self.restore(&operation.before) {
            warn!(operation = %operation.description, "undo failed: {}", err.message);
            self.history.revert_undo();
            return Err(err.in_operation("undo"));
        }
        debug!(operation = %operation.description, "undone");
        Ok(())
    }

    /// Re-apply the last undone mutation
    pub fn redo(&mut self) -> Result<(), GraphMutationError> {
        let operation = self
            .history
            .redo()
            .map_err(|e| GraphMutationError::from(e).in_operation("redo"))?;
        if let Err(err) = self.restore(&operation.after) {
            warn!(operation = %operation.description, "redo failed: {}", err.message);
            self.history.revert_redo();
            return Err(err.in_operation("redo"));
        }
        debug!(operation = %operation.description, "redone");
        Ok(())
    }

    fn restore(&mut self, snapshot: &StateSnapshot) -> Result<(), GraphMutationError> {
        let document: GraphDocument = snapshot.to_value()?;
        deserialize_into(&mut self.graph, &Document::Current(document), &self.registry)?;
        if let GraphScope::Subgraph(id) = self.scope {
            if self.graph.subgraph(id).is_none() {
                self.scope = GraphScope::Root;
            }
        }
        Ok(())
    }

    /// Apply a serialized command
    pub fn apply_operation(&mut self, operation: GraphMutationOperation) -> Result<OperationOutput, GraphMutationError> {
        use GraphMutationOperation as Op;
        use OperationOutput as Out;

        Ok(match operation {
            Op::CreateNode { node_type, pos } => Out::Node(self.create_node(&node_type, pos)?),
            Op::RemoveNode { node_id } => self.remove_node(node_id).map(|()| Out::None)?,
            Op::UpdateNodeProperty { node_id, key, value } => {
                self.update_node_property(node_id, &key, value).map(|()| Out::None)?
            }
            Op::UpdateNodeTitle { node_id, title } => self.update_node_title(node_id, &title).map(|()| Out::None)?,
            Op::ChangeNodeMode { node_id, mode } => self.change_node_mode(node_id, mode).map(|()| Out::None)?,
            Op::BypassNode { node_id } => self.bypass_node(node_id).map(|()| Out::None)?,
            Op::UnbypassNode { node_id } => self.unbypass_node(node_id).map(|()| Out::None)?,
            Op::CloneNode { node_id } => Out::Node(self.clone_node(node_id)?),
            Op::SetSlotType {
                node_id,
                direction,
                slot,
                slot_type,
            } => Out::Links(self.set_slot_type(node_id, direction, slot, slot_type)?),
            Op::Connect { origin, target } => Out::Link(self.connect(origin, target)?),
            Op::Disconnect {
                node_id,
                direction,
                slot,
            } => Out::Links(self.disconnect(node_id, direction, slot)?),
            Op::DisconnectLink { link_id } => self.disconnect_link(link_id).map(|()| Out::None)?,
            Op::CreateGroup { title, bounding } => Out::Group(self.create_group(&title, bounding)?),
            Op::RemoveGroup { group_id } => self.remove_group(group_id).map(|()| Out::None)?,
            Op::UpdateGroupTitle { group_id, title } => self.update_group_title(group_id, &title).map(|()| Out::None)?,
            Op::AddNodesToGroup { group_id, node_ids } => {
                self.add_nodes_to_group(group_id, &node_ids).map(|()| Out::None)?
            }
            Op::RecomputeGroupNodes { group_id } => Out::Nodes(self.recompute_group_nodes(group_id)?),
            Op::AddReroute { pos, before } => Out::Reroute(self.add_reroute(pos, before)?),
            Op::RemoveReroute { reroute_id } => self.remove_reroute(reroute_id).map(|()| Out::None)?,
            Op::CopyNodes { node_ids } => Out::Count(self.copy_nodes(&node_ids)?),
            Op::CutNodes { node_ids } => Out::Count(self.cut_nodes(&node_ids)?),
            Op::PasteNodes { pos } => Out::Nodes(self.paste_nodes(pos)?),
            Op::AddSubgraphNodeInput {
                node_id,
                name,
                slot_type,
            } => Out::Slot(self.add_subgraph_node_input(node_id, &name, slot_type)?),
            Op::AddSubgraphNodeOutput {
                node_id,
                name,
                slot_type,
            } => Out::Slot(self.add_subgraph_node_output(node_id, &name, slot_type)?),
            Op::RemoveSubgraphNodeInput { node_id, index } => {
                self.remove_subgraph_node_input(node_id, index).map(|()| Out::None)?
            }
            Op::RemoveSubgraphNodeOutput { node_id, index } => {
                self.remove_subgraph_node_output(node_id, index).map(|()| Out::None)?
            }
            Op::CreateSubgraph { node_ids } => {
                let (subgraph_id, node_id) = self.create_subgraph(&node_ids)?;
                Out::Subgraph { subgraph_id, node_id }
            }
            Op::UnpackSubgraph { node_id } => Out::Nodes(self.unpack_subgraph(node_id)?),
            Op::AddSubgraphInput {
                subgraph_id,
                name,
                slot_type,
            } => Out::Slot(self.add_subgraph_input(subgraph_id, &name, slot_type)?),
            Op::AddSubgraphOutput {
                subgraph_id,
                name,
                slot_type,
            } => Out::Slot(self.add_subgraph_output(subgraph_id, &name, slot_type)?),
            Op::RemoveSubgraphInput { subgraph_id, index } => {
                self.remove_subgraph_input(subgraph_id, index).map(|()| Out::None)?
            }
            Op::RemoveSubgraphOutput { subgraph_id, index } => {
                self.remove_subgraph_output(subgraph_id, index).map(|()| Out::None)?
            }
            Op::ClearGraph => self.clear_graph().map(|()| Out::None)?,
            Op::Undo => self.undo().map(|()| Out::None)?,
            Op::Redo => self.redo().map(|()| Out::None)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::GraphEvent;
    use crate::node::{Node, NodeHooks, NodeKind};
    use crate::slot::SlotSpec;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        registry.register(NodeKind::new("Loader").with_output(SlotSpec::new("MODEL", "MODEL")));
        registry.register(
            NodeKind::new("Sampler")
                .with_input(SlotSpec::new("model", "MODEL"))
                .with_output(SlotSpec::new("LATENT", "LATENT")),
        );
        registry.register(NodeKind::new("Mask").with_input(SlotSpec::new("mask", "MASK")));
        registry
    }

    fn service_with_link() -> (GraphMutationService, NodeId, NodeId, LinkId) {
        let mut service = GraphMutationService::new(registry());
        let a = service.create_node("Loader", [0.0, 0.0]).unwrap();
        let b = service.create_node("Sampler", [300.0, 0.0]).unwrap();
        let link = service.connect(SlotRef::new(a, 0), SlotRef::new(b, 0)).unwrap();
        (service, a, b, link)
    }

    #[test]
    fn test_unknown_node_type() {
        let mut service = GraphMutationService::new(registry());
        let err = service.create_node("Nope", [0.0, 0.0]).unwrap_err();
        assert_eq!(err.kind, MutationErrorKind::UnknownNodeType);
        assert_eq!(err.operation, "create_node");
        assert!(!service.history().can_undo());
    }

    #[test]
    fn test_failed_mutation_leaves_graph_and_events_untouched() {
        let (mut service, a, _, _) = service_with_link();
        let mask = service.create_node("Mask", [0.0, 200.0]).unwrap();
        let seen = Rc::new(RefCell::new(0));
        let sink = seen.clone();
        service.events().subscribe(move |_| *sink.borrow_mut() += 1);

        let before = service.document();
        let err = service.connect(SlotRef::new(a, 0), SlotRef::new(mask, 0)).unwrap_err();
        assert_eq!(err.kind, MutationErrorKind::IncompatibleTypes);
        assert_eq!(service.document(), before);
        assert_eq!(*seen.borrow(), 0);
    }

    #[test]
    fn test_undo_redo() {
        let (mut service, a, _, link) = service_with_link();
        service.disconnect_link(link).unwrap();
        assert_eq!(service.graph().root().link_count(), 0);

        service.undo().unwrap();
        assert!(service.graph().root().link(link).is_some());
        service.redo().unwrap();
        assert!(service.graph().root().link(link).is_none());

        service.undo().unwrap();
        service.undo().unwrap();
        service.undo().unwrap();
        service.undo().unwrap();
        assert_eq!(
            service.undo().unwrap_err().kind,
            MutationErrorKind::NothingToUndo
        );
        assert!(service.graph().root().node(a).is_none());
    }

    #[test]
    fn test_events_are_delivered_after_commit() {
        let mut service = GraphMutationService::new(registry());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        service.events().subscribe(move |e| sink.borrow_mut().push(e.clone()));

        let id = service.create_node("Loader", [0.0, 0.0]).unwrap();
        assert_eq!(
            *seen.borrow(),
            vec![GraphEvent::NodeAdded {
                scope: GraphScope::Root,
                node_id: id
            }]
        );
    }

    #[test]
    fn test_bypass_and_title() {
        let (mut service, a, _, _) = service_with_link();
        service.bypass_node(a).unwrap();
        assert!(service.graph().root().node(a).unwrap().is_bypassed());
        service.unbypass_node(a).unwrap();
        assert_eq!(service.graph().root().node(a).unwrap().mode(), NodeMode::Always);
        service.update_node_title(a, "Checkpoint").unwrap();
        assert_eq!(service.graph().root().node(a).unwrap().title(), "Checkpoint");
    }

    #[test]
    fn test_clone_node_is_unlinked() {
        let (mut service, _, b, _) = service_with_link();
        let copy = service.clone_node(b).unwrap();
        let node = service.graph().root().node(copy).unwrap();
        assert_eq!(node.inputs()[0].link, None);
        assert_eq!(node.pos(), [305.0, 5.0]);
    }

    #[test]
    fn test_copy_paste_reconnects_internal_links() {
        let (mut service, a, b, _) = service_with_link();
        assert_eq!(service.copy_nodes(&[a, b]).unwrap(), 2);
        assert_eq!(service.history().undo_depth(), 3);

        let pasted = service.paste_nodes(Some([1000.0, 0.0])).unwrap();
        assert_eq!(pasted.len(), 2);
        let root = service.graph().root();
        assert_eq!(root.link_count(), 2);
        assert_eq!(root.node(pasted[0]).unwrap().pos(), [1000.0, 0.0]);
        assert!(root.links().any(|l| l.origin_id == pasted[0] && l.target_id == pasted[1]));
    }

    #[test]
    fn test_paste_requires_clipboard() {
        let mut service = GraphMutationService::new(registry());
        assert_eq!(
            service.paste_nodes(None).unwrap_err().kind,
            MutationErrorKind::ClipboardEmpty
        );
    }

    #[test]
    fn test_cut_is_one_history_entry() {
        let (mut service, a, b, _) = service_with_link();
        let depth = service.history().undo_depth();
        service.cut_nodes(&[a, b]).unwrap();
        assert_eq!(service.graph().root().node_count(), 0);
        assert_eq!(service.history().undo_depth(), depth + 1);
        service.undo().unwrap();
        assert_eq!(service.graph().root().node_count(), 2);
    }

    #[test]
    fn test_cut_ignores_repeated_ids() {
        let (mut service, a, b, _) = service_with_link();
        assert_eq!(service.cut_nodes(&[a, b, a]).unwrap(), 2);
        assert_eq!(service.graph().root().node_count(), 0);

        let pasted = service.paste_nodes(None).unwrap();
        assert_eq!(pasted.len(), 2);
        assert_eq!(service.graph().root().link_count(), 1);
    }

    #[test]
    fn test_invariant_check_always_runs() {
        let (mut service, a, _, _) = service_with_link();
        let before = service.document();
        let err = service
            .mutate("corrupt", |graph, _| {
                graph.root_mut().node_mut(a)?.outputs[0].links.push(LinkId(42));
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.kind, MutationErrorKind::ValidationFailed);
        assert_eq!(err.operation, "corrupt");
        assert_eq!(service.document(), before);
    }

    #[test]
    fn test_hooks_of_a_failed_paste_never_run() {
        let added = Rc::new(RefCell::new(0));
        let counter = added.clone();
        let mut registry = registry();
        registry.register(
            NodeKind::new("Hooked")
                .with_output(SlotSpec::new("MODEL", "MODEL"))
                .with_hooks(NodeHooks {
                    on_added: Some(Rc::new(move |_: &Node| *counter.borrow_mut() += 1)),
                    ..NodeHooks::default()
                }),
        );
        let mut service = GraphMutationService::new(registry);

        let hooked = service.create_node("Hooked", [0.0, 0.0]).unwrap();
        assert_eq!(*added.borrow(), 1);
        let sampler = service.create_node("Sampler", [300.0, 0.0]).unwrap();
        let (_, instance) = service.create_subgraph(&[sampler]).unwrap();

        service.copy_nodes(&[hooked, instance]).unwrap();
        service.clear_graph().unwrap();
        *added.borrow_mut() = 0;

        let err = service.paste_nodes(None).unwrap_err();
        assert_eq!(err.kind, MutationErrorKind::UnknownNodeType);
        assert_eq!(*added.borrow(), 0);
        assert!(service.graph().root().is_empty());
    }

    #[test]
    fn test_clear_keeps_counters() {
        let (mut service, _, _, _) = service_with_link();
        service.clear_graph().unwrap();
        assert!(service.graph().root().is_empty());
        let next = service.create_node("Loader", [0.0, 0.0]).unwrap();
        assert_eq!(next, NodeId(3));
    }

    #[test]
    fn test_apply_operation_dispatch() {
        let mut service = GraphMutationService::new(registry());
        let out = service
            .apply_operation(GraphMutationOperation::CreateNode {
                node_type: "Loader".into(),
                pos: [0.0, 0.0],
            })
            .unwrap();
        assert_eq!(out, OperationOutput::Node(NodeId(1)));
        let err = service
            .apply_operation(GraphMutationOperation::RemoveNode { node_id: NodeId(9) })
            .unwrap_err();
        assert_eq!(err.kind, MutationErrorKind::NodeNotFound);
        assert_eq!(err.operation, "remove_node");
    }

    #[test]
    fn test_scope_follows_subgraph() {
        let (mut service, _, b, _) = service_with_link();
        let (subgraph_id, _) = service.create_subgraph(&[b]).unwrap();
        service.enter_subgraph(subgraph_id).unwrap();
        let inner = service.create_node("Loader", [0.0, 0.0]).unwrap();
        assert!(service.graph().subgraph(subgraph_id).unwrap().body().node(inner).is_some());

        service.clear_graph().unwrap();
        assert_eq!(service.scope(), GraphScope::Root);
    }
}
