// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph data structure containing nodes, links, groups and reroutes.
//!
//! A [`Graph`] is the root of a document. It owns the root [`GraphBody`]
//! and every subgraph definition; nested bodies share the root's id
//! counters, so identifiers are unique across the whole document and are
//! never handed out twice.
//!
//! Structural edits on one body go through a [`ScopeMut`], obtained with
//! [`Graph::scope_mut`]. It borrows the body, the enclosing subgraph's
//! boundary (if any), the shared counters and the event bus at once.

use crate::events::{EventBus, GraphEvent};
use crate::group::{Group, GroupId};
use crate::link::{BoundarySlotRef, Link, LinkEndpoint, LinkId, ResolvedConnection, SlotRef};
use crate::node::{ConnectionChange, Node, NodeId, SUBGRAPH_INPUT_ID, SUBGRAPH_OUTPUT_ID};
use crate::reroute::{Reroute, RerouteId};
use crate::slot::{is_compatible, SlotDirection, SlotType};
use crate::subgraph::{Subgraph, SubgraphId, SubgraphIo};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use tracing::warn;
use uuid::Uuid;

/// Id counters of a root graph
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphState {
    /// Last node id handed out
    pub last_node_id: i64,
    /// Last link id handed out
    pub last_link_id: u32,
    /// Last group id handed out
    pub last_group_id: u32,
    /// Last reroute id handed out
    pub last_reroute_id: u32,
}

impl GraphState {
    pub(crate) fn next_node_id(&mut self) -> NodeId {
        self.last_node_id += 1;
        NodeId(self.last_node_id)
    }

    pub(crate) fn next_link_id(&mut self) -> LinkId {
        self.last_link_id += 1;
        LinkId(self.last_link_id)
    }

    pub(crate) fn next_group_id(&mut self) -> GroupId {
        self.last_group_id += 1;
        GroupId(self.last_group_id)
    }

    pub(crate) fn next_reroute_id(&mut self) -> RerouteId {
        self.last_reroute_id += 1;
        RerouteId(self.last_reroute_id)
    }

    /// Raise every counter to at least the largest id found in `body`
    pub(crate) fn raise_to(&mut self, body: &GraphBody) {
        for id in body.nodes.keys() {
            self.last_node_id = self.last_node_id.max(id.0);
        }
        for id in body.links.keys() {
            self.last_link_id = self.last_link_id.max(id.0);
        }
        for id in body.groups.keys() {
            self.last_group_id = self.last_group_id.max(id.0);
        }
        for id in body.reroutes.keys() {
            self.last_reroute_id = self.last_reroute_id.max(id.0);
        }
    }
}

/// Addresses one body of a graph
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GraphScope {
    /// The root graph
    #[default]
    Root,
    /// The body of a subgraph definition
    Subgraph(SubgraphId),
}

/// Nodes, links, groups and reroutes of one graph level
#[derive(Debug, Clone, Default)]
pub struct GraphBody {
    pub(crate) nodes: IndexMap<NodeId, Node>,
    pub(crate) links: IndexMap<LinkId, Link>,
    pub(crate) groups: IndexMap<GroupId, Group>,
    pub(crate) reroutes: IndexMap<RerouteId, Reroute>,
}

impl GraphBody {
    /// Get a node by ID
    pub fn node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    /// Get all nodes, in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Get all node IDs
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Get the number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get a link by ID
    pub fn link(&self, link_id: LinkId) -> Option<&Link> {
        self.links.get(&link_id)
    }

    /// Get all links
    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    /// Get links involving a node
    pub fn links_for_node(&self, node_id: NodeId) -> impl Iterator<Item = &Link> {
        self.links.values().filter(move |l| l.involves_node(node_id))
    }

    /// Get the number of links
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Get a group by ID
    pub fn group(&self, group_id: GroupId) -> Option<&Group> {
        self.groups.get(&group_id)
    }

    /// Get all groups
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Get a reroute by ID
    pub fn reroute(&self, reroute_id: RerouteId) -> Option<&Reroute> {
        self.reroutes.get(&reroute_id)
    }

    /// Get all reroutes
    pub fn reroutes(&self) -> impl Iterator<Item = &Reroute> {
        self.reroutes.values()
    }

    /// Check if the body is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.links.is_empty() && self.groups.is_empty() && self.reroutes.is_empty()
    }

    /// Rebuild every slot's link list from the link table
    pub(crate) fn relink(&mut self, mut io: Option<BoundaryIo<'_>>) -> Result<(), GraphError> {
        for node in self.nodes.values_mut() {
            for input in &mut node.inputs {
                input.link = None;
            }
            for output in &mut node.outputs {
                output.links.clear();
            }
        }
        if let Some(io) = io.as_mut() {
            for slot in io.inputs.iter_mut().chain(io.outputs.iter_mut()) {
                slot.link_ids.clear();
            }
        }

        let GraphBody { nodes, links, .. } = self;
        for link in links.values() {
            attach(nodes, io.as_mut(), link)?;
        }
        Ok(())
    }
}

/// Mutable view of a subgraph's boundary lists
#[derive(Debug)]
pub struct BoundaryIo<'a> {
    /// Boundary inputs
    pub inputs: &'a mut Vec<SubgraphIo>,
    /// Boundary outputs
    pub outputs: &'a mut Vec<SubgraphIo>,
}

fn attach(nodes: &mut IndexMap<NodeId, Node>, io: Option<&mut BoundaryIo<'_>>, link: &Link) -> Result<(), GraphError> {
    let dangling = || GraphError::Invariant(format!("link {} has a dangling endpoint", link.id));
    let mut io = io;

    if link.origin_is_boundary() {
        let io = io.as_mut().ok_or_else(dangling)?;
        io.inputs.get_mut(link.origin_slot).ok_or_else(dangling)?.link_ids.push(link.id);
    } else {
        let node = nodes.get_mut(&link.origin_id).ok_or_else(dangling)?;
        node.outputs.get_mut(link.origin_slot).ok_or_else(dangling)?.links.push(link.id);
    }

    if link.target_is_boundary() {
        let io = io.as_mut().ok_or_else(dangling)?;
        let slot = io.outputs.get_mut(link.target_slot).ok_or_else(dangling)?;
        if !slot.link_ids.is_empty() {
            return Err(GraphError::Invariant(format!(
                "boundary output {} has more than one link",
                link.target_slot
            )));
        }
        slot.link_ids.push(link.id);
    } else {
        let node = nodes.get_mut(&link.target_id).ok_or_else(dangling)?;
        let slot = node.inputs.get_mut(link.target_slot).ok_or_else(dangling)?;
        if slot.link.is_some() {
            return Err(GraphError::Invariant(format!(
                "input {} of node {} has more than one link",
                link.target_slot, link.target_id
            )));
        }
        slot.link = Some(link.id);
    }
    Ok(())
}

/// Read-only view of one body and its boundary
#[derive(Debug, Clone, Copy)]
pub struct ScopeRef<'a> {
    scope: GraphScope,
    body: &'a GraphBody,
    inputs: Option<&'a [SubgraphIo]>,
    outputs: Option<&'a [SubgraphIo]>,
}

impl<'a> ScopeRef<'a> {
    /// Scope this view addresses
    pub fn scope(&self) -> GraphScope {
        self.scope
    }

    /// The body
    pub fn body(&self) -> &'a GraphBody {
        self.body
    }

    /// Type of an output slot (or a boundary input)
    pub fn output_type(&self, slot: SlotRef) -> Result<&'a SlotType, GraphError> {
        let missing = GraphError::SlotNotFound {
            node_id: slot.node_id,
            direction: SlotDirection::Output,
            slot: slot.slot,
        };
        if slot.node_id == SUBGRAPH_INPUT_ID {
            return self
                .inputs
                .and_then(|io| io.get(slot.slot))
                .map(|io| &io.slot_type)
                .ok_or(missing);
        }
        self.body
            .nodes
            .get(&slot.node_id)
            .and_then(|n| n.outputs.get(slot.slot))
            .map(|s| &s.slot_type)
            .ok_or(missing)
    }

    /// Type of an input slot (or a boundary output)
    pub fn input_type(&self, slot: SlotRef) -> Result<&'a SlotType, GraphError> {
        let missing = GraphError::SlotNotFound {
            node_id: slot.node_id,
            direction: SlotDirection::Input,
            slot: slot.slot,
        };
        if slot.node_id == SUBGRAPH_OUTPUT_ID {
            return self
                .outputs
                .and_then(|io| io.get(slot.slot))
                .map(|io| &io.slot_type)
                .ok_or(missing);
        }
        self.body
            .nodes
            .get(&slot.node_id)
            .and_then(|n| n.inputs.get(slot.slot))
            .map(|s| &s.slot_type)
            .ok_or(missing)
    }

    /// Link currently attached to an input (or a boundary output)
    pub fn input_link(&self, slot: SlotRef) -> Option<LinkId> {
        if slot.node_id == SUBGRAPH_OUTPUT_ID {
            return self
                .outputs
                .and_then(|io| io.get(slot.slot))
                .and_then(|io| io.link_ids.first().copied());
        }
        self.body.nodes.get(&slot.node_id)?.inputs.get(slot.slot)?.link
    }

    /// Links leaving an output (or a boundary input)
    pub fn output_links(&self, slot: SlotRef) -> &'a [LinkId] {
        let links = if slot.node_id == SUBGRAPH_INPUT_ID {
            self.inputs
                .and_then(|io| io.get(slot.slot))
                .map(|io| io.link_ids.as_slice())
        } else {
            self.body
                .nodes
                .get(&slot.node_id)
                .and_then(|n| n.outputs.get(slot.slot))
                .map(|s| s.links.as_slice())
        };
        links.unwrap_or_default()
    }

    /// Whether an endpoint slot has a dynamic type
    fn is_dynamic(&self, slot: SlotRef, direction: SlotDirection) -> bool {
        let Some(node) = self.body.nodes.get(&slot.node_id) else {
            return false;
        };
        match direction {
            SlotDirection::Input => node.inputs.get(slot.slot).is_some_and(|s| s.dynamic),
            SlotDirection::Output => node.outputs.get(slot.slot).is_some_and(|s| s.dynamic),
        }
    }

    /// Reroutes starting at `parent` and walking towards the output side.
    ///
    /// Stops at the first repeated reroute, so a corrupt cycle cannot hang.
    pub fn reroute_chain(&self, parent: Option<RerouteId>) -> Vec<RerouteId> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = parent;
        while let Some(id) = next {
            if !seen.insert(id) {
                break;
            }
            let Some(reroute) = self.body.reroutes.get(&id) else {
                break;
            };
            chain.push(id);
            next = reroute.parent_id;
        }
        chain
    }

    /// Resolve a link's endpoints
    pub fn resolve(&self, link_id: LinkId) -> Result<ResolvedConnection, GraphError> {
        let link = self.body.links.get(&link_id).ok_or(GraphError::LinkNotFound(link_id))?;
        let origin_type = self.output_type(SlotRef::new(link.origin_id, link.origin_slot))?.clone();
        let target_type = self.input_type(SlotRef::new(link.target_id, link.target_slot))?.clone();

        let boundary = |node_id: NodeId, index: usize| {
            self.body
                .nodes
                .get(&node_id)
                .and_then(|n| n.subgraph)
                .map(|subgraph_id| BoundarySlotRef { subgraph_id, index })
        };

        Ok(ResolvedConnection {
            origin: link.origin(),
            target: link.target(),
            origin_type,
            target_type,
            subgraph_input: match link.target() {
                LinkEndpoint::Node { node_id, slot } => boundary(node_id, slot),
                _ => None,
            },
            subgraph_output: match link.origin() {
                LinkEndpoint::Node { node_id, slot } => boundary(node_id, slot),
                _ => None,
            },
            reroutes: self.reroute_chain(link.parent_id),
            link: link.clone(),
        })
    }

    /// Check every structural invariant of this body
    pub fn validate(&self, state: &GraphState) -> Result<(), GraphError> {
        let fail = |msg: String| -> Result<(), GraphError> { Err(GraphError::Invariant(msg)) };

        for (key, node) in &self.body.nodes {
            if *key != node.id || !node.id.is_assigned() {
                return fail(format!("node stored under {key} has id {}", node.id));
            }
            if node.id.0 > state.last_node_id {
                return fail(format!("node id {} is above the counter", node.id));
            }
            for (index, input) in node.inputs.iter().enumerate() {
                if let Some(link_id) = input.link {
                    match self.body.links.get(&link_id) {
                        Some(link) if link.target_id == node.id && link.target_slot == index => {}
                        _ => return fail(format!("input {index} of node {} holds stale link {link_id}", node.id)),
                    }
                }
            }
            for (index, output) in node.outputs.iter().enumerate() {
                let mut seen = HashSet::new();
                for link_id in &output.links {
                    if !seen.insert(*link_id) {
                        return fail(format!("output {index} of node {} lists link {link_id} twice", node.id));
                    }
                    match self.body.links.get(link_id) {
                        Some(link) if link.origin_id == node.id && link.origin_slot == index => {}
                        _ => return fail(format!("output {index} of node {} holds stale link {link_id}", node.id)),
                    }
                }
            }
        }

        for (key, link) in &self.body.links {
            if *key != link.id || link.id.0 > state.last_link_id {
                return fail(format!("link stored under {key} has id {}", link.id));
            }
            let origin = SlotRef::new(link.origin_id, link.origin_slot);
            let target = SlotRef::new(link.target_id, link.target_slot);
            let output_type = self.output_type(origin)?;
            let input_type = self.input_type(target)?;
            if !self.output_links(origin).contains(&link.id) {
                return fail(format!("link {} is missing from its origin slot", link.id));
            }
            if self.input_link(target) != Some(link.id) {
                return fail(format!("link {} is missing from its target slot", link.id));
            }
            if !is_compatible(output_type, input_type) {
                return fail(format!(
                    "link {} joins incompatible types {output_type} and {input_type}",
                    link.id
                ));
            }
            if let Some(parent) = link.parent_id {
                if !self.body.reroutes.contains_key(&parent) {
                    return fail(format!("link {} routes through missing reroute {parent}", link.id));
                }
            }
        }

        if let Some(inputs) = self.inputs {
            for (index, io) in inputs.iter().enumerate() {
                for link_id in &io.link_ids {
                    match self.body.links.get(link_id) {
                        Some(link) if link.origin_is_boundary() && link.origin_slot == index => {}
                        _ => return fail(format!("boundary input {index} holds stale link {link_id}")),
                    }
                }
            }
        }
        if let Some(outputs) = self.outputs {
            for (index, io) in outputs.iter().enumerate() {
                if io.link_ids.len() > 1 {
                    return fail(format!("boundary output {index} has more than one link"));
                }
                for link_id in &io.link_ids {
                    match self.body.links.get(link_id) {
                        Some(link) if link.target_is_boundary() && link.target_slot == index => {}
                        _ => return fail(format!("boundary output {index} holds stale link {link_id}")),
                    }
                }
            }
        }

        for (key, reroute) in &self.body.reroutes {
            if *key != reroute.id || reroute.id.0 > state.last_reroute_id {
                return fail(format!("reroute stored under {key} has id {}", reroute.id));
            }
            if let Some(parent) = reroute.parent_id {
                if !self.body.reroutes.contains_key(&parent) {
                    return fail(format!("reroute {} has missing parent {parent}", reroute.id));
                }
            }
            let chain = self.reroute_chain(Some(reroute.id));
            if let Some(last) = chain.last() {
                let tail = self.body.reroutes.get(last).and_then(|r| r.parent_id);
                if tail.is_some() {
                    return fail(format!("reroute chain of {} is cyclic", reroute.id));
                }
            }
        }

        for (key, group) in &self.body.groups {
            if *key != group.id || group.id.0 > state.last_group_id {
                return fail(format!("group stored under {key} has id {}", group.id));
            }
        }

        Ok(())
    }
}

/// Mutable handle on one body of a graph
#[derive(Debug)]
pub struct ScopeMut<'a> {
    pub(crate) scope: GraphScope,
    pub(crate) body: &'a mut GraphBody,
    pub(crate) io: Option<BoundaryIo<'a>>,
    pub(crate) state: &'a mut GraphState,
    pub(crate) events: &'a EventBus,
}

impl<'a> ScopeMut<'a> {
    /// Scope this handle addresses
    pub fn scope(&self) -> GraphScope {
        self.scope
    }

    /// Read-only view
    pub fn view(&self) -> ScopeRef<'_> {
        ScopeRef {
            scope: self.scope,
            body: self.body,
            inputs: self.io.as_ref().map(|io| io.inputs.as_slice()),
            outputs: self.io.as_ref().map(|io| io.outputs.as_slice()),
        }
    }

    /// The body
    pub fn body(&self) -> &GraphBody {
        self.body
    }

    /// Get a mutable node by ID
    pub fn node_mut(&mut self, node_id: NodeId) -> Result<&mut Node, GraphError> {
        self.body
            .nodes
            .get_mut(&node_id)
            .ok_or(GraphError::NodeNotFound(node_id))
    }

    /// Add a node to the graph.
    ///
    /// A node that carries an id not used in this body keeps it; otherwise
    /// a fresh id is allocated.
    pub fn add_node(&mut self, mut node: Node) -> NodeId {
        let id = if node.id.is_assigned() && !self.body.nodes.contains_key(&node.id) {
            self.state.last_node_id = self.state.last_node_id.max(node.id.0);
            node.id
        } else {
            self.state.next_node_id()
        };
        node.attach(id, self.events.clone());
        node.fire_added();
        self.body.nodes.insert(id, node);
        self.events.emit(GraphEvent::NodeAdded {
            scope: self.scope,
            node_id: id,
        });
        id
    }

    /// Remove a node and its links
    pub fn remove_node(&mut self, node_id: NodeId) -> Result<Node, GraphError> {
        let node = self.body.nodes.get(&node_id).ok_or(GraphError::NodeNotFound(node_id))?;
        let link_ids: Vec<LinkId> = node
            .inputs
            .iter()
            .filter_map(|s| s.link)
            .chain(node.outputs.iter().flat_map(|s| s.links.iter().copied()))
            .collect();

        for link_id in link_ids {
            if self.body.links.contains_key(&link_id) {
                self.remove_link(link_id)?;
            }
        }

        let node = self
            .body
            .nodes
            .shift_remove(&node_id)
            .ok_or(GraphError::NodeNotFound(node_id))?;
        for group in self.body.groups.values_mut() {
            group.members.remove(&node_id);
        }
        node.fire_removed();
        self.events.emit(GraphEvent::NodeRemoved {
            scope: self.scope,
            node_id,
        });
        Ok(node)
    }

    /// Link an output slot to an input slot.
    ///
    /// Boundary sentinels ([`SlotRef::subgraph_input`] and
    /// [`SlotRef::subgraph_output`]) are valid only inside a subgraph. An
    /// occupied input is taken over: its previous link is removed from both
    /// ends and a [`GraphEvent::LinkSuperseded`] is emitted.
    pub fn connect(&mut self, origin: SlotRef, target: SlotRef) -> Result<LinkId, GraphError> {
        let view = self.view();
        let origin_type = view.output_type(origin)?.clone();
        let target_type = view.input_type(target)?;
        if !is_compatible(&origin_type, target_type) {
            return Err(GraphError::IncompatibleTypes {
                output: origin_type,
                input: target_type.clone(),
            });
        }
        let previous = view.input_link(target);

        if let Some(old) = previous {
            warn!(link = %old, node = %target.node_id, slot = target.slot, "superseding link on occupied input");
            self.remove_link(old)?;
        }

        let id = self.state.next_link_id();
        let link = Link::new(id, origin.node_id, origin.slot, target.node_id, target.slot, origin_type);
        attach(&mut self.body.nodes, self.io.as_mut(), &link)?;
        self.body.links.insert(id, link.clone());

        self.events.emit(GraphEvent::LinkAdded {
            scope: self.scope,
            link_id: id,
        });
        if let Some(old_link) = previous {
            self.events.emit(GraphEvent::LinkSuperseded {
                scope: self.scope,
                target,
                old_link,
                new_link: id,
            });
        }
        self.notify_connection(&link, true);
        self.recompute_dynamic([origin.node_id, target.node_id]);
        Ok(id)
    }

    /// Remove a link from both of its endpoint slots and from its reroutes
    pub fn remove_link(&mut self, link_id: LinkId) -> Result<Link, GraphError> {
        let link = self.detach_link(link_id)?;
        self.events.emit(GraphEvent::LinkRemoved {
            scope: self.scope,
            link_id,
        });
        self.notify_connection(&link, false);
        self.recompute_dynamic([link.origin_id, link.target_id]);
        Ok(link)
    }

    /// Drop a link from the table, its slots and its reroutes. No events
    /// other than reroute removals.
    pub(crate) fn detach_link(&mut self, link_id: LinkId) -> Result<Link, GraphError> {
        let link = self
            .body
            .links
            .shift_remove(&link_id)
            .ok_or(GraphError::LinkNotFound(link_id))?;

        if link.origin_is_boundary() {
            if let Some(io) = self.io.as_mut().and_then(|io| io.inputs.get_mut(link.origin_slot)) {
                io.link_ids.retain(|l| *l != link_id);
            }
        } else if let Some(slot) = self
            .body
            .nodes
            .get_mut(&link.origin_id)
            .and_then(|n| n.outputs.get_mut(link.origin_slot))
        {
            slot.links.retain(|l| *l != link_id);
        }

        if link.target_is_boundary() {
            if let Some(io) = self.io.as_mut().and_then(|io| io.outputs.get_mut(link.target_slot)) {
                io.link_ids.retain(|l| *l != link_id);
            }
        } else if let Some(slot) = self
            .body
            .nodes
            .get_mut(&link.target_id)
            .and_then(|n| n.inputs.get_mut(link.target_slot))
        {
            if slot.link == Some(link_id) {
                slot.link = None;
            }
        }

        let chain = self.view().reroute_chain(link.parent_id);
        for reroute_id in chain {
            let emptied = match self.body.reroutes.get_mut(&reroute_id) {
                Some(reroute) => {
                    reroute.link_ids.remove(&link_id);
                    reroute.link_ids.is_empty()
                }
                None => false,
            };
            if emptied {
                self.splice_reroute(reroute_id)?;
            }
        }

        Ok(link)
    }

    /// Disconnect every link on one slot. Returns the removed link ids.
    pub fn disconnect_slot(&mut self, node_id: NodeId, direction: SlotDirection, slot: usize) -> Result<Vec<LinkId>, GraphError> {
        let node = self.body.nodes.get(&node_id).ok_or(GraphError::NodeNotFound(node_id))?;
        let missing = GraphError::SlotNotFound {
            node_id,
            direction,
            slot,
        };
        let link_ids: Vec<LinkId> = match direction {
            SlotDirection::Input => node.inputs.get(slot).ok_or(missing)?.link.into_iter().collect(),
            SlotDirection::Output => node.outputs.get(slot).ok_or(missing)?.links.clone(),
        };
        for link_id in &link_ids {
            self.remove_link(*link_id)?;
        }
        Ok(link_ids)
    }

    /// Change a slot's declared type.
    ///
    /// Links that no longer type-check are disconnected. Links to dynamic
    /// peers are handed to the peer's type recompute instead. Returns the
    /// links removed.
    pub fn set_slot_type(
        &mut self,
        node_id: NodeId,
        direction: SlotDirection,
        slot: usize,
        slot_type: SlotType,
    ) -> Result<Vec<LinkId>, GraphError> {
        let node = self.node_mut(node_id)?;
        if node.is_subgraph_node() {
            return Err(GraphError::Invariant(format!(
                "slot types of subgraph node {node_id} follow the subgraph boundary"
            )));
        }
        let missing = GraphError::SlotNotFound {
            node_id,
            direction,
            slot,
        };
        let link_ids: Vec<LinkId> = match direction {
            SlotDirection::Input => {
                let input = node.inputs.get_mut(slot).ok_or(missing)?;
                input.slot_type = slot_type.clone();
                input.link.into_iter().collect()
            }
            SlotDirection::Output => {
                let output = node.outputs.get_mut(slot).ok_or(missing)?;
                output.slot_type = slot_type.clone();
                output.links.clone()
            }
        };

        let mut removed = Vec::new();
        let mut recompute = Vec::new();
        for link_id in link_ids {
            let Some(link) = self.body.links.get_mut(&link_id) else {
                continue;
            };
            let (peer, peer_direction) = match direction {
                SlotDirection::Input => (SlotRef::new(link.origin_id, link.origin_slot), SlotDirection::Output),
                SlotDirection::Output => {
                    link.link_type = slot_type.clone();
                    (SlotRef::new(link.target_id, link.target_slot), SlotDirection::Input)
                }
            };

            let view = self.view();
            if view.is_dynamic(peer, peer_direction) {
                recompute.push(peer.node_id);
                continue;
            }
            let compatible = match direction {
                SlotDirection::Input => is_compatible(view.output_type(peer)?, &slot_type),
                SlotDirection::Output => is_compatible(&slot_type, view.input_type(peer)?),
            };
            if !compatible {
                warn!(link = %link_id, node = %node_id, "disconnecting link invalidated by slot type change");
                self.remove_link(link_id)?;
                removed.push(link_id);
            }
        }

        self.recompute_dynamic(recompute);
        Ok(removed)
    }

    /// Recompute the effective type of dynamic slots, starting at `nodes`
    /// and spreading to dynamic peers whose inputs changed.
    pub(crate) fn recompute_dynamic(&mut self, nodes: impl IntoIterator<Item = NodeId>) {
        let mut worklist: VecDeque<NodeId> = nodes.into_iter().filter(NodeId::is_assigned).collect();
        let mut visited = HashSet::new();

        while let Some(node_id) = worklist.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }
            let Some(node) = self.body.nodes.get(&node_id) else {
                continue;
            };
            if !node.has_dynamic_slots() {
                continue;
            }

            // (link, peer type, peer node) for every link on a dynamic slot
            let view = self.view();
            let mut entries: Vec<(LinkId, SlotType, NodeId)> = Vec::new();
            for input in node.inputs.iter().filter(|s| s.dynamic) {
                let Some(link) = input.link.and_then(|l| self.body.links.get(&l)) else {
                    continue;
                };
                if let Ok(ty) = view.output_type(SlotRef::new(link.origin_id, link.origin_slot)) {
                    entries.push((link.id, ty.clone(), link.origin_id));
                }
            }
            for output in node.outputs.iter().filter(|s| s.dynamic) {
                for link in output.links.iter().filter_map(|l| self.body.links.get(l)) {
                    if let Ok(ty) = view.input_type(SlotRef::new(link.target_id, link.target_slot)) {
                        entries.push((link.id, ty.clone(), link.target_id));
                    }
                }
            }
            entries.sort_by_key(|(link_id, _, _)| *link_id);

            let mut effective = SlotType::wildcard();
            let mut revoked = Vec::new();
            for (link_id, peer_type, peer) in &entries {
                if *peer == node_id || peer_type.is_wildcard() {
                    continue;
                }
                match effective.intersect(peer_type) {
                    Some(narrowed) => effective = narrowed,
                    None => revoked.push((*link_id, *peer)),
                }
            }

            for (link_id, peer) in revoked {
                warn!(link = %link_id, node = %node_id, "revoking link that conflicts with dynamic type");
                if let Ok(link) = self.detach_link(link_id) {
                    self.events.emit(GraphEvent::LinkRemoved {
                        scope: self.scope,
                        link_id,
                    });
                    self.notify_connection(&link, false);
                    worklist.push_back(peer);
                }
            }

            let Some(node) = self.body.nodes.get_mut(&node_id) else {
                continue;
            };
            let mut changed = false;
            for input in node.inputs.iter_mut().filter(|s| s.dynamic) {
                if input.slot_type != effective {
                    input.slot_type = effective.clone();
                    changed = true;
                }
            }
            let mut outgoing = Vec::new();
            for output in node.outputs.iter_mut().filter(|s| s.dynamic) {
                if output.slot_type != effective {
                    output.slot_type = effective.clone();
                    changed = true;
                }
                outgoing.extend(output.links.iter().copied());
            }
            for link_id in outgoing {
                if let Some(link) = self.body.links.get_mut(&link_id) {
                    link.link_type = effective.clone();
                }
            }

            if changed {
                let peers: Vec<NodeId> = entries
                    .iter()
                    .map(|(_, _, peer)| *peer)
                    .filter(|peer| *peer != node_id && peer.is_assigned())
                    .collect();
                worklist.extend(peers);
            }
        }
    }

    /// Remove an input slot, disconnecting it and shifting later indices
    pub(crate) fn remove_node_input(&mut self, node_id: NodeId, index: usize) -> Result<(), GraphError> {
        self.disconnect_slot(node_id, SlotDirection::Input, index)?;
        let node = self.node_mut(node_id)?;
        node.inputs.remove(index);
        for link in self.body.links.values_mut() {
            if link.target_id == node_id && link.target_slot > index {
                link.target_slot -= 1;
            }
        }
        Ok(())
    }

    /// Remove an output slot, disconnecting it and shifting later indices
    pub(crate) fn remove_node_output(&mut self, node_id: NodeId, index: usize) -> Result<(), GraphError> {
        self.disconnect_slot(node_id, SlotDirection::Output, index)?;
        let node = self.node_mut(node_id)?;
        node.outputs.remove(index);
        for link in self.body.links.values_mut() {
            if link.origin_id == node_id && link.origin_slot > index {
                link.origin_slot -= 1;
            }
        }
        Ok(())
    }

    fn notify_connection(&self, link: &Link, connected: bool) {
        if let Some(node) = self.body.nodes.get(&link.origin_id) {
            node.fire_connection_change(ConnectionChange {
                direction: SlotDirection::Output,
                slot: link.origin_slot,
                connected,
                link_id: link.id,
            });
        }
        if let Some(node) = self.body.nodes.get(&link.target_id) {
            node.fire_connection_change(ConnectionChange {
                direction: SlotDirection::Input,
                slot: link.target_slot,
                connected,
                link_id: link.id,
            });
        }
    }
}

/// A node graph document: the root body plus subgraph definitions
#[derive(Debug, Clone)]
pub struct Graph {
    pub(crate) id: Uuid,
    pub(crate) revision: u64,
    pub(crate) state: GraphState,
    pub(crate) root: GraphBody,
    pub(crate) subgraphs: IndexMap<SubgraphId, Subgraph>,
    pub(crate) config: Map<String, Value>,
    pub(crate) extra: Map<String, Value>,
    pub(crate) events: EventBus,
}

impl Graph {
    /// Create a new empty graph
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            revision: 0,
            state: GraphState::default(),
            root: GraphBody::default(),
            subgraphs: IndexMap::new(),
            config: Map::new(),
            extra: Map::new(),
            events: EventBus::new(),
        }
    }

    /// Document id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Revision counter, bumped by every recorded mutation
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Id counters
    pub fn state(&self) -> &GraphState {
        &self.state
    }

    /// Event bus observers subscribe to
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The root body
    pub fn root(&self) -> &GraphBody {
        &self.root
    }

    /// Free-form document extras
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    /// Free-form document config
    pub fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    /// Get a subgraph definition
    pub fn subgraph(&self, subgraph_id: SubgraphId) -> Option<&Subgraph> {
        self.subgraphs.get(&subgraph_id)
    }

    /// All subgraph definitions
    pub fn subgraphs(&self) -> impl Iterator<Item = &Subgraph> {
        self.subgraphs.values()
    }

    /// Root plus every subgraph body
    pub fn scopes(&self) -> Vec<GraphScope> {
        std::iter::once(GraphScope::Root)
            .chain(self.subgraphs.keys().map(|id| GraphScope::Subgraph(*id)))
            .collect()
    }

    /// Get the body a scope addresses
    pub fn body(&self, scope: GraphScope) -> Result<&GraphBody, GraphError> {
        Ok(self.scope(scope)?.body)
    }

    /// Read-only view of a scope
    pub fn scope(&self, scope: GraphScope) -> Result<ScopeRef<'_>, GraphError> {
        match scope {
            GraphScope::Root => Ok(ScopeRef {
                scope,
                body: &self.root,
                inputs: None,
                outputs: None,
            }),
            GraphScope::Subgraph(id) => {
                let sg = self.subgraphs.get(&id).ok_or(GraphError::SubgraphNotFound(id))?;
                Ok(ScopeRef {
                    scope,
                    body: &sg.body,
                    inputs: Some(sg.inputs.as_slice()),
                    outputs: Some(sg.outputs.as_slice()),
                })
            }
        }
    }

    /// Mutable handle on a scope
    pub fn scope_mut(&mut self, scope: GraphScope) -> Result<ScopeMut<'_>, GraphError> {
        match scope {
            GraphScope::Root => Ok(self.root_mut()),
            GraphScope::Subgraph(id) => {
                let sg = self.subgraphs.get_mut(&id).ok_or(GraphError::SubgraphNotFound(id))?;
                Ok(ScopeMut {
                    scope,
                    body: &mut sg.body,
                    io: Some(BoundaryIo {
                        inputs: &mut sg.inputs,
                        outputs: &mut sg.outputs,
                    }),
                    state: &mut self.state,
                    events: &self.events,
                })
            }
        }
    }

    /// Mutable handle on the root body
    pub fn root_mut(&mut self) -> ScopeMut<'_> {
        ScopeMut {
            scope: GraphScope::Root,
            body: &mut self.root,
            io: None,
            state: &mut self.state,
            events: &self.events,
        }
    }

    /// Remove every node, link, group, reroute and subgraph definition.
    ///
    /// Id counters are kept, so ids are not reused after a clear.
    pub fn clear(&mut self) {
        self.root = GraphBody::default();
        self.subgraphs.clear();
        self.events.emit(GraphEvent::Cleared);
    }

    /// Check every invariant of the document
    pub fn validate(&self) -> Result<(), GraphError> {
        for scope in self.scopes() {
            let view = self.scope(scope)?;
            view.validate(&self.state)?;

            for node in view.body.nodes.values() {
                let Some(subgraph_id) = node.subgraph else {
                    continue;
                };
                let sg = self
                    .subgraphs
                    .get(&subgraph_id)
                    .ok_or(GraphError::SubgraphNotFound(subgraph_id))?;
                let inputs_match = node.inputs.len() == sg.inputs.len()
                    && node
                        .inputs
                        .iter()
                        .zip(&sg.inputs)
                        .all(|(slot, io)| slot.name == io.name && slot.slot_type == io.slot_type);
                let outputs_match = node.outputs.len() == sg.outputs.len()
                    && node
                        .outputs
                        .iter()
                        .zip(&sg.outputs)
                        .all(|(slot, io)| slot.name == io.name && slot.slot_type == io.slot_type);
                if !inputs_match || !outputs_match {
                    return Err(GraphError::Invariant(format!(
                        "subgraph node {} does not mirror the boundary of {subgraph_id}",
                        node.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn attach_events(&mut self, events: EventBus) {
        for node in self.root.nodes.values_mut() {
            node.events = Some(events.clone());
        }
        for sg in self.subgraphs.values_mut() {
            for node in sg.body.nodes.values_mut() {
                node.events = Some(events.clone());
            }
        }
        self.events = events;
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

/// Error from a structural graph operation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    /// Node not found
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Slot (or its node) not found
    #[error("Slot not found: {direction} {slot} of node {node_id}")]
    SlotNotFound {
        /// Node referenced
        node_id: NodeId,
        /// Side of the node
        direction: SlotDirection,
        /// Slot index
        slot: usize,
    },

    /// Slot types do not match
    #[error("Incompatible types: {output} cannot feed {input}")]
    IncompatibleTypes {
        /// Output slot type
        output: SlotType,
        /// Input slot type
        input: SlotType,
    },

    /// Link not found
    #[error("Link not found: {0}")]
    LinkNotFound(LinkId),

    /// Group not found
    #[error("Group not found: {0}")]
    GroupNotFound(GroupId),

    /// Reroute not found
    #[error("Reroute not found: {0}")]
    RerouteNotFound(RerouteId),

    /// Subgraph definition not found
    #[error("Subgraph not found: {0}")]
    SubgraphNotFound(SubgraphId),

    /// Node does not instantiate a subgraph
    #[error("Node {0} is not a subgraph node")]
    NotASubgraphNode(NodeId),

    /// No nodes were selected
    #[error("Selection is empty")]
    EmptySelection,

    /// Node type is not registered
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    /// A structural invariant does not hold
    #[error("Invariant violated: {0}")]
    Invariant(String),
}
