// SPDX-License-Identifier: MIT OR Apache-2.0
//! Subgraph definitions and composition.
//!
//! A subgraph is a graph body with an ordered boundary of named, typed
//! inputs and outputs. Inside the body, links reach the boundary through
//! the sentinel node ids [`SUBGRAPH_INPUT_ID`] and [`SUBGRAPH_OUTPUT_ID`].
//! Outside, a subgraph node (any node whose `subgraph` is set) stands for
//! the definition, with slots that mirror the boundary one to one.
//!
//! Definitions may be instantiated any number of times and may nest each
//! other, including themselves, so every recursive walk here carries a
//! visited set keyed by [`SubgraphId`].

use crate::events::GraphEvent;
use crate::graph::{BoundaryIo, Graph, GraphBody, GraphError, GraphScope, ScopeMut};
use crate::link::{Link, LinkId, SlotRef};
use crate::measure::Rect;
use crate::node::{Node, NodeId, SUBGRAPH_INPUT_ID, SUBGRAPH_OUTPUT_ID};
use crate::reroute::RerouteId;
use crate::slot::{InputSlot, OutputSlot, SlotDirection, SlotType};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

/// Default name of a subgraph extracted from a selection
pub const DEFAULT_SUBGRAPH_NAME: &str = "New Subgraph";

/// Unique identifier for a subgraph definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubgraphId(pub Uuid);

impl SubgraphId {
    /// Create a new random subgraph ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubgraphId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubgraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SubgraphId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// One boundary input or output of a subgraph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgraphIo {
    /// Stable id of the boundary slot
    pub id: Uuid,
    /// Name, unique within its list
    pub name: String,
    /// Type
    #[serde(rename = "type")]
    pub slot_type: SlotType,
    /// Display label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Links attached inside the subgraph
    #[serde(rename = "linkIds", default)]
    pub link_ids: Vec<LinkId>,
}

impl SubgraphIo {
    /// Create an unconnected boundary slot
    pub fn new(name: impl Into<String>, slot_type: impl Into<SlotType>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            slot_type: slot_type.into(),
            label: None,
            link_ids: Vec::new(),
        }
    }
}

/// Position of a boundary proxy inside the subgraph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoNodeLayout {
    /// Sentinel id of the proxy
    pub id: NodeId,
    /// Area of the proxy
    pub bounding: Rect,
}

/// A subgraph definition
#[derive(Debug, Clone)]
pub struct Subgraph {
    /// Definition id
    pub id: SubgraphId,
    /// Name, used as the default title of instances
    pub name: String,
    pub(crate) inputs: Vec<SubgraphIo>,
    pub(crate) outputs: Vec<SubgraphIo>,
    pub(crate) input_node: IoNodeLayout,
    pub(crate) output_node: IoNodeLayout,
    pub(crate) body: GraphBody,
}

impl Subgraph {
    /// Create an empty subgraph with no boundary
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: SubgraphId::new(),
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            input_node: IoNodeLayout {
                id: SUBGRAPH_INPUT_ID,
                bounding: Rect::new(-200.0, 0.0, 75.0, 100.0),
            },
            output_node: IoNodeLayout {
                id: SUBGRAPH_OUTPUT_ID,
                bounding: Rect::new(200.0, 0.0, 75.0, 100.0),
            },
            body: GraphBody::default(),
        }
    }

    /// Boundary inputs
    pub fn inputs(&self) -> &[SubgraphIo] {
        &self.inputs
    }

    /// Boundary outputs
    pub fn outputs(&self) -> &[SubgraphIo] {
        &self.outputs
    }

    /// Layout of the boundary input proxy
    pub fn input_node(&self) -> &IoNodeLayout {
        &self.input_node
    }

    /// Layout of the boundary output proxy
    pub fn output_node(&self) -> &IoNodeLayout {
        &self.output_node
    }

    /// Nodes, links, groups and reroutes inside the subgraph
    pub fn body(&self) -> &GraphBody {
        &self.body
    }

    pub(crate) fn relink(&mut self) -> Result<(), GraphError> {
        self.body.relink(Some(BoundaryIo {
            inputs: &mut self.inputs,
            outputs: &mut self.outputs,
        }))
    }

    fn place_proxies(&mut self, bounds: Rect) {
        let y = bounds.center()[1] - 50.0;
        self.input_node.bounding = Rect::new(bounds.x - 180.0, y, 75.0, 100.0);
        self.output_node.bounding = Rect::new(bounds.right() + 105.0, y, 75.0, 100.0);
    }
}

/// Return `base`, or `base_N` with the smallest N that is not taken
pub fn unique_name<'a>(base: &str, taken: impl IntoIterator<Item = &'a str>) -> String {
    let taken: HashSet<&str> = taken.into_iter().collect();
    if !taken.contains(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !taken.contains(candidate.as_str()))
        .unwrap_or_else(|| base.to_string())
}

impl ScopeMut<'_> {
    /// Remove boundary input `index` of the subgraph this scope addresses
    pub(crate) fn remove_boundary_input(&mut self, index: usize) -> Result<(), GraphError> {
        let missing = GraphError::SlotNotFound {
            node_id: SUBGRAPH_INPUT_ID,
            direction: SlotDirection::Output,
            slot: index,
        };
        let link_ids = self
            .io
            .as_ref()
            .and_then(|io| io.inputs.get(index))
            .map(|io| io.link_ids.clone())
            .ok_or(missing)?;
        for link_id in link_ids {
            self.remove_link(link_id)?;
        }
        for link in self.body.links.values_mut() {
            if link.origin_is_boundary() && link.origin_slot > index {
                link.origin_slot -= 1;
            }
        }
        if let Some(io) = self.io.as_mut() {
            io.inputs.remove(index);
        }
        Ok(())
    }

    /// Remove boundary output `index` of the subgraph this scope addresses
    pub(crate) fn remove_boundary_output(&mut self, index: usize) -> Result<(), GraphError> {
        let missing = GraphError::SlotNotFound {
            node_id: SUBGRAPH_OUTPUT_ID,
            direction: SlotDirection::Input,
            slot: index,
        };
        let link_ids = self
            .io
            .as_ref()
            .and_then(|io| io.outputs.get(index))
            .map(|io| io.link_ids.clone())
            .ok_or(missing)?;
        for link_id in link_ids {
            self.remove_link(link_id)?;
        }
        for link in self.body.links.values_mut() {
            if link.target_is_boundary() && link.target_slot > index {
                link.target_slot -= 1;
            }
        }
        if let Some(io) = self.io.as_mut() {
            io.outputs.remove(index);
        }
        Ok(())
    }
}

/// Crossing links of a selection, grouped the way they become boundary slots
struct Crossings {
    internal: Vec<Link>,
    // outside origin -> links into the selection
    inbound: IndexMap<SlotRef, Vec<Link>>,
    // inside origin -> links leaving the selection
    outbound: IndexMap<SlotRef, Vec<Link>>,
}

impl Crossings {
    fn classify(body: &GraphBody, selection: &IndexSet<NodeId>) -> Self {
        let mut crossings = Crossings {
            internal: Vec::new(),
            inbound: IndexMap::new(),
            outbound: IndexMap::new(),
        };
        for link in body.links.values() {
            let origin = SlotRef::new(link.origin_id, link.origin_slot);
            match (selection.contains(&link.origin_id), selection.contains(&link.target_id)) {
                (true, true) => crossings.internal.push(link.clone()),
                (false, true) => crossings.inbound.entry(origin).or_default().push(link.clone()),
                (true, false) => crossings.outbound.entry(origin).or_default().push(link.clone()),
                (false, false) => {}
            }
        }
        crossings
    }

    fn link_ids(&self) -> Vec<LinkId> {
        self.internal
            .iter()
            .chain(self.inbound.values().flatten())
            .chain(self.outbound.values().flatten())
            .map(|l| l.id)
            .collect()
    }
}

impl Graph {
    /// Move a selection of nodes into a new subgraph.
    ///
    /// Links crossing into the selection become boundary inputs, one per
    /// distinct outside output. Links leaving it become boundary outputs,
    /// one per distinct inside output. Internal links keep their ids. The
    /// selection is replaced by a single subgraph node, and the outside
    /// ends of every crossing link are reconnected to it. Reroutes on a
    /// crossing link stay outside on the link that replaces it; when several
    /// links share one boundary input, the first one's waypoints are kept.
    pub fn create_subgraph(&mut self, scope: GraphScope, node_ids: &[NodeId]) -> Result<(SubgraphId, NodeId), GraphError> {
        if node_ids.is_empty() {
            return Err(GraphError::EmptySelection);
        }
        let view = self.scope(scope)?;
        let body = view.body();
        let selection: IndexSet<NodeId> = node_ids.iter().copied().collect();
        for id in &selection {
            if !body.nodes.contains_key(id) {
                return Err(GraphError::NodeNotFound(*id));
            }
        }

        let crossings = Crossings::classify(body, &selection);

        let mut inputs: Vec<SubgraphIo> = Vec::new();
        for (origin, links) in &crossings.inbound {
            let base = links
                .first()
                .and_then(|l| body.node(l.target_id).and_then(|n| n.input(l.target_slot)))
                .map_or("input", |s| s.name.as_str());
            let name = unique_name(base, inputs.iter().map(|io| io.name.as_str()));
            inputs.push(SubgraphIo::new(name, view.output_type(*origin)?.clone()));
        }
        let mut outputs: Vec<SubgraphIo> = Vec::new();
        for origin in crossings.outbound.keys() {
            let base = body
                .node(origin.node_id)
                .and_then(|n| n.output(origin.slot))
                .map_or("output", |s| s.name.as_str());
            let name = unique_name(base, outputs.iter().map(|io| io.name.as_str()));
            outputs.push(SubgraphIo::new(name, view.output_type(*origin)?.clone()));
        }

        let mut subgraph = Subgraph::new(DEFAULT_SUBGRAPH_NAME);
        let subgraph_id = subgraph.id;
        for id in &selection {
            if let Some(node) = body.node(*id) {
                subgraph.body.nodes.insert(*id, node.clone());
            }
        }

        // Reroutes move only if every link through them moves too
        let internal_ids: HashSet<LinkId> = crossings.internal.iter().map(|l| l.id).collect();
        let moved: HashSet<RerouteId> = body
            .reroutes
            .values()
            .filter(|r| !r.link_ids.is_empty() && r.link_ids.iter().all(|l| internal_ids.contains(l)))
            .map(|r| r.id)
            .collect();
        for reroute in body.reroutes.values().filter(|r| moved.contains(&r.id)) {
            let mut reroute = reroute.clone();
            reroute.parent_id = reroute.parent_id.filter(|p| moved.contains(p));
            subgraph.body.reroutes.insert(reroute.id, reroute);
        }

        for link in &crossings.internal {
            let mut link = link.clone();
            link.parent_id = link.parent_id.filter(|p| moved.contains(p));
            subgraph.body.links.insert(link.id, link);
        }
        for (index, links) in crossings.inbound.values().enumerate() {
            for link in links {
                let inner = Link::new(
                    link.id,
                    SUBGRAPH_INPUT_ID,
                    index,
                    link.target_id,
                    link.target_slot,
                    inputs[index].slot_type.clone(),
                );
                subgraph.body.links.insert(inner.id, inner);
            }
        }
        for (index, (origin, links)) in crossings.outbound.iter().enumerate() {
            let Some(first) = links.first() else {
                continue;
            };
            let inner = Link::new(
                first.id,
                origin.node_id,
                origin.slot,
                SUBGRAPH_OUTPUT_ID,
                index,
                outputs[index].slot_type.clone(),
            );
            subgraph.body.links.insert(inner.id, inner);
        }
        subgraph.body.links.sort_keys();
        subgraph.inputs = inputs;
        subgraph.outputs = outputs;
        subgraph.relink()?;

        let bounds = Rect::enclosing(subgraph.body.nodes.values().map(Node::bounding)).unwrap_or_default();
        subgraph.place_proxies(bounds);
        let center = bounds.center();
        let instance = Node::for_subgraph(&subgraph).with_position(center[0], center[1]);

        let crossing_ids = crossings.link_ids();
        let mut target = self.scope_mut(scope)?;
        let captured = target.capture_reroutes(crossings.inbound.values().chain(crossings.outbound.values()).flatten());
        for link_id in crossing_ids {
            if target.body.links.contains_key(&link_id) {
                target.remove_link(link_id)?;
            }
        }
        for id in &selection {
            target.remove_node(*id)?;
        }

        self.subgraphs.insert(subgraph_id, subgraph);
        let mut target = self.scope_mut(scope)?;
        let node_id = target.add_node(instance);
        let mut replaced = Vec::new();
        for (index, (origin, links)) in crossings.inbound.iter().enumerate() {
            let new = target.connect(*origin, SlotRef::new(node_id, index))?;
            if let Some(first) = links.first() {
                replaced.push((first.clone(), new));
            }
        }
        for (index, links) in crossings.outbound.values().enumerate() {
            for link in links {
                let new = target.connect(
                    SlotRef::new(node_id, index),
                    SlotRef::new(link.target_id, link.target_slot),
                )?;
                replaced.push((link.clone(), new));
            }
        }
        target.carry_reroutes(captured, &replaced)?;

        debug!(subgraph = %subgraph_id, node = %node_id, nodes = selection.len(), "created subgraph");
        self.events.emit(GraphEvent::SubgraphCreated { subgraph_id, node_id });
        Ok((subgraph_id, node_id))
    }

    /// Replace a subgraph node with a copy of its definition's contents.
    ///
    /// Inner node ids are kept when they are free in the target body.
    /// Outside links are reconnected to the inlined slots they reached
    /// through the boundary; a boundary input wired straight to a boundary
    /// output becomes a direct link. Reroutes on those outside links stay
    /// on the links that replace them. Groups are copied; reroutes inside
    /// the definition are not.
    /// The definition itself is left in place. Returns the inlined nodes.
    pub fn unpack_subgraph(&mut self, scope: GraphScope, node_id: NodeId) -> Result<Vec<NodeId>, GraphError> {
        let body = self.body(scope)?;
        let node = body.node(node_id).ok_or(GraphError::NodeNotFound(node_id))?;
        let subgraph_id = node.subgraph.ok_or(GraphError::NotASubgraphNode(node_id))?;
        let definition = self
            .subgraphs
            .get(&subgraph_id)
            .ok_or(GraphError::SubgraphNotFound(subgraph_id))?;

        let incoming: Vec<Option<Link>> = node
            .inputs
            .iter()
            .map(|slot| slot.link.and_then(|l| body.link(l)).cloned())
            .collect();
        let outgoing: Vec<Vec<Link>> = node
            .outputs
            .iter()
            .map(|slot| slot.links.iter().filter_map(|l| body.link(*l)).cloned().collect())
            .collect();

        let pos = node.pos();
        let anchor = Rect::enclosing(definition.body.nodes.values().map(Node::bounding)).map_or(pos, |r| r.center());
        let (dx, dy) = (pos[0] - anchor[0], pos[1] - anchor[1]);
        let inner_nodes: Vec<Node> = definition.body.nodes.values().cloned().collect();
        let inner_links: Vec<Link> = definition.body.links.values().cloned().collect();
        let inner_groups = definition.body.groups.values().cloned().collect::<Vec<_>>();

        let mut target = self.scope_mut(scope)?;
        let captured = target.capture_reroutes(incoming.iter().flatten().chain(outgoing.iter().flatten()));
        target.remove_node(node_id)?;

        let mut ids: HashMap<NodeId, NodeId> = HashMap::new();
        let mut added = Vec::with_capacity(inner_nodes.len());
        for inner in inner_nodes {
            let old_id = inner.id;
            let mut copy = inner;
            copy.translate(dx, dy);
            for input in &mut copy.inputs {
                input.link = None;
            }
            for output in &mut copy.outputs {
                output.links.clear();
            }
            let new_id = target.add_node(copy);
            ids.insert(old_id, new_id);
            added.push(new_id);
        }

        // Outside links hand their waypoints to the links that replace them.
        // A pass-through keeps the chain on its output side.
        let mut replaced: Vec<(Link, LinkId)> = Vec::new();
        let mut carried_inputs: HashSet<usize> = HashSet::new();
        for link in &inner_links {
            let (origin, inbound) = if link.origin_is_boundary() {
                let Some(outer) = incoming.get(link.origin_slot).and_then(Option::as_ref) else {
                    continue;
                };
                (SlotRef::new(outer.origin_id, outer.origin_slot), Some(outer))
            } else {
                match ids.get(&link.origin_id) {
                    Some(id) => (SlotRef::new(*id, link.origin_slot), None),
                    None => continue,
                }
            };
            let targets: Vec<(SlotRef, Option<&Link>)> = if link.target_is_boundary() {
                outgoing
                    .get(link.target_slot)
                    .map(|outer| {
                        outer
                            .iter()
                            .map(|l| (SlotRef::new(l.target_id, l.target_slot), Some(l)))
                            .collect()
                    })
                    .unwrap_or_default()
            } else {
                ids.get(&link.target_id)
                    .map(|id| vec![(SlotRef::new(*id, link.target_slot), None)])
                    .unwrap_or_default()
            };
            for (slot, outbound) in targets {
                let new = target.connect(origin, slot)?;
                if let Some(outer) = outbound {
                    replaced.push((outer.clone(), new));
                } else if let Some(outer) = inbound.filter(|_| carried_inputs.insert(link.origin_slot)) {
                    replaced.push((outer.clone(), new));
                }
            }
        }
        target.carry_reroutes(captured, &replaced)?;

        for mut group in inner_groups {
            group.bounding = group.bounding.translated(dx, dy);
            target.add_group(group);
        }

        debug!(subgraph = %subgraph_id, node = %node_id, nodes = added.len(), "unpacked subgraph");
        Ok(added)
    }

    /// Append a boundary input and mirror it on every instance
    pub fn add_subgraph_input(&mut self, subgraph_id: SubgraphId, name: &str, slot_type: SlotType) -> Result<usize, GraphError> {
        let sg = self
            .subgraphs
            .get_mut(&subgraph_id)
            .ok_or(GraphError::SubgraphNotFound(subgraph_id))?;
        let name = unique_name(name, sg.inputs.iter().map(|io| io.name.as_str()));
        sg.inputs.push(SubgraphIo::new(name.clone(), slot_type.clone()));
        let index = sg.inputs.len() - 1;

        self.for_each_instance(subgraph_id, |node| {
            node.inputs.push(InputSlot::new(name.clone(), slot_type.clone()));
        });
        self.events.emit(GraphEvent::SubgraphBoundaryChanged { subgraph_id });
        Ok(index)
    }

    /// Append a boundary output and mirror it on every instance
    pub fn add_subgraph_output(&mut self, subgraph_id: SubgraphId, name: &str, slot_type: SlotType) -> Result<usize, GraphError> {
        let sg = self
            .subgraphs
            .get_mut(&subgraph_id)
            .ok_or(GraphError::SubgraphNotFound(subgraph_id))?;
        let name = unique_name(name, sg.outputs.iter().map(|io| io.name.as_str()));
        sg.outputs.push(SubgraphIo::new(name.clone(), slot_type.clone()));
        let index = sg.outputs.len() - 1;

        self.for_each_instance(subgraph_id, |node| {
            node.outputs.push(OutputSlot::new(name.clone(), slot_type.clone()));
        });
        self.events.emit(GraphEvent::SubgraphBoundaryChanged { subgraph_id });
        Ok(index)
    }

    /// Remove a boundary input, its links inside, and the mirrored slot
    /// (with its link) on every instance
    pub fn remove_subgraph_input(&mut self, subgraph_id: SubgraphId, index: usize) -> Result<(), GraphError> {
        self.scope_mut(GraphScope::Subgraph(subgraph_id))?
            .remove_boundary_input(index)?;
        for (scope, node_id) in self.subgraph_instances(subgraph_id) {
            self.scope_mut(scope)?.remove_node_input(node_id, index)?;
        }
        self.events.emit(GraphEvent::SubgraphBoundaryChanged { subgraph_id });
        Ok(())
    }

    /// Remove a boundary output, its link inside, and the mirrored slot
    /// (with its links) on every instance
    pub fn remove_subgraph_output(&mut self, subgraph_id: SubgraphId, index: usize) -> Result<(), GraphError> {
        self.scope_mut(GraphScope::Subgraph(subgraph_id))?
            .remove_boundary_output(index)?;
        for (scope, node_id) in self.subgraph_instances(subgraph_id) {
            self.scope_mut(scope)?.remove_node_output(node_id, index)?;
        }
        self.events.emit(GraphEvent::SubgraphBoundaryChanged { subgraph_id });
        Ok(())
    }

    /// Add an input to a subgraph node. Edits the definition's boundary,
    /// so every other instance gains the slot too.
    pub fn add_subgraph_node_input(
        &mut self,
        scope: GraphScope,
        node_id: NodeId,
        name: &str,
        slot_type: SlotType,
    ) -> Result<usize, GraphError> {
        let subgraph_id = self.instance_of(scope, node_id)?;
        self.add_subgraph_input(subgraph_id, name, slot_type)
    }

    /// Add an output to a subgraph node and its definition
    pub fn add_subgraph_node_output(
        &mut self,
        scope: GraphScope,
        node_id: NodeId,
        name: &str,
        slot_type: SlotType,
    ) -> Result<usize, GraphError> {
        let subgraph_id = self.instance_of(scope, node_id)?;
        self.add_subgraph_output(subgraph_id, name, slot_type)
    }

    /// Remove an input from a subgraph node and its definition
    pub fn remove_subgraph_node_input(&mut self, scope: GraphScope, node_id: NodeId, index: usize) -> Result<(), GraphError> {
        let subgraph_id = self.instance_of(scope, node_id)?;
        self.remove_subgraph_input(subgraph_id, index)
    }

    /// Remove an output from a subgraph node and its definition
    pub fn remove_subgraph_node_output(&mut self, scope: GraphScope, node_id: NodeId, index: usize) -> Result<(), GraphError> {
        let subgraph_id = self.instance_of(scope, node_id)?;
        self.remove_subgraph_output(subgraph_id, index)
    }

    /// Every node, in any body, that instantiates `subgraph_id`
    pub fn subgraph_instances(&self, subgraph_id: SubgraphId) -> Vec<(GraphScope, NodeId)> {
        let mut instances = Vec::new();
        for scope in self.scopes() {
            if let Ok(body) = self.body(scope) {
                instances.extend(
                    body.nodes
                        .values()
                        .filter(|n| n.subgraph == Some(subgraph_id))
                        .map(|n| (scope, n.id)),
                );
            }
        }
        instances
    }

    /// Subgraph definitions reachable from the root, in discovery order
    pub fn used_subgraph_ids(&self) -> IndexSet<SubgraphId> {
        let mut visited = IndexSet::new();
        self.walk_reachable(&self.root, &mut visited, &mut |_, _| {});
        visited
    }

    /// Count nodes by type over the root and every reachable definition.
    ///
    /// Each definition is counted once, however many instances it has.
    /// Subgraph nodes themselves are not counted.
    pub fn aggregate_node_types(&self) -> IndexMap<String, usize> {
        let mut counts: IndexMap<String, usize> = IndexMap::new();
        let mut visited = IndexSet::new();
        self.walk_reachable(&self.root, &mut visited, &mut |_, node| {
            if !node.is_subgraph_node() {
                *counts.entry(node.node_type.clone()).or_default() += 1;
            }
        });
        counts
    }

    /// Find nodes of a type in the root and every reachable definition
    pub fn find_nodes_by_type(&self, node_type: &str) -> Vec<(GraphScope, NodeId)> {
        let mut found = Vec::new();
        let mut visited = IndexSet::new();
        self.walk_reachable(&self.root, &mut visited, &mut |scope, node| {
            if node.node_type == node_type {
                found.push((scope, node.id));
            }
        });
        found
    }

    fn walk_reachable(&self, body: &GraphBody, visited: &mut IndexSet<SubgraphId>, visit: &mut dyn FnMut(GraphScope, &Node)) {
        self.walk_body(GraphScope::Root, body, visited, visit);
    }

    fn walk_body(
        &self,
        scope: GraphScope,
        body: &GraphBody,
        visited: &mut IndexSet<SubgraphId>,
        visit: &mut dyn FnMut(GraphScope, &Node),
    ) {
        for node in body.nodes.values() {
            visit(scope, node);
            let Some(subgraph_id) = node.subgraph else {
                continue;
            };
            if !visited.insert(subgraph_id) {
                continue;
            }
            if let Some(sg) = self.subgraphs.get(&subgraph_id) {
                self.walk_body(GraphScope::Subgraph(subgraph_id), &sg.body, visited, visit);
            }
        }
    }

    fn instance_of(&self, scope: GraphScope, node_id: NodeId) -> Result<SubgraphId, GraphError> {
        self.body(scope)?
            .node(node_id)
            .ok_or(GraphError::NodeNotFound(node_id))?
            .subgraph
            .ok_or(GraphError::NotASubgraphNode(node_id))
    }

    fn for_each_instance(&mut self, subgraph_id: SubgraphId, mut f: impl FnMut(&mut Node)) {
        let bodies = std::iter::once(&mut self.root).chain(self.subgraphs.values_mut().map(|sg| &mut sg.body));
        for body in bodies {
            for node in body.nodes.values_mut() {
                if node.subgraph == Some(subgraph_id) {
                    f(node);
                }
            }
        }
    }

    /// Register a definition directly. Used when loading documents and
    /// by callers that assemble subgraphs by hand.
    pub fn insert_subgraph(&mut self, mut subgraph: Subgraph) -> Result<SubgraphId, GraphError> {
        subgraph.relink()?;
        self.state.raise_to(&subgraph.body);
        let id = subgraph.id;
        self.subgraphs.insert(id, subgraph);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkSegment;

    fn chain_graph() -> (Graph, [NodeId; 3]) {
        let mut graph = Graph::new();
        let mut root = graph.root_mut();
        let a = root.add_node(
            Node::new("Loader")
                .with_position(0.0, 0.0)
                .with_output(OutputSlot::new("MODEL", "MODEL")),
        );
        let b = root.add_node(
            Node::new("Patch")
                .with_position(200.0, 0.0)
                .with_input(InputSlot::new("model", "MODEL"))
                .with_output(OutputSlot::new("MODEL", "MODEL")),
        );
        let c = root.add_node(
            Node::new("Sampler")
                .with_position(400.0, 0.0)
                .with_input(InputSlot::new("model", "MODEL")),
        );
        root.connect(SlotRef::new(a, 0), SlotRef::new(b, 0)).unwrap();
        root.connect(SlotRef::new(b, 0), SlotRef::new(c, 0)).unwrap();
        (graph, [a, b, c])
    }

    #[test]
    fn test_unique_name() {
        assert_eq!(unique_name("model", ["clip"]), "model");
        assert_eq!(unique_name("model", ["model", "model_1"]), "model_2");
    }

    #[test]
    fn test_create_subgraph_derives_boundary() {
        let (mut graph, [a, b, c]) = chain_graph();
        let (subgraph_id, node_id) = graph.create_subgraph(GraphScope::Root, &[b]).unwrap();

        let sg = graph.subgraph(subgraph_id).unwrap();
        assert_eq!(sg.inputs().len(), 1);
        assert_eq!(sg.outputs().len(), 1);
        assert_eq!(sg.inputs()[0].slot_type, SlotType::new("MODEL"));
        assert_eq!(sg.body().link_count(), 2);

        let root = graph.root();
        assert!(root.node(b).is_none());
        assert_eq!(root.link_count(), 2);
        let instance = root.node(node_id).unwrap();
        assert!(instance.inputs()[0].link.is_some());
        assert!(root.links_for_node(a).any(|l| l.target_id == node_id));
        assert!(root.links_for_node(c).any(|l| l.origin_id == node_id));
        graph.validate().unwrap();
    }

    #[test]
    fn test_empty_selection() {
        let (mut graph, _) = chain_graph();
        assert_eq!(
            graph.create_subgraph(GraphScope::Root, &[]),
            Err(GraphError::EmptySelection)
        );
    }

    #[test]
    fn test_unpack_rejects_plain_nodes() {
        let (mut graph, [a, _, _]) = chain_graph();
        assert_eq!(
            graph.unpack_subgraph(GraphScope::Root, a),
            Err(GraphError::NotASubgraphNode(a))
        );
    }

    #[test]
    fn test_unpack_restores_selection() {
        let (mut graph, [a, b, c]) = chain_graph();
        let (_, node_id) = graph.create_subgraph(GraphScope::Root, &[b]).unwrap();
        let restored = graph.unpack_subgraph(GraphScope::Root, node_id).unwrap();

        assert_eq!(restored, vec![b]);
        let root = graph.root();
        assert_eq!(root.node(b).unwrap().pos(), [200.0, 0.0]);
        assert!(root.links().any(|l| l.origin_id == a && l.target_id == b));
        assert!(root.links().any(|l| l.origin_id == b && l.target_id == c));
        assert_eq!(root.link_count(), 2);
        graph.validate().unwrap();
    }

    #[test]
    fn test_pass_through_is_reconnected() {
        let (mut graph, [a, b, c]) = chain_graph();
        let (subgraph_id, node_id) = graph.create_subgraph(GraphScope::Root, &[b]).unwrap();

        // Replace the inner node with a direct boundary link
        let mut inner = graph.scope_mut(GraphScope::Subgraph(subgraph_id)).unwrap();
        inner.remove_node(b).unwrap();
        inner
            .connect(SlotRef::subgraph_input(0), SlotRef::subgraph_output(0))
            .unwrap();

        graph.unpack_subgraph(GraphScope::Root, node_id).unwrap();
        assert!(graph.root().links().any(|l| l.origin_id == a && l.target_id == c));
        graph.validate().unwrap();
    }

    #[test]
    fn test_crossing_reroutes_survive_create_and_unpack() {
        let (mut graph, [a, b, c]) = chain_graph();
        let (into_b, out_of_b) = {
            let root = graph.root();
            let into_b = root.links().find(|l| l.target_id == b).unwrap().id;
            let out_of_b = root.links().find(|l| l.origin_id == b).unwrap().id;
            (into_b, out_of_b)
        };
        let (before, after) = {
            let mut root = graph.root_mut();
            (
                root.create_reroute([100.0, 50.0], LinkSegment::Link(into_b)).unwrap(),
                root.create_reroute([300.0, 50.0], LinkSegment::Link(out_of_b)).unwrap(),
            )
        };

        let (_, node_id) = graph.create_subgraph(GraphScope::Root, &[b]).unwrap();
        {
            let root = graph.root();
            let inbound = root.links().find(|l| l.origin_id == a).unwrap();
            let outbound = root.links().find(|l| l.target_id == c).unwrap();
            assert_eq!(inbound.target_id, node_id);
            assert_eq!(inbound.parent_id, Some(before));
            assert_eq!(outbound.parent_id, Some(after));
            assert!(root.reroute(before).unwrap().link_ids.contains(&inbound.id));
            assert!(root.reroute(after).unwrap().link_ids.contains(&outbound.id));
        }
        graph.validate().unwrap();

        graph.unpack_subgraph(GraphScope::Root, node_id).unwrap();
        let root = graph.root();
        assert_eq!(root.reroutes().count(), 2);
        let inbound = root.links().find(|l| l.origin_id == a).unwrap();
        assert_eq!(inbound.target_id, b);
        assert_eq!(inbound.parent_id, Some(before));
        let outbound = root.links().find(|l| l.target_id == c).unwrap();
        assert_eq!(outbound.parent_id, Some(after));
        assert_eq!(root.reroute(after).unwrap().link_ids.len(), 1);
        graph.validate().unwrap();
    }

    #[test]
    fn test_boundary_edit_updates_every_instance() {
        let (mut graph, [_, b, _]) = chain_graph();
        let (subgraph_id, first) = graph.create_subgraph(GraphScope::Root, &[b]).unwrap();
        let second = {
            let sg = graph.subgraph(subgraph_id).unwrap();
            let node = Node::for_subgraph(sg);
            graph.root_mut().add_node(node)
        };

        let index = graph
            .add_subgraph_input(subgraph_id, "seed", SlotType::new("INT"))
            .unwrap();
        assert_eq!(index, 1);
        for id in [first, second] {
            let node = graph.root().node(id).unwrap();
            assert_eq!(node.inputs().len(), 2);
            assert_eq!(node.inputs()[1].name, "seed");
        }

        graph.remove_subgraph_input(subgraph_id, 0).unwrap();
        assert_eq!(graph.root().node(first).unwrap().inputs().len(), 1);
        assert_eq!(graph.subgraph(subgraph_id).unwrap().inputs()[0].name, "seed");
        graph.validate().unwrap();
    }

    #[test]
    fn test_self_referencing_walk_terminates() {
        let mut graph = Graph::new();
        let sg = Subgraph::new("Loop");
        let id = graph.insert_subgraph(sg).unwrap();
        let node = Node::for_subgraph(graph.subgraph(id).unwrap());
        graph
            .scope_mut(GraphScope::Subgraph(id))
            .unwrap()
            .add_node(node.clone());
        graph.root_mut().add_node(node);
        graph.root_mut().add_node(Node::new("Plain"));

        assert_eq!(graph.used_subgraph_ids().len(), 1);
        assert_eq!(graph.aggregate_node_types().get("Plain"), Some(&1));
        assert_eq!(graph.find_nodes_by_type(&id.to_string()).len(), 2);
    }
}
