// SPDX-License-Identifier: MIT OR Apache-2.0
//! Groups: titled rectangles laid over part of a graph.
//!
//! A group does not own nodes. Membership is derived from node bounding
//! boxes and recomputed on demand.

use crate::events::GraphEvent;
use crate::graph::{GraphError, ScopeMut};
use crate::measure::Rect;
use crate::node::{Node, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Padding kept around nodes when a group is fitted to them
pub const GROUP_PADDING: f64 = 10.0;

/// Unique identifier for a group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Group flags
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupFlags {
    /// Cannot be moved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
}

/// A group of nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Group id (0 until added to a graph)
    #[serde(default)]
    pub id: GroupId,
    /// Title
    #[serde(default)]
    pub title: String,
    /// Area covered by the group
    pub bounding: Rect,
    /// Colour
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Title font size
    #[serde(default = "default_font_size")]
    pub font_size: f64,
    /// Flags
    #[serde(default)]
    pub flags: GroupFlags,
    /// Nodes whose centre lies inside the group, as of the last recompute
    #[serde(skip)]
    pub(crate) members: BTreeSet<NodeId>,
}

fn default_font_size() -> f64 {
    24.0
}

impl Group {
    /// Create a group covering `bounding`
    pub fn new(title: impl Into<String>, bounding: Rect) -> Self {
        Self {
            id: GroupId::default(),
            title: title.into(),
            bounding,
            color: None,
            font_size: default_font_size(),
            flags: GroupFlags::default(),
            members: BTreeSet::new(),
        }
    }

    /// Cached members
    pub fn members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.iter().copied()
    }

    /// Check if a node was inside the group at the last recompute
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.members.contains(&node_id)
    }

    /// Recompute membership from node bounding boxes
    pub fn recompute_members<'n>(&mut self, nodes: impl IntoIterator<Item = &'n Node>) {
        self.members = nodes
            .into_iter()
            .filter(|n| self.bounding.contains_point(n.bounding().center()))
            .map(Node::id)
            .collect();
    }

    /// Fit the group around `rects` with `padding` on every side.
    ///
    /// Leaves the group unchanged when `rects` is empty.
    pub fn resize_to(&mut self, rects: impl IntoIterator<Item = Rect>, padding: f64) {
        if let Some(bounds) = Rect::enclosing(rects) {
            // Room for the title above the first row of nodes
            let title = self.font_size * 1.4;
            let padded = bounds.padded(padding);
            self.bounding = Rect::new(padded.x, padded.y - title, padded.width, padded.height + title);
        }
    }
}

impl ScopeMut<'_> {
    /// Add a group. Returns its id.
    pub fn add_group(&mut self, mut group: Group) -> GroupId {
        let id = self.state.next_group_id();
        group.id = id;
        group.recompute_members(self.body.nodes.values());
        self.body.groups.insert(id, group);
        self.events.emit(GraphEvent::GroupAdded {
            scope: self.scope,
            group_id: id,
        });
        id
    }

    /// Remove a group. Its nodes stay in the graph.
    pub fn remove_group(&mut self, group_id: GroupId) -> Result<Group, GraphError> {
        let group = self
            .body
            .groups
            .shift_remove(&group_id)
            .ok_or(GraphError::GroupNotFound(group_id))?;
        self.events.emit(GraphEvent::GroupRemoved {
            scope: self.scope,
            group_id,
        });
        Ok(group)
    }

    /// Rename a group
    pub fn set_group_title(&mut self, group_id: GroupId, title: impl Into<String>) -> Result<(), GraphError> {
        let group = self
            .body
            .groups
            .get_mut(&group_id)
            .ok_or(GraphError::GroupNotFound(group_id))?;
        group.title = title.into();
        Ok(())
    }

    /// Grow a group to fit its current members plus `node_ids`
    pub fn add_nodes_to_group(&mut self, group_id: GroupId, node_ids: &[NodeId]) -> Result<(), GraphError> {
        for id in node_ids {
            if !self.body.nodes.contains_key(id) {
                return Err(GraphError::NodeNotFound(*id));
            }
        }
        let group = self
            .body
            .groups
            .get_mut(&group_id)
            .ok_or(GraphError::GroupNotFound(group_id))?;

        let nodes = &self.body.nodes;
        let rects: Vec<Rect> = group
            .members
            .iter()
            .chain(node_ids)
            .filter_map(|id| nodes.get(id))
            .map(Node::bounding)
            .collect();
        group.resize_to(rects, GROUP_PADDING);
        group.recompute_members(nodes.values());
        Ok(())
    }

    /// Recompute a group's members. Returns them.
    pub fn recompute_group_members(&mut self, group_id: GroupId) -> Result<Vec<NodeId>, GraphError> {
        let group = self
            .body
            .groups
            .get_mut(&group_id)
            .ok_or(GraphError::GroupNotFound(group_id))?;
        group.recompute_members(self.body.nodes.values());
        Ok(group.members().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    #[test]
    fn test_membership_by_centre() {
        let mut graph = Graph::new();
        let mut root = graph.root_mut();
        let inside = root.add_node(Node::new("A").with_position(50.0, 50.0));
        let outside = root.add_node(Node::new("B").with_position(500.0, 500.0));

        let group = root.add_group(Group::new("G", Rect::new(0.0, 0.0, 300.0, 300.0)));
        let members = root.recompute_group_members(group).unwrap();
        assert_eq!(members, vec![inside]);
        assert!(!root.body().group(group).unwrap().contains(outside));
    }

    #[test]
    fn test_add_nodes_resizes_group() {
        let mut graph = Graph::new();
        let mut root = graph.root_mut();
        let far = root.add_node(Node::new("A").with_position(800.0, 600.0));
        let group = root.add_group(Group::new("G", Rect::new(0.0, 0.0, 10.0, 10.0)));

        root.add_nodes_to_group(group, &[far]).unwrap();
        let group = root.body().group(group).unwrap();
        assert!(group.contains(far));
        assert!(group.bounding.x <= 800.0 - GROUP_PADDING);
    }

    #[test]
    fn test_missing_group() {
        let mut graph = Graph::new();
        let mut root = graph.root_mut();
        assert_eq!(
            root.remove_group(GroupId(7)).unwrap_err(),
            GraphError::GroupNotFound(GroupId(7))
        );
    }

    #[test]
    fn test_members_are_not_serialized() {
        let mut group = Group::new("G", Rect::new(0.0, 0.0, 1.0, 1.0));
        group.members.insert(NodeId(3));
        let json = serde_json::to_value(&group).unwrap();
        assert!(json.get("members").is_none());
        assert_eq!(json["bounding"], serde_json::json!([0.0, 0.0, 1.0, 1.0]));
    }
}
