// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reroutes: waypoints that links are drawn through.
//!
//! Reroutes form chains through `parent_id`, from the input side of a link
//! towards its output side. A link points at the reroute nearest to its
//! target; every reroute on the chain lists the link in `link_ids`. A
//! reroute has no type of its own and carries the type of its links.

use crate::events::GraphEvent;
use crate::graph::{GraphError, ScopeMut};
use crate::link::{Link, LinkId, LinkSegment};
use crate::slot::SlotType;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Unique identifier for a reroute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RerouteId(pub u32);

impl fmt::Display for RerouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A routing waypoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reroute {
    /// Reroute id
    pub id: RerouteId,
    /// Next reroute towards the output side
    #[serde(rename = "parentId", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<RerouteId>,
    /// Position
    pub pos: [f64; 2],
    /// Links passing through
    #[serde(rename = "linkIds", default)]
    pub link_ids: BTreeSet<LinkId>,
}

impl ScopeMut<'_> {
    /// Insert a reroute in front of a link or an existing reroute.
    ///
    /// In front of a link, the reroute becomes the link's nearest waypoint.
    /// In front of a reroute, it goes between that reroute and its parent
    /// and carries the same links.
    pub fn create_reroute(&mut self, pos: [f64; 2], before: LinkSegment) -> Result<RerouteId, GraphError> {
        let (before_parent, link_ids): (Option<RerouteId>, BTreeSet<LinkId>) = match before {
            LinkSegment::Link(link_id) => {
                let link = self.body.links.get(&link_id).ok_or(GraphError::LinkNotFound(link_id))?;
                (link.parent_id, BTreeSet::from([link_id]))
            }
            LinkSegment::Reroute(reroute_id) => {
                let reroute = self
                    .body
                    .reroutes
                    .get(&reroute_id)
                    .ok_or(GraphError::RerouteNotFound(reroute_id))?;
                (reroute.parent_id, reroute.link_ids.clone())
            }
        };

        let id = self.state.next_reroute_id();
        for link_id in &link_ids {
            let Some(link) = self.body.links.get(link_id) else {
                continue;
            };
            let chain = self.view().reroute_chain(link.parent_id);
            for reroute_id in chain {
                if let Some(reroute) = self.body.reroutes.get_mut(&reroute_id) {
                    if reroute.parent_id == before_parent {
                        reroute.parent_id = Some(id);
                    }
                }
            }
            if let Some(link) = self.body.links.get_mut(link_id) {
                if link.parent_id == before_parent {
                    link.parent_id = Some(id);
                }
            }
        }

        self.body.reroutes.insert(
            id,
            Reroute {
                id,
                parent_id: before_parent,
                pos,
                link_ids,
            },
        );
        self.events.emit(GraphEvent::RerouteAdded {
            scope: self.scope,
            reroute_id: id,
        });
        Ok(id)
    }

    /// Remove a reroute, splicing it out of every chain it is part of
    pub fn remove_reroute(&mut self, reroute_id: RerouteId) -> Result<Reroute, GraphError> {
        if !self.body.reroutes.contains_key(&reroute_id) {
            return Err(GraphError::RerouteNotFound(reroute_id));
        }
        self.splice_reroute(reroute_id)
    }

    /// Move a reroute
    pub fn move_reroute(&mut self, reroute_id: RerouteId, pos: [f64; 2]) -> Result<(), GraphError> {
        let reroute = self
            .body
            .reroutes
            .get_mut(&reroute_id)
            .ok_or(GraphError::RerouteNotFound(reroute_id))?;
        reroute.pos = pos;
        Ok(())
    }

    /// Type carried through a reroute (the type of its first link)
    pub fn reroute_type(&self, reroute_id: RerouteId) -> Result<SlotType, GraphError> {
        let reroute = self
            .body
            .reroutes
            .get(&reroute_id)
            .ok_or(GraphError::RerouteNotFound(reroute_id))?;
        Ok(reroute
            .link_ids
            .iter()
            .find_map(|id| self.body.links.get(id))
            .map(|link| link.link_type.clone())
            .unwrap_or_default())
    }

    pub(crate) fn splice_reroute(&mut self, reroute_id: RerouteId) -> Result<Reroute, GraphError> {
        let reroute = self.take_reroute(reroute_id)?;
        self.events.emit(GraphEvent::RerouteRemoved {
            scope: self.scope,
            reroute_id,
        });
        Ok(reroute)
    }

    fn take_reroute(&mut self, reroute_id: RerouteId) -> Result<Reroute, GraphError> {
        let reroute = self
            .body
            .reroutes
            .shift_remove(&reroute_id)
            .ok_or(GraphError::RerouteNotFound(reroute_id))?;
        for link in self.body.links.values_mut() {
            if link.parent_id == Some(reroute_id) {
                link.parent_id = reroute.parent_id;
            }
        }
        for other in self.body.reroutes.values_mut() {
            if other.parent_id == Some(reroute_id) {
                other.parent_id = reroute.parent_id;
            }
        }
        Ok(reroute)
    }

    /// Copies of every reroute on the chains of `links`
    pub(crate) fn capture_reroutes<'l>(&self, links: impl IntoIterator<Item = &'l Link>) -> Vec<Reroute> {
        let view = self.view();
        let ids: IndexSet<RerouteId> = links
            .into_iter()
            .flat_map(|link| view.reroute_chain(link.parent_id))
            .collect();
        ids.iter()
            .filter_map(|id| self.body.reroutes.get(id).cloned())
            .collect()
    }

    /// Route replacement links through the waypoints of the links they
    /// replaced.
    ///
    /// `captured` holds the reroutes as they were before the old links were
    /// removed. Each `(old, new)` pair hands the old link's chain to `new`.
    /// Waypoints that end up carrying no link are dropped.
    pub(crate) fn carry_reroutes(&mut self, captured: Vec<Reroute>, replaced: &[(Link, LinkId)]) -> Result<(), GraphError> {
        if captured.is_empty() {
            return Ok(());
        }
        let renamed: HashMap<LinkId, LinkId> = replaced.iter().map(|(old, new)| (old.id, *new)).collect();

        let mut emptied = Vec::new();
        for mut reroute in captured {
            let current = self.body.reroutes.get(&reroute.id).map(|r| r.link_ids.clone());
            let restored = current.is_none();
            reroute.link_ids = reroute
                .link_ids
                .iter()
                .filter_map(|id| renamed.get(id).copied())
                .chain(current.unwrap_or_default())
                .collect();
            if reroute.link_ids.is_empty() {
                emptied.push(reroute.id);
            } else if restored {
                self.events.emit(GraphEvent::RerouteAdded {
                    scope: self.scope,
                    reroute_id: reroute.id,
                });
            }
            self.body.reroutes.insert(reroute.id, reroute);
        }
        for (old, new) in replaced {
            if let Some(link) = self.body.links.get_mut(new) {
                link.parent_id = old.parent_id;
            }
        }
        // Already reported as removed when their last link went
        for reroute_id in emptied {
            self.take_reroute(reroute_id)?;
        }
        self.body.reroutes.sort_keys();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::link::SlotRef;
    use crate::node::Node;
    use crate::slot::{InputSlot, OutputSlot};

    fn linked() -> (Graph, LinkId) {
        let mut graph = Graph::new();
        let mut root = graph.root_mut();
        let a = root.add_node(Node::new("A").with_output(OutputSlot::new("out", "LATENT")));
        let b = root.add_node(Node::new("B").with_input(InputSlot::new("in", "LATENT")));
        let link = root.connect(SlotRef::new(a, 0), SlotRef::new(b, 0)).unwrap();
        (graph, link)
    }

    #[test]
    fn test_reroute_chain_order() {
        let (mut graph, link) = linked();
        let mut root = graph.root_mut();
        let near_target = root.create_reroute([10.0, 0.0], LinkSegment::Link(link)).unwrap();
        let near_origin = root
            .create_reroute([5.0, 0.0], LinkSegment::Reroute(near_target))
            .unwrap();

        let resolved = root.view().resolve(link).unwrap();
        assert_eq!(resolved.reroutes, vec![near_target, near_origin]);
        assert_eq!(root.reroute_type(near_origin).unwrap(), SlotType::new("LATENT"));
        graph.validate().unwrap();
    }

    #[test]
    fn test_remove_reroute_splices_chain() {
        let (mut graph, link) = linked();
        let mut root = graph.root_mut();
        let first = root.create_reroute([10.0, 0.0], LinkSegment::Link(link)).unwrap();
        let second = root.create_reroute([5.0, 0.0], LinkSegment::Reroute(first)).unwrap();

        root.remove_reroute(first).unwrap();
        assert_eq!(root.body().link(link).unwrap().parent_id, Some(second));
        graph.validate().unwrap();
    }

    #[test]
    fn test_removing_link_drops_empty_reroutes() {
        let (mut graph, link) = linked();
        let mut root = graph.root_mut();
        root.create_reroute([10.0, 0.0], LinkSegment::Link(link)).unwrap();

        root.remove_link(link).unwrap();
        assert_eq!(root.body().reroutes().count(), 0);
    }
}
