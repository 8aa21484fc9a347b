// SPDX-License-Identifier: MIT OR Apache-2.0
//! Change notifications.
//!
//! The [`EventBus`] is shared (by reference count) between a graph, its
//! nodes and any staged copy of the graph. Dispatch is synchronous.
//! Events emitted from inside a listener are queued and delivered after the
//! current event, and a property change for a `(node, property)` pair that
//! is being dispatched right now is dropped, so a listener that writes back
//! to the property it observes cannot recurse.

use crate::graph::GraphScope;
use crate::group::GroupId;
use crate::link::{LinkId, SlotRef};
use crate::node::NodeId;
use crate::reroute::RerouteId;
use crate::subgraph::SubgraphId;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::rc::Rc;
use tracing::warn;

/// A change to the graph
#[derive(Debug, Clone, PartialEq)]
pub enum GraphEvent {
    /// A node was added
    NodeAdded {
        /// Graph the node lives in
        scope: GraphScope,
        /// Node id
        node_id: NodeId,
    },
    /// A node was removed
    NodeRemoved {
        /// Graph the node lived in
        scope: GraphScope,
        /// Node id
        node_id: NodeId,
    },
    /// A link was added
    LinkAdded {
        /// Graph the link lives in
        scope: GraphScope,
        /// Link id
        link_id: LinkId,
    },
    /// A link was removed
    LinkRemoved {
        /// Graph the link lived in
        scope: GraphScope,
        /// Link id
        link_id: LinkId,
    },
    /// A link replaced the previous link of an occupied input
    LinkSuperseded {
        /// Graph the links live in
        scope: GraphScope,
        /// Input that changed hands
        target: SlotRef,
        /// Link that was removed
        old_link: LinkId,
        /// Link that took its place
        new_link: LinkId,
    },
    /// A group was added
    GroupAdded {
        /// Graph the group lives in
        scope: GraphScope,
        /// Group id
        group_id: GroupId,
    },
    /// A group was removed
    GroupRemoved {
        /// Graph the group lived in
        scope: GraphScope,
        /// Group id
        group_id: GroupId,
    },
    /// A reroute was added
    RerouteAdded {
        /// Graph the reroute lives in
        scope: GraphScope,
        /// Reroute id
        reroute_id: RerouteId,
    },
    /// A reroute was removed
    RerouteRemoved {
        /// Graph the reroute lived in
        scope: GraphScope,
        /// Reroute id
        reroute_id: RerouteId,
    },
    /// A tracked node property was written
    NodePropertyChanged {
        /// Node id
        node_id: NodeId,
        /// Property path (`title`, `flags.collapsed`, `properties.seed`, ...)
        property: String,
        /// Previous value
        old_value: Value,
        /// New value
        new_value: Value,
    },
    /// A subgraph was extracted from a selection
    SubgraphCreated {
        /// New definition
        subgraph_id: SubgraphId,
        /// Instance node that replaced the selection
        node_id: NodeId,
    },
    /// A subgraph's boundary inputs or outputs changed
    SubgraphBoundaryChanged {
        /// Definition that changed
        subgraph_id: SubgraphId,
    },
    /// The graph was emptied
    Cleared,
    /// The graph was replaced from a document
    Configured,
}

impl GraphEvent {
    fn property_key(&self) -> Option<(NodeId, String)> {
        match self {
            Self::NodePropertyChanged {
                node_id, property, ..
            } => Some((*node_id, property.clone())),
            _ => None,
        }
    }
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Rc<dyn Fn(&GraphEvent)>;

/// Work buffered by [`EventBus::hold`]
enum Held {
    Event(GraphEvent),
    Call(Box<dyn FnOnce()>),
}

#[derive(Default)]
struct BusInner {
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    queue: VecDeque<GraphEvent>,
    dispatching: bool,
    active: HashSet<(NodeId, String)>,
    hold_depth: usize,
    held: Vec<Held>,
}

/// Synchronous event dispatcher with a reentrancy guard
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Rc<RefCell<BusInner>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("EventBus")
            .field("listeners", &inner.listeners.len())
            .field("queued", &inner.queue.len())
            .field("held", &inner.held.len())
            .finish()
    }
}

impl EventBus {
    /// Create a bus with no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    pub fn subscribe(&self, listener: impl Fn(&GraphEvent) + 'static) -> ListenerId {
        let mut inner = self.inner.borrow_mut();
        let id = ListenerId(inner.next_listener);
        inner.next_listener += 1;
        inner.listeners.push((id, Rc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let before = inner.listeners.len();
        inner.listeners.retain(|(l, _)| *l != id);
        inner.listeners.len() != before
    }

    /// Emit an event
    pub fn emit(&self, event: GraphEvent) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.hold_depth > 0 {
                inner.held.push(Held::Event(event));
                return;
            }
            if let Some(key) = event.property_key() {
                if inner.active.contains(&key) {
                    warn!(node = %key.0, property = %key.1, "dropping reentrant property change");
                    return;
                }
            }
            inner.queue.push_back(event);
            if inner.dispatching {
                return;
            }
            inner.dispatching = true;
        }
        self.drain();
    }

    /// Run `call` now, or when the current hold is committed.
    ///
    /// Node hooks go through here so that a rolled back mutation never
    /// runs them.
    pub(crate) fn defer(&self, call: impl FnOnce() + 'static) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.hold_depth > 0 {
                inner.held.push(Held::Call(Box::new(call)));
                return;
            }
        }
        call();
    }

    /// Buffer events and deferred calls until the matching [`EventBus::release`]
    pub fn hold(&self) {
        self.inner.borrow_mut().hold_depth += 1;
    }

    /// End a [`EventBus::hold`]. Buffered events and calls run in order
    /// when the outermost hold is released with `commit`, and are dropped
    /// otherwise.
    pub fn release(&self, commit: bool) {
        let held = {
            let mut inner = self.inner.borrow_mut();
            inner.hold_depth = inner.hold_depth.saturating_sub(1);
            if !commit {
                inner.held.clear();
                return;
            }
            if inner.hold_depth > 0 {
                return;
            }
            std::mem::take(&mut inner.held)
        };
        for item in held {
            match item {
                Held::Event(event) => self.emit(event),
                Held::Call(call) => call(),
            }
        }
    }

    fn drain(&self) {
        loop {
            let (event, listeners) = {
                let mut inner = self.inner.borrow_mut();
                let Some(event) = inner.queue.pop_front() else {
                    inner.dispatching = false;
                    return;
                };
                if let Some(key) = event.property_key() {
                    inner.active.insert(key);
                }
                let listeners: Vec<Listener> = inner.listeners.iter().map(|(_, l)| l.clone()).collect();
                (event, listeners)
            };

            for listener in &listeners {
                listener(&event);
            }

            if let Some(key) = event.property_key() {
                self.inner.borrow_mut().active.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(node: i64, property: &str) -> GraphEvent {
        GraphEvent::NodePropertyChanged {
            node_id: NodeId(node),
            property: property.into(),
            old_value: Value::Null,
            new_value: Value::Bool(true),
        }
    }

    #[test]
    fn test_listeners_receive_events() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let id = bus.subscribe(move |e| sink.borrow_mut().push(e.clone()));

        bus.emit(GraphEvent::Cleared);
        assert!(bus.unsubscribe(id));
        bus.emit(GraphEvent::Configured);

        assert_eq!(*seen.borrow(), vec![GraphEvent::Cleared]);
    }

    #[test]
    fn test_reentrant_same_property_is_dropped() {
        let bus = EventBus::new();
        let count = Rc::new(RefCell::new(0));
        let inner_bus = bus.clone();
        let counter = count.clone();
        bus.subscribe(move |e| {
            *counter.borrow_mut() += 1;
            if let GraphEvent::NodePropertyChanged { property, .. } = e {
                if property == "title" {
                    inner_bus.emit(changed(1, "title"));
                    inner_bus.emit(changed(1, "mode"));
                }
            }
        });

        bus.emit(changed(1, "title"));
        // title once, then the queued mode change
        assert_eq!(*count.borrow(), 2);
    }

    #[test]
    fn test_hold_and_release() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(0));
        let sink = seen.clone();
        bus.subscribe(move |_| *sink.borrow_mut() += 1);

        bus.hold();
        bus.emit(GraphEvent::Cleared);
        assert_eq!(*seen.borrow(), 0);
        bus.release(false);
        assert_eq!(*seen.borrow(), 0);

        bus.hold();
        bus.emit(GraphEvent::Cleared);
        bus.emit(GraphEvent::Configured);
        bus.release(true);
        assert_eq!(*seen.borrow(), 2);
    }

    #[test]
    fn test_deferred_calls_follow_the_hold() {
        let bus = EventBus::new();
        let calls = Rc::new(RefCell::new(0));

        let counter = calls.clone();
        bus.defer(move || *counter.borrow_mut() += 1);
        assert_eq!(*calls.borrow(), 1);

        bus.hold();
        let counter = calls.clone();
        bus.defer(move || *counter.borrow_mut() += 1);
        bus.release(false);
        assert_eq!(*calls.borrow(), 1);

        bus.hold();
        let counter = calls.clone();
        bus.defer(move || *counter.borrow_mut() += 1);
        assert_eq!(*calls.borrow(), 1);
        bus.release(true);
        assert_eq!(*calls.borrow(), 2);
    }
}
