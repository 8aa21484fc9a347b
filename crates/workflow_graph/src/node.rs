// SPDX-License-Identifier: MIT OR Apache-2.0
//! Node definitions for the graph framework.
//!
//! Node behavior is not expressed by subtyping. Every node holds an
//! optional reference to a [`NodeKind`] looked up from a [`NodeRegistry`],
//! and delegates hook invocation to it.
//!
//! Tracked fields are private and written through setters that emit
//! [`GraphEvent::NodePropertyChanged`] on the bus the node is attached to.

use crate::events::{EventBus, GraphEvent};
use crate::measure::Rect;
use crate::slot::{InputSlot, OutputSlot, SlotDirection, SlotSpec};
use crate::subgraph::{Subgraph, SubgraphId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::rc::Rc;

/// Height of the title bar drawn above a node's position
pub const NODE_TITLE_HEIGHT: f64 = 30.0;

/// Id of the boundary input proxy inside a subgraph
pub const SUBGRAPH_INPUT_ID: NodeId = NodeId(-10);

/// Id of the boundary output proxy inside a subgraph
pub const SUBGRAPH_OUTPUT_ID: NodeId = NodeId(-20);

/// Unique identifier for a node within its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub i64);

impl NodeId {
    /// Placeholder for a node that has not been added to a graph yet
    pub const UNASSIGNED: NodeId = NodeId(-1);

    /// Whether this id names a real node (not a placeholder or a sentinel)
    pub fn is_assigned(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution mode of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum NodeMode {
    /// Always executes
    #[default]
    Always,
    /// Executes when an event arrives
    OnEvent,
    /// Muted
    Never,
    /// Executes on trigger
    OnTrigger,
    /// Passes inputs through to outputs
    Bypass,
}

impl From<NodeMode> for u8 {
    fn from(mode: NodeMode) -> Self {
        match mode {
            NodeMode::Always => 0,
            NodeMode::OnEvent => 1,
            NodeMode::Never => 2,
            NodeMode::OnTrigger => 3,
            NodeMode::Bypass => 4,
        }
    }
}

impl TryFrom<u8> for NodeMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Always),
            1 => Ok(Self::OnEvent),
            2 => Ok(Self::Never),
            3 => Ok(Self::OnTrigger),
            4 => Ok(Self::Bypass),
            other => Err(format!("invalid node mode {other}")),
        }
    }
}

/// Structural flags of a node.
///
/// A flag stays `None`, and is left out of documents, until it is first set
/// to a non-default value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFlags {
    /// Collapsed to its title bar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collapsed: Option<bool>,
    /// Cannot be moved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
}

/// An inline parameter control on a node
#[derive(Debug, Clone, PartialEq)]
pub struct Widget {
    /// Widget name
    pub name: String,
    /// Widget kind (`number`, `combo`, `text`, ...)
    pub kind: String,
    /// Current value
    pub value: Value,
    /// Kind-specific options
    pub options: Map<String, Value>,
}

/// Widget declaration in a node kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetSpec {
    /// Widget name
    pub name: String,
    /// Widget kind
    pub kind: String,
    /// Initial value
    #[serde(default)]
    pub default: Value,
    /// Kind-specific options
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl WidgetSpec {
    /// Declare a widget
    pub fn new(name: impl Into<String>, kind: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            default,
            options: Map::new(),
        }
    }

    /// Build a widget with the default value
    pub fn instantiate(&self) -> Widget {
        Widget {
            name: self.name.clone(),
            kind: self.kind.clone(),
            value: self.default.clone(),
            options: self.options.clone(),
        }
    }
}

/// A change in a node's connections, passed to `on_connections_change`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionChange {
    /// Side of the node the change happened on
    pub direction: SlotDirection,
    /// Slot index
    pub slot: usize,
    /// Whether the link was attached (`false` = detached)
    pub connected: bool,
    /// Link concerned
    pub link_id: crate::link::LinkId,
}

/// Hook called when a node is added to or removed from a graph
pub type NodeHook = Rc<dyn Fn(&Node)>;

/// Hook called when a node's connections change
pub type ConnectionHook = Rc<dyn Fn(&Node, &ConnectionChange)>;

/// Optional behavior attached to a node kind
#[derive(Clone, Default)]
pub struct NodeHooks {
    /// Called after a link is attached to or detached from the node
    pub on_connections_change: Option<ConnectionHook>,
    /// Called after the node is added to a graph
    pub on_added: Option<NodeHook>,
    /// Called after the node is removed from a graph
    pub on_removed: Option<NodeHook>,
}

impl fmt::Debug for NodeHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHooks")
            .field("on_connections_change", &self.on_connections_change.is_some())
            .field("on_added", &self.on_added.is_some())
            .field("on_removed", &self.on_removed.is_some())
            .finish()
    }
}

/// Node type definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeKind {
    /// Unique type identifier
    pub type_name: String,
    /// Display name, used as the default title
    #[serde(default)]
    pub display_name: String,
    /// Category path in the node library
    #[serde(default)]
    pub category: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Default input slots
    #[serde(default)]
    pub inputs: Vec<SlotSpec>,
    /// Default output slots
    #[serde(default)]
    pub outputs: Vec<SlotSpec>,
    /// Default widgets
    #[serde(default)]
    pub widgets: Vec<WidgetSpec>,
    /// Behavior hooks
    #[serde(skip)]
    pub hooks: NodeHooks,
}

impl NodeKind {
    /// Declare a kind with no slots
    pub fn new(type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            display_name: type_name.clone(),
            type_name,
            category: String::new(),
            description: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            widgets: Vec::new(),
            hooks: NodeHooks::default(),
        }
    }

    /// Add an input slot declaration
    pub fn with_input(mut self, spec: SlotSpec) -> Self {
        self.inputs.push(spec);
        self
    }

    /// Add an output slot declaration
    pub fn with_output(mut self, spec: SlotSpec) -> Self {
        self.outputs.push(spec);
        self
    }

    /// Add a widget declaration
    pub fn with_widget(mut self, spec: WidgetSpec) -> Self {
        self.widgets.push(spec);
        self
    }

    /// Attach behavior hooks
    pub fn with_hooks(mut self, hooks: NodeHooks) -> Self {
        self.hooks = hooks;
        self
    }

    fn title(&self) -> &str {
        if self.display_name.is_empty() {
            &self.type_name
        } else {
            &self.display_name
        }
    }
}

/// A node instance in the graph
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) node_type: String,
    title: String,
    pos: [f64; 2],
    size: [f64; 2],
    pub(crate) inputs: Vec<InputSlot>,
    pub(crate) outputs: Vec<OutputSlot>,
    pub(crate) widgets: Vec<Widget>,
    // Widget values were stored keyed by name
    pub(crate) widgets_by_name: bool,
    flags: NodeFlags,
    mode: NodeMode,
    pub(crate) order: u32,
    properties: Map<String, Value>,
    pub(crate) color: Option<String>,
    pub(crate) bgcolor: Option<String>,
    pub(crate) kind: Option<Rc<NodeKind>>,
    pub(crate) subgraph: Option<SubgraphId>,
    pub(crate) events: Option<EventBus>,
}

impl Node {
    /// Create a bare node of the given type, not yet added to a graph
    pub fn new(node_type: impl Into<String>) -> Self {
        let node_type = node_type.into();
        Self {
            id: NodeId::UNASSIGNED,
            title: node_type.clone(),
            node_type,
            pos: [0.0, 0.0],
            size: [140.0, 46.0],
            inputs: Vec::new(),
            outputs: Vec::new(),
            widgets: Vec::new(),
            widgets_by_name: false,
            flags: NodeFlags::default(),
            mode: NodeMode::Always,
            order: 0,
            properties: Map::new(),
            color: None,
            bgcolor: None,
            kind: None,
            subgraph: None,
            events: None,
        }
    }

    /// Create a node from a kind definition
    pub fn from_kind(kind: Rc<NodeKind>) -> Self {
        let mut node = Self::new(kind.type_name.clone());
        node.title = kind.title().to_string();
        node.inputs = kind.inputs.iter().map(SlotSpec::to_input).collect();
        node.outputs = kind.outputs.iter().map(SlotSpec::to_output).collect();
        node.widgets = kind.widgets.iter().map(WidgetSpec::instantiate).collect();
        node.size = default_size(node.inputs.len().max(node.outputs.len()) + node.widgets.len());
        node.kind = Some(kind);
        node
    }

    /// Create an instance node whose slots mirror a subgraph's boundary
    pub fn for_subgraph(subgraph: &Subgraph) -> Self {
        let mut node = Self::new(subgraph.id.to_string());
        node.title = subgraph.name.clone();
        node.inputs = subgraph
            .inputs
            .iter()
            .map(|io| {
                let mut slot = InputSlot::new(io.name.clone(), io.slot_type.clone());
                slot.label = io.label.clone();
                slot
            })
            .collect();
        node.outputs = subgraph
            .outputs
            .iter()
            .map(|io| {
                let mut slot = OutputSlot::new(io.name.clone(), io.slot_type.clone());
                slot.label = io.label.clone();
                slot
            })
            .collect();
        node.size = default_size(node.inputs.len().max(node.outputs.len()));
        node.subgraph = Some(subgraph.id);
        node
    }

    /// Set the position
    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.pos = [x, y];
        self
    }

    /// Set the title
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Append an input slot
    pub fn with_input(mut self, slot: InputSlot) -> Self {
        self.inputs.push(slot);
        self
    }

    /// Append an output slot
    pub fn with_output(mut self, slot: OutputSlot) -> Self {
        self.outputs.push(slot);
        self
    }

    /// Node id
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Type name (the subgraph id for subgraph nodes)
    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    /// Title
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Position of the body's top-left corner
    pub fn pos(&self) -> [f64; 2] {
        self.pos
    }

    /// Size of the body, excluding the title bar
    pub fn size(&self) -> [f64; 2] {
        self.size
    }

    /// Bounding box including the title bar
    pub fn bounding(&self) -> Rect {
        Rect::new(
            self.pos[0],
            self.pos[1] - NODE_TITLE_HEIGHT,
            self.size[0],
            self.size[1] + NODE_TITLE_HEIGHT,
        )
    }

    /// Input slots
    pub fn inputs(&self) -> &[InputSlot] {
        &self.inputs
    }

    /// Output slots
    pub fn outputs(&self) -> &[OutputSlot] {
        &self.outputs
    }

    /// Get an input slot by index
    pub fn input(&self, index: usize) -> Option<&InputSlot> {
        self.inputs.get(index)
    }

    /// Get an output slot by index
    pub fn output(&self, index: usize) -> Option<&OutputSlot> {
        self.outputs.get(index)
    }

    /// Widgets
    pub fn widgets(&self) -> &[Widget] {
        &self.widgets
    }

    /// Flags
    pub fn flags(&self) -> &NodeFlags {
        &self.flags
    }

    /// Whether the node is collapsed
    pub fn is_collapsed(&self) -> bool {
        self.flags.collapsed.unwrap_or(false)
    }

    /// Execution mode
    pub fn mode(&self) -> NodeMode {
        self.mode
    }

    /// Whether the node is bypassed
    pub fn is_bypassed(&self) -> bool {
        self.mode == NodeMode::Bypass
    }

    /// Free-form properties
    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    /// Kind this node was created from
    pub fn kind(&self) -> Option<&NodeKind> {
        self.kind.as_deref()
    }

    /// Subgraph this node instantiates
    pub fn subgraph_id(&self) -> Option<SubgraphId> {
        self.subgraph
    }

    /// Whether this node is a subgraph instance
    pub fn is_subgraph_node(&self) -> bool {
        self.subgraph.is_some()
    }

    /// Whether any slot's type follows its connected peers
    pub fn has_dynamic_slots(&self) -> bool {
        self.inputs.iter().any(|s| s.dynamic) || self.outputs.iter().any(|s| s.dynamic)
    }

    /// Set the title. Always notifies.
    pub fn set_title(&mut self, title: impl Into<String>) {
        let old = std::mem::replace(&mut self.title, title.into());
        self.notify("title", Value::from(old), Value::from(self.title.clone()));
    }

    /// Set the execution mode. Always notifies.
    pub fn set_mode(&mut self, mode: NodeMode) {
        let old = std::mem::replace(&mut self.mode, mode);
        self.notify("mode", Value::from(u8::from(old)), Value::from(u8::from(mode)));
    }

    /// Set the position. Always notifies.
    pub fn set_position(&mut self, pos: [f64; 2]) {
        let old = std::mem::replace(&mut self.pos, pos);
        self.notify("pos", pair(old), pair(pos));
    }

    /// Set the size. Always notifies.
    pub fn set_size(&mut self, size: [f64; 2]) {
        let old = std::mem::replace(&mut self.size, size);
        self.notify("size", pair(old), pair(size));
    }

    /// Collapse or expand. Notifies only on change.
    pub fn set_collapsed(&mut self, collapsed: bool) {
        let old = self.flags.collapsed.unwrap_or(false);
        if old == collapsed {
            return;
        }
        self.flags.collapsed = Some(collapsed);
        self.notify("flags.collapsed", Value::Bool(old), Value::Bool(collapsed));
    }

    /// Pin or unpin. Notifies only on change.
    pub fn set_pinned(&mut self, pinned: bool) {
        let old = self.flags.pinned.unwrap_or(false);
        if old == pinned {
            return;
        }
        self.flags.pinned = Some(pinned);
        self.notify("flags.pinned", Value::Bool(old), Value::Bool(pinned));
    }

    /// Set a free-form property. Notifies only on change.
    pub fn set_property(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let old = self.properties.get(&key).cloned().unwrap_or(Value::Null);
        if old == value {
            return;
        }
        self.properties.insert(key.clone(), value.clone());
        self.notify(&format!("properties.{key}"), old, value);
    }

    /// Set a widget value by name. Notifies only on change.
    ///
    /// Returns `false` if the node has no widget with that name.
    pub fn set_widget_value(&mut self, name: &str, value: Value) -> bool {
        let Some(widget) = self.widgets.iter_mut().find(|w| w.name == name) else {
            return false;
        };
        if widget.value == value {
            return true;
        }
        let old = std::mem::replace(&mut widget.value, value.clone());
        self.notify(&format!("widgets.{name}"), old, value);
        true
    }

    // Untracked writes used when restoring a node from a document
    pub(crate) fn restore_layout(&mut self, title: String, pos: [f64; 2], size: [f64; 2]) {
        self.title = title;
        self.pos = pos;
        self.size = size;
    }

    pub(crate) fn restore_state(&mut self, flags: NodeFlags, mode: NodeMode, properties: Map<String, Value>) {
        self.flags = flags;
        self.mode = mode;
        self.properties = properties;
    }

    pub(crate) fn translate(&mut self, dx: f64, dy: f64) {
        self.pos = [self.pos[0] + dx, self.pos[1] + dy];
    }

    pub(crate) fn attach(&mut self, id: NodeId, events: EventBus) {
        self.id = id;
        self.events = Some(events);
    }

    pub(crate) fn fire_connection_change(&self, change: ConnectionChange) {
        if let Some(hook) = self.kind.as_ref().and_then(|k| k.hooks.on_connections_change.clone()) {
            self.run_hook(move |node| hook(node, &change));
        }
    }

    pub(crate) fn fire_added(&self) {
        if let Some(hook) = self.kind.as_ref().and_then(|k| k.hooks.on_added.clone()) {
            self.run_hook(move |node| hook(node));
        }
    }

    pub(crate) fn fire_removed(&self) {
        if let Some(hook) = self.kind.as_ref().and_then(|k| k.hooks.on_removed.clone()) {
            self.run_hook(move |node| hook(node));
        }
    }

    // Hooks see the node as it was when they were triggered
    fn run_hook(&self, hook: impl FnOnce(&Node) + 'static) {
        match &self.events {
            Some(events) => {
                let node = self.clone();
                events.defer(move || hook(&node));
            }
            None => hook(self),
        }
    }

    fn notify(&self, property: &str, old_value: Value, new_value: Value) {
        if let Some(events) = &self.events {
            events.emit(GraphEvent::NodePropertyChanged {
                node_id: self.id,
                property: property.to_string(),
                old_value,
                new_value,
            });
        }
    }
}

fn pair(v: [f64; 2]) -> Value {
    Value::from(vec![v[0], v[1]])
}

fn default_size(rows: usize) -> [f64; 2] {
    [140.0, 26.0 + 20.0 * rows.max(1) as f64]
}

/// Registry of available node kinds.
///
/// Injected into the codec and the mutation service; the engine never
/// registers kinds on its own.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    /// Registered kinds by type name
    kinds: IndexMap<String, Rc<NodeKind>>,
}

/// On-disk catalog of node kinds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeCatalog {
    /// Kinds in registration order
    pub kinds: Vec<NodeKind>,
}

impl NodeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a RON catalog
    pub fn from_ron(source: &str) -> Result<Self, ron::error::SpannedError> {
        let catalog: NodeCatalog = ron::from_str(source)?;
        let mut registry = Self::new();
        for kind in catalog.kinds {
            registry.register(kind);
        }
        Ok(registry)
    }

    /// Register a kind, replacing any kind with the same name
    pub fn register(&mut self, kind: NodeKind) {
        self.kinds.insert(kind.type_name.clone(), Rc::new(kind));
    }

    /// Get a kind by type name
    pub fn get(&self, type_name: &str) -> Option<&Rc<NodeKind>> {
        self.kinds.get(type_name)
    }

    /// Check if a type name is registered
    pub fn contains(&self, type_name: &str) -> bool {
        self.kinds.contains_key(type_name)
    }

    /// Get all registered kinds
    pub fn kinds(&self) -> impl Iterator<Item = &NodeKind> {
        self.kinds.values().map(|k| k.as_ref())
    }

    /// Get kinds by category
    pub fn kinds_in_category<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a NodeKind> {
        self.kinds().filter(move |k| k.category == category)
    }

    /// Create a node from a type name
    pub fn create_node(&self, type_name: &str) -> Option<Node> {
        self.get(type_name).cloned().map(Node::from_kind)
    }
}
