// SPDX-License-Identifier: MIT OR Apache-2.0
//! Graph documents and the codec between documents and [`Graph`].
//!
//! Two document shapes are read:
//!
//! - **legacy** (version `0.4`): flat `last_node_id`/`last_link_id`
//!   counters, links as `[id, origin_id, origin_slot, target_id,
//!   target_slot, type]` arrays, reroutes and link parents under `extra`.
//! - **current** (version `1`): a `state` object, link objects, top-level
//!   `reroutes` and subgraph definitions under `definitions.subgraphs`.
//!
//! Only the current shape is written. Slot link lists are always rebuilt
//! from the link table on load, so a document written by [`serialize`]
//! reads back into a graph that serializes to the same bytes.

use crate::events::{EventBus, GraphEvent};
use crate::graph::{Graph, GraphBody, GraphError, GraphState};
use crate::group::{Group, GroupId};
use crate::link::{Link, LinkId};
use crate::node::{Node, NodeFlags, NodeId, NodeMode, NodeRegistry, Widget};
use crate::reroute::{Reroute, RerouteId};
use crate::slot::{InputSlot, OutputSlot, SlotType};
use crate::subgraph::{IoNodeLayout, Subgraph, SubgraphId, SubgraphIo};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Version written into current documents
pub const DOCUMENT_VERSION: u32 = 1;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// Document is structurally invalid
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    /// Node type is neither registered nor a subgraph definition
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    /// JSON could not be parsed or did not match the document shape
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn malformed(err: GraphError) -> CodecError {
    CodecError::MalformedDocument(err.to_string())
}

/// A node as stored in a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialisedNode {
    /// Node id
    pub id: NodeId,
    /// Node type, or a subgraph id for subgraph nodes
    #[serde(rename = "type")]
    pub node_type: String,
    /// Position
    #[serde(default)]
    pub pos: [f64; 2],
    /// Size
    #[serde(default = "default_node_size")]
    pub size: [f64; 2],
    /// Flags
    #[serde(default)]
    pub flags: NodeFlags,
    /// Execution order hint
    #[serde(default)]
    pub order: u32,
    /// Mode
    #[serde(default)]
    pub mode: NodeMode,
    /// Input slots
    #[serde(default)]
    pub inputs: Vec<InputSlot>,
    /// Output slots
    #[serde(default)]
    pub outputs: Vec<OutputSlot>,
    /// Title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Properties
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Map<String, Value>,
    /// Widget values
    #[serde(default, skip_serializing_if = "WidgetValues::is_empty")]
    pub widgets_values: WidgetValues,
    /// Title bar colour
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Body colour
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bgcolor: Option<String>,
}

/// Widget values of a stored node: positional, or keyed by widget name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WidgetValues {
    /// Values in widget order
    List(Vec<Value>),
    /// Values keyed by widget name
    Map(Map<String, Value>),
}

impl Default for WidgetValues {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl WidgetValues {
    fn is_empty(&self) -> bool {
        match self {
            Self::List(values) => values.is_empty(),
            Self::Map(values) => values.is_empty(),
        }
    }
}

fn default_node_size() -> [f64; 2] {
    [140.0, 46.0]
}

/// A subgraph definition as stored in a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubgraphDocument {
    /// Definition id
    pub id: SubgraphId,
    /// Name
    #[serde(default)]
    pub name: String,
    /// Boundary inputs
    #[serde(default)]
    pub inputs: Vec<SubgraphIo>,
    /// Boundary outputs
    #[serde(default)]
    pub outputs: Vec<SubgraphIo>,
    /// Boundary input proxy layout
    pub input_node: IoNodeLayout,
    /// Boundary output proxy layout
    pub output_node: IoNodeLayout,
    /// Nodes
    #[serde(default)]
    pub nodes: Vec<SerialisedNode>,
    /// Links
    #[serde(default)]
    pub links: Vec<Link>,
    /// Groups
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<Group>,
    /// Reroutes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reroutes: Vec<Reroute>,
}

/// Shared definitions of a document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Definitions {
    /// Subgraph definitions
    #[serde(default)]
    pub subgraphs: Vec<SubgraphDocument>,
}

impl Definitions {
    fn is_empty(&self) -> bool {
        self.subgraphs.is_empty()
    }
}

/// Current (version 1) document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    /// Document id
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Revision
    #[serde(default)]
    pub revision: u64,
    /// Format version
    pub version: u32,
    /// Id counters
    pub state: GraphState,
    /// Groups
    #[serde(default)]
    pub groups: Vec<Group>,
    /// Nodes
    #[serde(default)]
    pub nodes: Vec<SerialisedNode>,
    /// Links
    #[serde(default)]
    pub links: Vec<Link>,
    /// Reroutes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reroutes: Vec<Reroute>,
    /// Free-form config
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
    /// Free-form extras
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
    /// Subgraph definitions
    #[serde(default, skip_serializing_if = "Definitions::is_empty")]
    pub definitions: Definitions,
}

/// Legacy link array: `[id, origin_id, origin_slot, target_id, target_slot, type]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyLink(
    pub LinkId,
    pub NodeId,
    pub usize,
    pub NodeId,
    pub usize,
    #[serde(default)] pub Option<SlotType>,
);

/// Parent reroute of a link, kept under `extra.linkExtensions` in legacy documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkExtension {
    /// Link id
    pub id: LinkId,
    /// Reroute nearest to the link's target
    #[serde(rename = "parentId")]
    pub parent_id: RerouteId,
}

/// Legacy (version 0.4) document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyDocument {
    /// Last node id handed out
    pub last_node_id: i64,
    /// Last link id handed out
    #[serde(default)]
    pub last_link_id: u32,
    /// Nodes
    #[serde(default)]
    pub nodes: Vec<SerialisedNode>,
    /// Links
    #[serde(default)]
    pub links: Vec<LegacyLink>,
    /// Groups
    #[serde(default)]
    pub groups: Vec<Group>,
    /// Free-form config
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Free-form extras, including `reroutes` and `linkExtensions`
    #[serde(default)]
    pub extra: Map<String, Value>,
    /// Format version
    #[serde(default)]
    pub version: Option<f64>,
}

/// A document of either shape
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    /// Version 0.4
    Legacy(LegacyDocument),
    /// Version 1
    Current(GraphDocument),
}

impl Document {
    /// Detect the shape of a JSON document and parse it
    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        let version = value.get("version");
        let legacy = match version.and_then(Value::as_f64) {
            Some(v) if v < 1.0 => true,
            Some(v) if v == f64::from(DOCUMENT_VERSION) => false,
            Some(v) => return Err(CodecError::MalformedDocument(format!("unsupported version {v}"))),
            None if version.is_some_and(|v| !v.is_null()) => {
                return Err(CodecError::MalformedDocument("version is not a number".into()));
            }
            None if value.get("state").is_some() => false,
            None if value.get("last_node_id").is_some() => true,
            None => {
                return Err(CodecError::MalformedDocument(
                    "neither a state object nor last_node_id".into(),
                ));
            }
        };
        if legacy {
            Ok(Document::Legacy(serde_json::from_value(value)?))
        } else {
            Ok(Document::Current(serde_json::from_value(value)?))
        }
    }

    /// Parse a JSON string
    pub fn from_json(json: &str) -> Result<Self, CodecError> {
        Self::from_value(serde_json::from_str(json)?)
    }

    /// Whether this is a legacy document
    pub fn is_legacy(&self) -> bool {
        matches!(self, Document::Legacy(_))
    }
}

/// Write a graph as a current document.
///
/// Only subgraph definitions reachable from the root are written.
pub fn serialize(graph: &Graph) -> GraphDocument {
    let subgraphs = graph
        .used_subgraph_ids()
        .into_iter()
        .filter_map(|id| graph.subgraph(id))
        .map(serialize_subgraph)
        .collect();
    let root = graph.root();
    GraphDocument {
        id: graph.id(),
        revision: graph.revision(),
        version: DOCUMENT_VERSION,
        state: *graph.state(),
        groups: root.groups().cloned().collect(),
        nodes: root.nodes().map(serialize_node).collect(),
        links: root.links().cloned().collect(),
        reroutes: root.reroutes().cloned().collect(),
        config: graph.config().clone(),
        extra: graph.extra().clone(),
        definitions: Definitions { subgraphs },
    }
}

/// Write a graph as pretty-printed JSON
pub fn to_json(graph: &Graph) -> Result<String, CodecError> {
    Ok(serde_json::to_string_pretty(&serialize(graph))?)
}

/// Read a graph from JSON text of either shape
pub fn from_json(json: &str, registry: &NodeRegistry) -> Result<Graph, CodecError> {
    deserialize(&Document::from_json(json)?, registry)
}

fn serialize_subgraph(subgraph: &Subgraph) -> SubgraphDocument {
    let body = subgraph.body();
    SubgraphDocument {
        id: subgraph.id,
        name: subgraph.name.clone(),
        inputs: subgraph.inputs().to_vec(),
        outputs: subgraph.outputs().to_vec(),
        input_node: subgraph.input_node().clone(),
        output_node: subgraph.output_node().clone(),
        nodes: body.nodes().map(serialize_node).collect(),
        links: body.links().cloned().collect(),
        groups: body.groups().cloned().collect(),
        reroutes: body.reroutes().cloned().collect(),
    }
}

pub(crate) fn serialize_node(node: &Node) -> SerialisedNode {
    SerialisedNode {
        id: node.id(),
        node_type: node.node_type().to_string(),
        pos: node.pos(),
        size: node.size(),
        flags: node.flags().clone(),
        order: node.order,
        mode: node.mode(),
        inputs: node.inputs().to_vec(),
        outputs: node.outputs().to_vec(),
        title: Some(node.title().to_string()),
        properties: node.properties().clone(),
        widgets_values: if node.widgets_by_name {
            WidgetValues::Map(node.widgets().iter().map(|w| (w.name.clone(), w.value.clone())).collect())
        } else {
            WidgetValues::List(node.widgets().iter().map(|w| w.value.clone()).collect())
        },
        color: node.color.clone(),
        bgcolor: node.bgcolor.clone(),
    }
}

/// Build a graph from a document.
///
/// Every node type must be registered in `registry` or name a subgraph
/// defined in the document. The result is validated before it is returned.
pub fn deserialize(document: &Document, registry: &NodeRegistry) -> Result<Graph, CodecError> {
    let mut graph = Graph::new();
    match document {
        Document::Current(doc) => load_current(&mut graph, doc, registry)?,
        Document::Legacy(doc) => load_legacy(&mut graph, doc, registry)?,
    }

    for scope in graph.scopes() {
        if let Ok(mut target) = graph.scope_mut(scope) {
            let body = &mut *target.body;
            for group in body.groups.values_mut() {
                group.recompute_members(body.nodes.values());
            }
        }
    }
    graph.validate().map_err(malformed)?;

    info!(
        nodes = graph.root().node_count(),
        links = graph.root().link_count(),
        subgraphs = graph.subgraphs().count(),
        legacy = document.is_legacy(),
        "loaded graph document"
    );
    Ok(graph)
}

/// Replace `graph` with the contents of a document.
///
/// `graph` is left untouched when loading fails. Subscribers of the old
/// event bus stay subscribed and receive [`GraphEvent::Configured`].
pub fn deserialize_into(graph: &mut Graph, document: &Document, registry: &NodeRegistry) -> Result<(), CodecError> {
    let mut loaded = deserialize(document, registry)?;
    loaded.attach_events(graph.events().clone());
    *graph = loaded;
    graph.events().emit(GraphEvent::Configured);
    Ok(())
}

fn load_current(graph: &mut Graph, doc: &GraphDocument, registry: &NodeRegistry) -> Result<(), CodecError> {
    graph.id = doc.id;
    graph.revision = doc.revision;
    graph.state = doc.state;
    graph.config = doc.config.clone();
    graph.extra = doc.extra.clone();

    let definitions: HashSet<SubgraphId> = doc.definitions.subgraphs.iter().map(|sg| sg.id).collect();
    let events = graph.events().clone();

    for def in &doc.definitions.subgraphs {
        let content = BodyContent {
            nodes: &def.nodes,
            links: &def.links,
            groups: &def.groups,
            reroutes: &def.reroutes,
        };
        let body = content.load(registry, &definitions, &events, &mut graph.state)?;
        let mut subgraph = Subgraph {
            id: def.id,
            name: def.name.clone(),
            inputs: def.inputs.clone(),
            outputs: def.outputs.clone(),
            input_node: def.input_node.clone(),
            output_node: def.output_node.clone(),
            body,
        };
        subgraph.relink().map_err(malformed)?;
        if graph.subgraphs.insert(def.id, subgraph).is_some() {
            return Err(CodecError::MalformedDocument(format!("subgraph {} is defined twice", def.id)));
        }
        debug!(subgraph = %def.id, nodes = def.nodes.len(), "loaded subgraph definition");
    }

    let content = BodyContent {
        nodes: &doc.nodes,
        links: &doc.links,
        groups: &doc.groups,
        reroutes: &doc.reroutes,
    };
    graph.root = content.load(registry, &definitions, &events, &mut graph.state)?;
    graph.root.relink(None).map_err(malformed)?;

    graph.state.raise_to(&graph.root);
    for sg in graph.subgraphs.values() {
        graph.state.raise_to(&sg.body);
    }
    Ok(())
}

fn load_legacy(graph: &mut Graph, doc: &LegacyDocument, registry: &NodeRegistry) -> Result<(), CodecError> {
    graph.state = GraphState {
        last_node_id: doc.last_node_id,
        last_link_id: doc.last_link_id,
        ..GraphState::default()
    };
    graph.config = doc.config.clone();

    let mut extra = doc.extra.clone();
    let reroutes: Vec<Reroute> = match extra.remove("reroutes") {
        Some(value) => serde_json::from_value(value)?,
        None => Vec::new(),
    };
    let extensions: Vec<LinkExtension> = match extra.remove("linkExtensions") {
        Some(value) => serde_json::from_value(value)?,
        None => Vec::new(),
    };
    graph.extra = extra;

    let mut links: Vec<Link> = doc
        .links
        .iter()
        .map(|LegacyLink(id, origin_id, origin_slot, target_id, target_slot, link_type)| {
            Link::new(
                *id,
                *origin_id,
                *origin_slot,
                *target_id,
                *target_slot,
                link_type.clone().unwrap_or_default(),
            )
        })
        .collect();
    for extension in &extensions {
        if let Some(link) = links.iter_mut().find(|l| l.id == extension.id) {
            link.parent_id = Some(extension.parent_id);
        }
    }

    let events = graph.events().clone();
    let content = BodyContent {
        nodes: &doc.nodes,
        links: &links,
        groups: &doc.groups,
        reroutes: &reroutes,
    };
    graph.root = content.load(registry, &HashSet::new(), &events, &mut graph.state)?;
    graph.root.relink(None).map_err(malformed)?;
    graph.state.raise_to(&graph.root);

    debug!(
        links = links.len(),
        reroutes = reroutes.len(),
        link_extensions = extensions.len(),
        "migrated legacy document"
    );
    Ok(())
}

/// Borrowed contents of one body in a document
struct BodyContent<'a> {
    nodes: &'a [SerialisedNode],
    links: &'a [Link],
    groups: &'a [Group],
    reroutes: &'a [Reroute],
}

impl BodyContent<'_> {
    fn load(
        &self,
        registry: &NodeRegistry,
        definitions: &HashSet<SubgraphId>,
        events: &EventBus,
        state: &mut GraphState,
    ) -> Result<GraphBody, CodecError> {
        let mut body = GraphBody::default();

        for stored in self.nodes {
            if !stored.id.is_assigned() {
                return Err(CodecError::MalformedDocument(format!("invalid node id {}", stored.id)));
            }
            let mut node = restore_node(stored, registry, definitions)?;
            node.attach(stored.id, events.clone());
            if body.nodes.insert(stored.id, node).is_some() {
                return Err(CodecError::MalformedDocument(format!("node {} appears twice", stored.id)));
            }
        }

        for link in self.links {
            if body.links.insert(link.id, link.clone()).is_some() {
                return Err(CodecError::MalformedDocument(format!("link {} appears twice", link.id)));
            }
        }

        for group in self.groups {
            let mut group = group.clone();
            // Legacy groups carry no id
            if group.id == GroupId::default() {
                group.id = state.next_group_id();
            }
            if body.groups.insert(group.id, group).is_some() {
                return Err(CodecError::MalformedDocument("group id appears twice".into()));
            }
        }

        for reroute in self.reroutes {
            if body.reroutes.insert(reroute.id, reroute.clone()).is_some() {
                return Err(CodecError::MalformedDocument(format!("reroute {} appears twice", reroute.id)));
            }
        }

        Ok(body)
    }
}

// A stored value with no declared widget
fn extra_widget(name: String, value: &Value) -> Widget {
    Widget {
        name,
        kind: "value".to_string(),
        value: value.clone(),
        options: Map::new(),
    }
}

pub(crate) fn restore_node(
    stored: &SerialisedNode,
    registry: &NodeRegistry,
    definitions: &HashSet<SubgraphId>,
) -> Result<Node, CodecError> {
    let mut node = if let Some(kind) = registry.get(&stored.node_type) {
        Node::from_kind(kind.clone())
    } else if let Some(subgraph_id) = stored
        .node_type
        .parse::<SubgraphId>()
        .ok()
        .filter(|id| definitions.contains(id))
    {
        let mut node = Node::new(stored.node_type.clone());
        node.subgraph = Some(subgraph_id);
        node
    } else {
        return Err(CodecError::UnknownNodeType(stored.node_type.clone()));
    };

    // Stored slots win; the kind only contributes the dynamic flags
    if !stored.inputs.is_empty() {
        let declared = std::mem::take(&mut node.inputs);
        node.inputs = stored
            .inputs
            .iter()
            .map(|slot| {
                let mut slot = slot.clone();
                slot.link = None;
                slot.dynamic = declared.iter().any(|d| d.dynamic && d.name == slot.name);
                slot
            })
            .collect();
    }
    if !stored.outputs.is_empty() {
        let declared = std::mem::take(&mut node.outputs);
        node.outputs = stored
            .outputs
            .iter()
            .map(|slot| {
                let mut slot = slot.clone();
                slot.links.clear();
                slot.dynamic = declared.iter().any(|d| d.dynamic && d.name == slot.name);
                slot
            })
            .collect();
    }

    match &stored.widgets_values {
        WidgetValues::List(values) => {
            for (index, value) in values.iter().enumerate() {
                match node.widgets.get_mut(index) {
                    Some(widget) => widget.value = value.clone(),
                    None => node.widgets.push(extra_widget(format!("widget_{index}"), value)),
                }
            }
        }
        WidgetValues::Map(values) => {
            for (name, value) in values {
                match node.widgets.iter_mut().find(|w| w.name == *name) {
                    Some(widget) => widget.value = value.clone(),
                    None => node.widgets.push(extra_widget(name.clone(), value)),
                }
            }
            node.widgets_by_name = true;
        }
    }

    let title = stored.title.clone().unwrap_or_else(|| node.title().to_string());
    node.restore_layout(title, stored.pos, stored.size);
    node.restore_state(stored.flags.clone(), stored.mode, stored.properties.clone());
    node.order = stored.order;
    node.color = stored.color.clone();
    node.bgcolor = stored.bgcolor.clone();
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphScope;
    use crate::link::SlotRef;
    use crate::node::{NodeKind, WidgetSpec};
    use crate::slot::SlotSpec;
    use serde_json::json;

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        registry.register(NodeKind::new("Loader").with_output(SlotSpec::new("MODEL", "MODEL")));
        registry.register(
            NodeKind::new("Sampler")
                .with_input(SlotSpec::new("model", "MODEL"))
                .with_output(SlotSpec::new("LATENT", "LATENT")),
        );
        registry
    }

    fn sample_graph(registry: &NodeRegistry) -> Graph {
        let mut graph = Graph::new();
        let mut root = graph.root_mut();
        let a = root.add_node(registry.create_node("Loader").unwrap());
        let b = root.add_node(registry.create_node("Sampler").unwrap().with_position(300.0, 40.0));
        root.connect(SlotRef::new(a, 0), SlotRef::new(b, 0)).unwrap();
        graph
    }

    #[test]
    fn test_version_detection() {
        let legacy = Document::from_value(json!({ "last_node_id": 0, "nodes": [], "links": [] })).unwrap();
        assert!(legacy.is_legacy());
        let versioned = Document::from_value(json!({ "version": 0.4, "last_node_id": 0 })).unwrap();
        assert!(versioned.is_legacy());
        let current = Document::from_value(json!({
            "version": 1,
            "state": { "lastNodeId": 0, "lastLinkId": 0, "lastGroupId": 0, "lastRerouteId": 0 },
        }))
        .unwrap();
        assert!(!current.is_legacy());
        assert!(matches!(
            Document::from_value(json!({ "nodes": [] })),
            Err(CodecError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_round_trip_is_stable() {
        let registry = registry();
        let graph = sample_graph(&registry);
        let first = to_json(&graph).unwrap();
        let reloaded = from_json(&first, &registry).unwrap();
        assert_eq!(to_json(&reloaded).unwrap(), first);
    }

    #[test]
    fn test_unknown_node_type() {
        let registry = registry();
        let graph = sample_graph(&registry);
        let json = to_json(&graph).unwrap();
        let err = from_json(&json, &NodeRegistry::new()).unwrap_err();
        assert!(matches!(err, CodecError::UnknownNodeType(t) if t == "Loader"));
    }

    #[test]
    fn test_dangling_link_is_malformed() {
        let doc = json!({
            "last_node_id": 1,
            "last_link_id": 1,
            "nodes": [{ "id": 1, "type": "Loader", "pos": [0, 0], "size": [140, 46],
                        "outputs": [{ "name": "MODEL", "type": "MODEL", "links": [1] }] }],
            "links": [[1, 1, 0, 9, 0, "MODEL"]],
        });
        let err = deserialize(&Document::from_value(doc).unwrap(), &registry()).unwrap_err();
        assert!(matches!(err, CodecError::MalformedDocument(_)));
    }

    #[test]
    fn test_legacy_reroutes_are_migrated() {
        let doc = json!({
            "last_node_id": 2,
            "last_link_id": 3,
            "nodes": [
                { "id": 1, "type": "Loader", "pos": [0, 0], "size": [140, 46],
                  "outputs": [{ "name": "MODEL", "type": "MODEL", "links": [3] }] },
                { "id": 2, "type": "Sampler", "pos": [300, 0], "size": [140, 66],
                  "inputs": [{ "name": "model", "type": "MODEL", "link": 3 }],
                  "outputs": [{ "name": "LATENT", "type": "LATENT", "links": null }] }
            ],
            "links": [[3, 1, 0, 2, 0, "MODEL"]],
            "extra": {
                "reroutes": [{ "id": 1, "pos": [150, 0], "linkIds": [3] }],
                "linkExtensions": [{ "id": 3, "parentId": 1 }],
                "ds": { "scale": 1.0 }
            },
            "version": 0.4
        });
        let graph = deserialize(&Document::from_value(doc).unwrap(), &registry()).unwrap();
        assert_eq!(graph.root().link(LinkId(3)).unwrap().parent_id, Some(RerouteId(1)));
        assert_eq!(graph.state().last_reroute_id, 1);
        assert!(graph.extra().contains_key("ds"));
        assert!(!graph.extra().contains_key("reroutes"));

        let written = serde_json::to_value(serialize(&graph)).unwrap();
        assert_eq!(written["version"], json!(1));
        assert_eq!(written["reroutes"][0]["linkIds"], json!([3]));
    }

    #[test]
    fn test_widget_values_keyed_by_name() {
        let mut registry = registry();
        registry.register(
            NodeKind::new("Seeded")
                .with_widget(WidgetSpec::new("seed", "number", json!(0)))
                .with_widget(WidgetSpec::new("steps", "number", json!(20))),
        );
        let doc = json!({
            "last_node_id": 1,
            "nodes": [{ "id": 1, "type": "Seeded", "pos": [0, 0], "size": [140, 66],
                        "widgets_values": { "seed": 5, "sampler": "euler" } }],
            "links": [],
            "version": 0.4
        });
        let graph = deserialize(&Document::from_value(doc).unwrap(), &registry).unwrap();
        let node = graph.root().node(NodeId(1)).unwrap();
        let values: Vec<(&str, &Value)> = node.widgets().iter().map(|w| (w.name.as_str(), &w.value)).collect();
        assert_eq!(
            values,
            vec![("seed", &json!(5)), ("steps", &json!(20)), ("sampler", &json!("euler"))]
        );

        let written = serde_json::to_value(serialize(&graph)).unwrap();
        assert_eq!(
            written["nodes"][0]["widgets_values"],
            json!({ "seed": 5, "steps": 20, "sampler": "euler" })
        );
        let json = to_json(&graph).unwrap();
        assert_eq!(to_json(&from_json(&json, &registry).unwrap()).unwrap(), json);
    }

    #[test]
    fn test_widget_values_stay_positional() {
        let mut registry = registry();
        registry.register(NodeKind::new("Seeded").with_widget(WidgetSpec::new("seed", "number", json!(0))));
        let mut graph = Graph::new();
        graph.root_mut().add_node(registry.create_node("Seeded").unwrap());

        let written = serde_json::to_value(serialize(&graph)).unwrap();
        assert_eq!(written["nodes"][0]["widgets_values"], json!([0]));
    }

    #[test]
    fn test_only_reachable_definitions_are_written() {
        let registry = registry();
        let mut graph = sample_graph(&registry);
        let ids: Vec<NodeId> = graph.root().node_ids().collect();
        graph.create_subgraph(GraphScope::Root, &ids[1..]).unwrap();
        graph.insert_subgraph(Subgraph::new("Unused")).unwrap();

        let doc = serialize(&graph);
        assert_eq!(doc.definitions.subgraphs.len(), 1);

        let reloaded = deserialize(&Document::Current(doc.clone()), &registry).unwrap();
        assert_eq!(serialize(&reloaded), doc);
    }

    #[test]
    fn test_deserialize_into_keeps_graph_on_failure() {
        let registry = registry();
        let mut graph = sample_graph(&registry);
        let doc = Document::from_value(json!({ "last_node_id": 1, "nodes": [{ "id": 1, "type": "Nope" }] })).unwrap();
        assert!(deserialize_into(&mut graph, &doc, &registry).is_err());
        assert_eq!(graph.root().node_count(), 2);
    }
}
