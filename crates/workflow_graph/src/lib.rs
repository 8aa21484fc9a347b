// SPDX-License-Identifier: MIT OR Apache-2.0
//! Node graph engine for the workflow editor.
//!
//! This crate holds the document model behind the editor canvas:
//! - Nodes with typed input/output slots and widgets
//! - Links with single-incoming inputs and wildcard/union type matching
//! - Reroute chains, groups and nested subgraph definitions
//! - Versioned JSON documents with a legacy (v0.4) reader
//! - A transactional mutation service with undo/redo
//!
//! ## Architecture
//!
//! [`Graph`] owns a root [`GraphBody`] and every subgraph definition. Bodies
//! are addressed through a [`GraphScope`]; [`Graph::scope_mut`] yields a
//! [`graph::ScopeMut`] that performs the low-level edits and emits
//! [`GraphEvent`]s. Hosts normally go through [`GraphMutationService`],
//! which stages every edit on a clone, validates it and records it in the
//! [`History`].

pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod group;
pub mod history;
pub mod link;
pub mod measure;
pub mod mutation;
pub mod node;
pub mod operations;
pub mod reroute;
pub mod serialization;
pub mod slot;
pub mod subgraph;

pub use config::{ConfigError, EngineConfig};
pub use error::{GraphMutationError, MutationErrorKind};
pub use events::{EventBus, GraphEvent, ListenerId};
pub use graph::{Graph, GraphBody, GraphError, GraphScope, GraphState};
pub use group::{Group, GroupId};
pub use history::{History, HistoryError, StateSnapshot};
pub use link::{Link, LinkId, LinkSegment, SlotRef};
pub use measure::Rect;
pub use mutation::{Clipboard, GraphMutationService};
pub use node::{Node, NodeId, NodeKind, NodeMode, NodeRegistry};
pub use operations::{GraphMutationOperation, OperationOutput};
pub use reroute::{Reroute, RerouteId};
pub use serialization::{CodecError, Document, GraphDocument, DOCUMENT_VERSION};
pub use slot::{InputSlot, OutputSlot, SlotDirection, SlotSpec, SlotType};
pub use subgraph::{Subgraph, SubgraphId, SubgraphIo};
