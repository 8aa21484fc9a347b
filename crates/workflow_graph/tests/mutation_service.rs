// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end behaviour of the mutation service.

use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;
use workflow_graph::serialization::to_json;
use workflow_graph::{
    Document, GraphEvent, GraphMutationOperation, GraphMutationService, GraphScope, MutationErrorKind, NodeId,
    NodeKind, NodeMode, NodeRegistry, OperationOutput, SlotRef, SlotSpec, SlotType,
};

fn registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    registry.register(NodeKind::new("CheckpointLoader").with_output(SlotSpec::new("MODEL", "MODEL")));
    registry.register(
        NodeKind::new("KSampler")
            .with_input(SlotSpec::new("model", "MODEL"))
            .with_output(SlotSpec::new("LATENT", "LATENT")),
    );
    registry.register(
        NodeKind::new("LoadImage")
            .with_output(SlotSpec::new("IMAGE", "IMAGE"))
            .with_output(SlotSpec::new("MASK", "MASK")),
    );
    registry.register(NodeKind::new("MaskToImage").with_input(SlotSpec::new("mask", "MASK")));
    registry.register(NodeKind::new("VAEDecode").with_input(SlotSpec::new("samples", "LATENT")));
    registry
}

/// Loader feeding a sampler whose latent goes to a decoder
fn pipeline(service: &mut GraphMutationService) -> (NodeId, NodeId, NodeId) {
    let loader = service.create_node("CheckpointLoader", [0.0, 0.0]).unwrap();
    let sampler = service.create_node("KSampler", [300.0, 0.0]).unwrap();
    let decoder = service.create_node("VAEDecode", [600.0, 0.0]).unwrap();
    service
        .connect(SlotRef::new(loader, 0), SlotRef::new(sampler, 0))
        .unwrap();
    service
        .connect(SlotRef::new(sampler, 0), SlotRef::new(decoder, 0))
        .unwrap();
    (loader, sampler, decoder)
}

#[test]
fn test_superseding_an_input_cleans_up_the_old_origin() {
    let mut service = GraphMutationService::new(registry());
    let first = service.create_node("CheckpointLoader", [0.0, 0.0]).unwrap();
    let second = service.create_node("CheckpointLoader", [0.0, 200.0]).unwrap();
    let sampler = service.create_node("KSampler", [300.0, 0.0]).unwrap();
    let old = service
        .connect(SlotRef::new(first, 0), SlotRef::new(sampler, 0))
        .unwrap();

    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    service.events().subscribe(move |e| sink.borrow_mut().push(e.clone()));

    let new = service
        .connect(SlotRef::new(second, 0), SlotRef::new(sampler, 0))
        .unwrap();

    let root = service.graph().root();
    assert!(root.link(old).is_none());
    assert!(root.node(first).unwrap().outputs()[0].links.is_empty());
    assert_eq!(root.node(second).unwrap().outputs()[0].links, vec![new]);
    assert_eq!(root.node(sampler).unwrap().inputs()[0].link, Some(new));
    assert!(events.borrow().contains(&GraphEvent::LinkSuperseded {
        scope: GraphScope::Root,
        target: SlotRef::new(sampler, 0),
        old_link: old,
        new_link: new,
    }));
}

#[test]
fn test_image_cannot_feed_mask() {
    let mut service = GraphMutationService::new(registry());
    let image = service.create_node("LoadImage", [0.0, 0.0]).unwrap();
    let convert = service.create_node("MaskToImage", [300.0, 0.0]).unwrap();

    let err = service
        .connect(SlotRef::new(image, 0), SlotRef::new(convert, 0))
        .unwrap_err();
    assert_eq!(err.kind, MutationErrorKind::IncompatibleTypes);
    assert_eq!(service.graph().root().link_count(), 0);

    service
        .connect(SlotRef::new(image, 1), SlotRef::new(convert, 0))
        .unwrap();
    assert_eq!(service.graph().root().link_count(), 1);
}

#[test]
fn test_undo_restores_identical_document() {
    let mut service = GraphMutationService::new(registry());
    let loader = service.create_node("CheckpointLoader", [0.0, 0.0]).unwrap();
    let sampler = service.create_node("KSampler", [300.0, 0.0]).unwrap();
    service
        .connect(SlotRef::new(loader, 0), SlotRef::new(sampler, 0))
        .unwrap();
    let before = to_json(service.graph()).unwrap();

    service.update_node_property(sampler, "seed", json!(42)).unwrap();
    service.remove_node(loader).unwrap();
    let after = to_json(service.graph()).unwrap();

    service.undo().unwrap();
    service.undo().unwrap();
    assert_eq!(to_json(service.graph()).unwrap(), before);

    service.redo().unwrap();
    service.redo().unwrap();
    assert_eq!(to_json(service.graph()).unwrap(), after);
    assert_eq!(
        service.redo().unwrap_err().kind,
        MutationErrorKind::NothingToRedo
    );
}

#[test]
fn test_create_then_unpack_subgraph_is_inverse() {
    let mut service = GraphMutationService::new(registry());
    let loader = service.create_node("CheckpointLoader", [0.0, 0.0]).unwrap();
    let sampler = service.create_node("KSampler", [300.0, 0.0]).unwrap();
    service
        .connect(SlotRef::new(loader, 0), SlotRef::new(sampler, 0))
        .unwrap();

    let (subgraph_id, instance) = service.create_subgraph(&[sampler]).unwrap();
    let definition = service.graph().subgraph(subgraph_id).unwrap();
    assert_eq!(definition.inputs().len(), 1);
    assert_eq!(definition.inputs()[0].slot_type, SlotType::new("MODEL"));
    assert_eq!(service.graph().root().node(instance).unwrap().inputs()[0].name, "model");

    let restored = service.unpack_subgraph(instance).unwrap();
    assert_eq!(restored, vec![sampler]);
    let root = service.graph().root();
    assert_eq!(root.node_count(), 2);
    assert!(root.links().any(|l| l.origin_id == loader && l.target_id == sampler));
    assert!(!service.graph().used_subgraph_ids().contains(&subgraph_id));
    assert!(service.document().definitions.subgraphs.is_empty());
}

#[test]
fn test_boundary_input_mirrors_to_instances() {
    let mut service = GraphMutationService::new(registry());
    let sampler = service.create_node("KSampler", [0.0, 0.0]).unwrap();
    let (subgraph_id, instance) = service.create_subgraph(&[sampler]).unwrap();

    let out = service
        .apply_operation(GraphMutationOperation::AddSubgraphInput {
            subgraph_id,
            name: "steps".into(),
            slot_type: SlotType::new("INT"),
        })
        .unwrap();
    let OperationOutput::Slot(index) = out else {
        panic!("expected a slot index, got {out:?}");
    };

    let node = service.graph().root().node(instance).unwrap();
    assert_eq!(node.inputs()[index].name, "steps");
    assert_eq!(node.inputs()[index].slot_type, SlotType::new("INT"));

    service.undo().unwrap();
    assert_eq!(
        service.graph().subgraph(subgraph_id).unwrap().inputs().len(),
        index
    );
}

#[test]
fn test_legacy_document_loads_and_upgrades() {
    let mut service = GraphMutationService::new(registry());
    let document = Document::from_value(json!({
        "last_node_id": 2,
        "last_link_id": 1,
        "nodes": [
            { "id": 1, "type": "CheckpointLoader", "pos": [0, 0], "size": [140, 46],
              "outputs": [{ "name": "MODEL", "type": "MODEL", "links": [1] }] },
            { "id": 2, "type": "KSampler", "pos": [300, 0], "size": [140, 66],
              "inputs": [{ "name": "model", "type": "MODEL", "link": 1 }],
              "outputs": [{ "name": "LATENT", "type": "LATENT", "links": [] }] }
        ],
        "links": [[1, 1, 0, 2, 0, "MODEL"]],
        "groups": [{ "title": "Models", "bounding": [-10, -40, 200, 120] }],
        "version": 0.4
    }))
    .unwrap();
    assert!(document.is_legacy());

    service.load(&document).unwrap();
    assert!(!service.history().can_undo());
    let doc = service.document();
    assert_eq!(doc.version, 1);
    assert_eq!(doc.links.len(), 1);
    assert_eq!(doc.groups.len(), 1);
    assert_ne!(doc.groups[0].id.0, 0);

    let next = service.create_node("KSampler", [600.0, 0.0]).unwrap();
    assert_eq!(next.0, 3);
}

#[test]
fn test_operations_inside_a_subgraph() {
    let mut service = GraphMutationService::new(registry());
    let sampler = service.create_node("KSampler", [0.0, 0.0]).unwrap();
    let (subgraph_id, _) = service.create_subgraph(&[sampler]).unwrap();

    service.enter_subgraph(subgraph_id).unwrap();
    let loader = service.create_node("CheckpointLoader", [-200.0, 0.0]).unwrap();
    service
        .connect(SlotRef::new(loader, 0), SlotRef::new(sampler, 0))
        .unwrap();
    let body = service.graph().subgraph(subgraph_id).unwrap().body();
    assert_eq!(body.node_count(), 2);
    assert_eq!(body.link_count(), 1);
    assert_eq!(service.graph().root().node_count(), 1);

    service.exit_to_root();
    assert_eq!(service.scope(), GraphScope::Root);
}

#[test]
fn test_fan_out_survives_create_and_unpack() {
    let mut service = GraphMutationService::new(registry());
    let loader = service.create_node("CheckpointLoader", [0.0, 0.0]).unwrap();
    let first = service.create_node("KSampler", [300.0, 0.0]).unwrap();
    let second = service.create_node("KSampler", [300.0, 200.0]).unwrap();
    let preview = service.create_node("VAEDecode", [600.0, 0.0]).unwrap();
    let save = service.create_node("VAEDecode", [600.0, 200.0]).unwrap();
    for sampler in [first, second] {
        service
            .connect(SlotRef::new(loader, 0), SlotRef::new(sampler, 0))
            .unwrap();
    }
    for decoder in [preview, save] {
        service
            .connect(SlotRef::new(first, 0), SlotRef::new(decoder, 0))
            .unwrap();
    }

    let (subgraph_id, instance) = service.create_subgraph(&[first, second]).unwrap();
    let definition = service.graph().subgraph(subgraph_id).unwrap();
    assert_eq!(definition.inputs().len(), 1);
    assert_eq!(definition.inputs()[0].link_ids.len(), 2);
    assert_eq!(definition.outputs().len(), 1);
    assert_eq!(definition.outputs()[0].link_ids.len(), 1);

    let root = service.graph().root();
    let node = root.node(instance).unwrap();
    assert!(node.inputs()[0].link.is_some());
    assert_eq!(node.outputs()[0].links.len(), 2);
    assert_eq!(root.link_count(), 3);

    let restored = service.unpack_subgraph(instance).unwrap();
    assert_eq!(restored, vec![first, second]);
    let root = service.graph().root();
    assert_eq!(root.link_count(), 4);
    for sampler in [first, second] {
        assert!(root.links().any(|l| l.origin_id == loader && l.target_id == sampler));
    }
    for decoder in [preview, save] {
        assert!(root.links().any(|l| l.origin_id == first && l.target_id == decoder));
    }
    service.graph().validate().unwrap();
}

#[test]
fn test_removing_a_boundary_output_shifts_every_instance() {
    let mut service = GraphMutationService::new(registry());
    let (_, sampler, decoder) = pipeline(&mut service);
    let (subgraph_id, first) = service.create_subgraph(&[sampler]).unwrap();
    service.copy_nodes(&[first]).unwrap();
    let second = service.paste_nodes(Some([300.0, 400.0])).unwrap()[0];

    let index = service
        .add_subgraph_output(subgraph_id, "preview", SlotType::new("LATENT"))
        .unwrap();
    assert_eq!(index, 1);
    let viewer = service.create_node("VAEDecode", [600.0, 400.0]).unwrap();
    service
        .connect(SlotRef::new(second, 1), SlotRef::new(viewer, 0))
        .unwrap();

    service.remove_subgraph_output(subgraph_id, 0).unwrap();

    let definition = service.graph().subgraph(subgraph_id).unwrap();
    assert_eq!(definition.outputs().len(), 1);
    assert_eq!(definition.outputs()[0].name, "preview");
    let root = service.graph().root();
    for id in [first, second] {
        let node = root.node(id).unwrap();
        assert_eq!(node.outputs().len(), 1);
        assert_eq!(node.outputs()[0].name, "preview");
    }
    assert_eq!(root.node(decoder).unwrap().inputs()[0].link, None);
    let kept = root.links().find(|l| l.target_id == viewer).unwrap();
    assert_eq!((kept.origin_id, kept.origin_slot), (second, 0));
    assert_eq!(root.node(second).unwrap().outputs()[0].links, vec![kept.id]);
}

#[test]
fn test_failed_boundary_edit_changes_nothing() {
    let mut service = GraphMutationService::new(registry());
    let (_, sampler, _) = pipeline(&mut service);
    let (subgraph_id, first) = service.create_subgraph(&[sampler]).unwrap();
    service.copy_nodes(&[first]).unwrap();
    service.paste_nodes(None).unwrap();

    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    service.events().subscribe(move |e| sink.borrow_mut().push(e.clone()));
    let before = to_json(service.graph()).unwrap();
    let depth = service.history().undo_depth();

    let err = service.remove_subgraph_input(subgraph_id, 3).unwrap_err();
    assert_eq!(err.kind, MutationErrorKind::SlotNotFound);
    assert_eq!(err.operation, "remove_subgraph_input");
    let err = service.remove_subgraph_node_output(sampler, 0).unwrap_err();
    assert_eq!(err.kind, MutationErrorKind::NodeNotFound);

    assert_eq!(to_json(service.graph()).unwrap(), before);
    assert_eq!(service.history().undo_depth(), depth);
    assert!(events.borrow().is_empty());
}

#[test]
fn test_undo_redo_across_create_subgraph_is_byte_identical() {
    let mut service = GraphMutationService::new(registry());
    let (_, sampler, _) = pipeline(&mut service);
    let before = to_json(service.graph()).unwrap();

    let (subgraph_id, _) = service.create_subgraph(&[sampler]).unwrap();
    let after = to_json(service.graph()).unwrap();

    service.undo().unwrap();
    assert_eq!(to_json(service.graph()).unwrap(), before);
    assert!(!service.graph().used_subgraph_ids().contains(&subgraph_id));

    service.redo().unwrap();
    assert_eq!(to_json(service.graph()).unwrap(), after);
    assert!(service.graph().used_subgraph_ids().contains(&subgraph_id));
}

#[test]
fn test_listener_writing_back_the_same_property() {
    let mut service = GraphMutationService::new(registry());
    let loader = service.create_node("CheckpointLoader", [0.0, 0.0]).unwrap();

    // A copy still reports on the service's bus
    let mirror = Rc::new(RefCell::new(service.graph().root().node(loader).unwrap().clone()));
    let writer = mirror.clone();
    service.events().subscribe(move |e| {
        if let GraphEvent::NodePropertyChanged { property, .. } = e {
            if property == "title" {
                let mut node = writer.borrow_mut();
                node.set_title("Echo");
                node.set_mode(NodeMode::Bypass);
            }
        }
    });
    let changes = Rc::new(RefCell::new(Vec::new()));
    let sink = changes.clone();
    service.events().subscribe(move |e| {
        if let GraphEvent::NodePropertyChanged { property, new_value, .. } = e {
            sink.borrow_mut().push((property.clone(), new_value.clone()));
        }
    });

    service.update_node_title(loader, "Checkpoint").unwrap();

    assert_eq!(
        *changes.borrow(),
        vec![
            ("title".to_string(), json!("Checkpoint")),
            ("mode".to_string(), json!(4)),
        ]
    );
    assert_eq!(service.graph().root().node(loader).unwrap().title(), "Checkpoint");
    assert_eq!(mirror.borrow().title(), "Echo");
}
