// SPDX-License-Identifier: MIT OR Apache-2.0
//! Property tests for link typing and the single-incoming rule.

use proptest::prelude::*;
use workflow_graph::slot::is_compatible;
use workflow_graph::{Graph, InputSlot, Node, NodeId, OutputSlot, SlotRef, SlotType};

const TYPES: &[&str] = &["*", "IMAGE", "image", "MASK", "LATENT", "IMAGE,MASK", "MASK, LATENT", "INT"];

fn slot_type() -> impl Strategy<Value = SlotType> {
    prop::sample::select(TYPES).prop_map(SlotType::new)
}

fn node(inputs: &[SlotType], outputs: &[SlotType]) -> Node {
    let mut node = Node::new("Fixture");
    for (i, ty) in inputs.iter().enumerate() {
        node = node.with_input(InputSlot::new(format!("in{i}"), ty.clone()));
    }
    for (i, ty) in outputs.iter().enumerate() {
        node = node.with_output(OutputSlot::new(format!("out{i}"), ty.clone()));
    }
    node
}

proptest! {
    #[test]
    fn test_wildcard_matches_everything(ty in slot_type()) {
        prop_assert!(is_compatible(&SlotType::wildcard(), &ty));
        prop_assert!(is_compatible(&ty, &SlotType::wildcard()));
    }

    #[test]
    fn test_compatibility_is_symmetric(a in slot_type(), b in slot_type()) {
        prop_assert_eq!(is_compatible(&a, &b), is_compatible(&b, &a));
    }

    #[test]
    fn test_every_input_keeps_at_most_one_link(
        layouts in prop::collection::vec(
            (prop::collection::vec(slot_type(), 1..3), prop::collection::vec(slot_type(), 1..3)),
            2..5,
        ),
        attempts in prop::collection::vec((0usize..8, 0usize..3, 0usize..8, 0usize..3), 1..40),
    ) {
        let mut graph = Graph::new();
        let mut ids: Vec<NodeId> = Vec::new();
        {
            let mut root = graph.root_mut();
            for (inputs, outputs) in &layouts {
                ids.push(root.add_node(node(inputs, outputs)));
            }
        }

        for (from, out_slot, to, in_slot) in attempts {
            let origin = ids[from % ids.len()];
            let target = ids[to % ids.len()];
            let (out_len, in_len) = {
                let root = graph.root();
                (
                    root.node(origin).map_or(0, |n| n.outputs().len()),
                    root.node(target).map_or(0, |n| n.inputs().len()),
                )
            };
            let origin = SlotRef::new(origin, out_slot % out_len);
            let target = SlotRef::new(target, in_slot % in_len);
            let origin_type = graph.root().node(origin.node_id).unwrap().outputs()[origin.slot].slot_type.clone();
            let target_type = graph.root().node(target.node_id).unwrap().inputs()[target.slot].slot_type.clone();

            let result = graph.root_mut().connect(origin, target);
            prop_assert_eq!(result.is_ok(), is_compatible(&origin_type, &target_type));
            graph.validate().unwrap();
        }

        let root = graph.root();
        for n in root.nodes() {
            for (index, input) in n.inputs().iter().enumerate() {
                let incoming = root
                    .links()
                    .filter(|l| l.target_id == n.id() && l.target_slot == index)
                    .count();
                prop_assert!(incoming <= 1);
                prop_assert_eq!(incoming == 1, input.link.is_some());
            }
        }
    }
}
