use proptest::prelude::*;

use trellis_core::event::ValueChangeEvent;
use trellis_core::model::{SchemaBuilder, TypeDef, Value};
use trellis_core::{GraphContext, GraphEvent, GraphTransaction, InstanceId, InstanceRef};

const NODES: usize = 6;

fn context() -> (GraphContext, Vec<InstanceId>) {
    let mut builder = SchemaBuilder::new();
    builder
        .add(TypeDef::new("Node").value("name").list("children", "Node"))
        .unwrap();
    let mut ctx = GraphContext::new(builder.build().unwrap());
    let nodes = (0..NODES).map(|_| ctx.create("Node").unwrap()).collect();
    (ctx, nodes)
}

fn reachable(edges: &[(usize, usize)]) -> Vec<String> {
    let (mut ctx, nodes) = context();
    for &(parent, child) in edges {
        ctx.list_add(nodes[parent], "children", nodes[child]).unwrap();
    }
    let path = ctx.path("Node", "children.children.name").unwrap();
    let mut ids: Vec<_> = ctx
        .get_graph(&path, nodes[0])
        .unwrap()
        .into_iter()
        .map(|handle| ctx.instance(handle).unwrap().id().to_string())
        .collect();
    ids.sort();
    ids
}

fn edges() -> impl Strategy<Value = Vec<(usize, usize)>> {
    prop::collection::vec((0..NODES, 0..NODES), 0..16).prop_map(|mut edges| {
        edges.retain(|(parent, child)| parent != child);
        edges.sort();
        edges.dedup();
        edges
    })
}

fn value_change() -> impl Strategy<Value = GraphEvent> {
    (0..3u8, prop::bool::ANY, 0..4i64, 0..4i64).prop_map(|(id, named, old, new)| {
        GraphEvent::ValueChange(ValueChangeEvent {
            instance: InstanceRef::new("Node", id.to_string()),
            property: if named { "name" } else { "rank" }.to_string(),
            old_value: Value::from(old),
            new_value: Value::from(new),
        })
    })
}

proptest! {
    #[test]
    fn get_graph_ignores_edge_insertion_order(
        (edges, shuffled) in edges().prop_flat_map(|edges| (Just(edges.clone()), Just(edges).prop_shuffle()))
    ) {
        prop_assert_eq!(reachable(&edges), reachable(&shuffled));
    }

    #[test]
    fn condense_is_idempotent(events in prop::collection::vec(value_change(), 0..24)) {
        let mut once = GraphTransaction::from_events(events);
        once.condense();
        let mut twice = GraphTransaction::from_events(once.events().to_vec());
        twice.condense();
        prop_assert_eq!(once.events(), twice.events());
        prop_assert!(once.events().iter().all(GraphEvent::is_valid));
    }
}
