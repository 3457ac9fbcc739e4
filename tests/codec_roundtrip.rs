use irohmap::codec::{decode, encode};
use irohmap::feature::{Coord, Feature, FeatureId, Geometry, Properties};
use irohmap::store::{Document, JsonNode, NodeHandle, Store};
use proptest::prelude::*;
use serde_json::{json, Value as JsonValue};

fn coord() -> impl Strategy<Value = Coord> {
    (-180.0f64..180.0, -90.0f64..90.0).prop_map(|(x, y)| Coord::new(x, y))
}

fn geometry() -> impl Strategy<Value = Geometry> {
    prop_oneof![
        coord().prop_map(Geometry::Point),
        prop::collection::vec(coord(), 1..12).prop_map(Geometry::LineString),
    ]
}

fn leaf() -> impl Strategy<Value = JsonValue> {
    prop_oneof![
        Just(JsonValue::Null),
        any::<bool>().prop_map(JsonValue::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        (-1e6f64..1e6).prop_map(|n| json!(n)),
        "[a-z ]{0,12}".prop_map(JsonValue::String),
    ]
}

fn properties() -> impl Strategy<Value = Properties> {
    let value = leaf().prop_recursive(2, 8, 4, |inner| {
        prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
            .prop_map(|m| JsonValue::Object(m.into_iter().collect()))
    });
    prop::collection::btree_map("[a-z]{1,6}", value, 0..5).prop_map(|m| m.into_iter().collect())
}

fn feature() -> impl Strategy<Value = Feature> {
    ("[a-zA-Z0-9_-]{1,16}", properties(), geometry())
        .prop_map(|(id, props, geometry)| Feature::new(id, geometry).with_properties(props))
}

proptest! {
    #[test]
    fn decode_inverts_encode_over_plain_json(f in feature()) {
        let encoded = encode(&f).unwrap();
        let decoded = tokio_test::block_on(decode(&f.id, &JsonNode::new(encoded))).unwrap();
        prop_assert_eq!(decoded, f);
    }

    #[test]
    fn decode_inverts_encode_through_the_store(f in feature()) {
        let decoded = tokio_test::block_on(async {
            let store = Store::new(Document::new(&["features"]).unwrap());
            let node = store.collection("features").get(f.id.as_str());
            node.put(encode(&f).unwrap()).await.unwrap();
            decode(&f.id, &node).await.unwrap()
        });
        prop_assert_eq!(decoded, f);
    }
}

#[test]
fn line_with_gap_decodes_up_to_the_gap() {
    let node = JsonNode::new(json!({
        "properties": {},
        "geometry": {
            "type": "LineString",
            "coordinates": {
                "0": {"x": 0.0, "y": 0.0},
                "1": {"x": 1.0, "y": 1.0},
                "3": {"x": 3.0, "y": 3.0}
            }
        }
    }));
    let feature = tokio_test::block_on(decode(&FeatureId::from("gap"), &node)).unwrap();
    assert_eq!(
        feature.geometry,
        Geometry::LineString(vec![Coord::new(0.0, 0.0), Coord::new(1.0, 1.0)])
    );
}
