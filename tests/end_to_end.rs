//! Two replicas exchanging features: gestures on one side show up on the
//! other side's surface.

use std::sync::Arc;
use std::time::Duration;

use irohmap::bridge::parse_event;
use irohmap::codec::encode;
use irohmap::feature::{Coord, Feature, FeatureId, Geometry};
use irohmap::store::{Document, NodeHandle, Store};
use irohmap::surface::{DrawingSurface, MemorySurface};
use irohmap::{EditPublisher, FeatureWatcher};
use serde_json::json;
use tokio::sync::Mutex;

const COLLECTION: &str = "map-features";

fn replica() -> Store {
    Store::new(Document::new(&[COLLECTION]).unwrap())
}

async fn ship(from: &Store, to: &Store) -> usize {
    let mut doc = from.snapshot().await;
    to.merge_remote(&mut doc).await.unwrap()
}

/// Poll until the surface satisfies `check`
async fn eventually<F>(surface: &Arc<Mutex<MemorySurface>>, check: F)
where
    F: Fn(&MemorySurface) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if check(&*surface.lock().await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[test]
fn point_encodes_to_the_documented_layout() {
    let mut properties = serde_json::Map::new();
    properties.insert("color".into(), json!("red"));
    let feature = Feature::new("f1", Geometry::Point(Coord::new(10.5, 20.25))).with_properties(properties);

    assert_eq!(
        encode(&feature).unwrap(),
        json!({
            "properties": {"color": "red"},
            "geometry": {"type": "Point", "coordinates": {"x": 10.5, "y": 20.25}}
        })
    );

    let geojson = serde_json::to_value(feature.to_geojson()).unwrap();
    assert_eq!(geojson["type"], "Feature");
    assert_eq!(geojson["id"], "f1");
    assert_eq!(geojson["properties"], json!({"color": "red"}));
    assert_eq!(geojson["geometry"], json!({"type": "Point", "coordinates": [10.5, 20.25]}));
}

#[test]
fn three_vertex_line_uses_index_keys() {
    let feature = Feature::new(
        "l1",
        Geometry::LineString(vec![
            Coord::new(0.0, 0.0),
            Coord::new(1.0, 1.0),
            Coord::new(2.0, 0.0),
        ]),
    );
    let encoded = encode(&feature).unwrap();
    assert_eq!(
        encoded["geometry"]["coordinates"],
        json!({
            "0": {"x": 0.0, "y": 0.0},
            "1": {"x": 1.0, "y": 1.0},
            "2": {"x": 2.0, "y": 0.0}
        })
    );
}

#[tokio::test]
async fn gestures_replicate_to_a_peer_surface() {
    let alice = replica();
    let bob = replica();

    let publisher = EditPublisher::new(alice.collection(COLLECTION));

    let bob_features = bob.collection(COLLECTION);
    let surface = Arc::new(Mutex::new(MemorySurface::new()));
    let subscription = bob_features.subscribe().await.unwrap();
    let cancel = subscription.cancel_handle();
    let watcher = FeatureWatcher::new(bob_features.clone(), Arc::clone(&surface));
    let task = tokio::spawn(watcher.run(subscription));

    let create = parse_event(
        &json!({
            "type": "draw.create",
            "features": [{
                "type": "Feature",
                "id": "f1",
                "properties": {"color": "red"},
                "geometry": {"type": "Point", "coordinates": [10.5, 20.25]}
            }, {
                "type": "Feature",
                "id": "road",
                "properties": {},
                "geometry": {"type": "LineString", "coordinates": [[0.0, 0.0], [1.0, 1.0], [2.0, 0.0]]}
            }]
        })
        .to_string(),
    )
    .unwrap();
    assert_eq!(publisher.handle(&create).await, 2);
    assert_eq!(ship(&alice, &bob).await, 2);

    eventually(&surface, |s| s.len() == 2).await;
    {
        let surface = surface.lock().await;
        let point = surface.get(&FeatureId::from("f1")).unwrap();
        assert_eq!(point.geometry, Geometry::Point(Coord::new(10.5, 20.25)));
        assert_eq!(point.properties["color"], "red");
        let road = surface.get(&FeatureId::from("road")).unwrap();
        assert!(matches!(&road.geometry, Geometry::LineString(v) if v.len() == 3));
    }

    let delete = parse_event(
        &json!({
            "type": "draw.delete",
            "features": [{
                "type": "Feature",
                "id": "f1",
                "properties": {},
                "geometry": {"type": "Point", "coordinates": [10.5, 20.25]}
            }]
        })
        .to_string(),
    )
    .unwrap();
    assert_eq!(publisher.handle(&delete).await, 1);
    assert_eq!(ship(&alice, &bob).await, 1);

    eventually(&surface, |s| !s.has_id(&FeatureId::from("f1"))).await;

    // The deleted key stays behind as a tombstone
    let entry = bob_features.get("f1").once().await.unwrap();
    assert!(entry.is_some_and(|e| e.is_tombstone()));

    cancel.cancel();
    let report = task.await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(report.removed, 1);
    assert_eq!(report.skipped, 0);
}

#[tokio::test]
async fn concurrent_edits_on_both_sides_converge() {
    let alice = replica();
    let bob = replica();

    alice
        .collection(COLLECTION)
        .get("a")
        .put(encode(&Feature::new("a", Geometry::Point(Coord::new(1.0, 1.0)))).unwrap())
        .await
        .unwrap();
    bob.collection(COLLECTION)
        .get("b")
        .put(encode(&Feature::new("b", Geometry::Point(Coord::new(2.0, 2.0)))).unwrap())
        .await
        .unwrap();

    ship(&alice, &bob).await;
    ship(&bob, &alice).await;

    for store in [&alice, &bob] {
        let features = store.collection(COLLECTION);
        assert!(features.get("a").once().await.unwrap().is_some());
        assert!(features.get("b").once().await.unwrap().is_some());
    }
}
