//! Writes local drawing gestures into the shared collection.
//!
//! Writes are fire-and-forget: nothing waits for peers to acknowledge them
//! and failed writes are not retried. A feature that cannot be encoded is
//! logged and skipped without affecting the rest of its gesture.

use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::codec;
use crate::feature::FeatureId;
use crate::store::{Collection, NodeHandle};
use crate::surface::DrawEvent;

pub struct EditPublisher {
    collection: Collection,
}

impl EditPublisher {
    pub fn new(collection: Collection) -> Self {
        Self { collection }
    }

    /// Handle one gesture, returning the number of store writes made
    pub async fn handle(&self, event: &DrawEvent) -> usize {
        match event {
            DrawEvent::Create { features } => {
                debug!(count = features.len(), "draw.create");
                self.publish_all(features).await
            }
            DrawEvent::Update { features, action } => {
                debug!(count = features.len(), ?action, "draw.update");
                self.publish_all(features).await
            }
            DrawEvent::Delete { features } => {
                debug!(count = features.len(), "draw.delete");
                let mut written = 0;
                for feature in features {
                    match FeatureId::from_geojson(feature) {
                        Ok(id) => written += self.write(&id, JsonValue::Null).await,
                        Err(err) => warn!(%err, "cannot delete feature without an id"),
                    }
                }
                written
            }
            // Combining is not persisted; the surface reports the resulting
            // creates and deletes only through these events.
            DrawEvent::Combine {
                deleted_features,
                created_features,
            }
            | DrawEvent::Uncombine {
                deleted_features,
                created_features,
            } => {
                info!(
                    event = event.name(),
                    deleted = deleted_features.len(),
                    created = created_features.len(),
                    "observed, not persisted"
                );
                0
            }
        }
    }

    async fn publish_all(&self, features: &[geojson::Feature]) -> usize {
        let mut written = 0;
        for feature in features {
            match codec::encode_geojson(feature) {
                Ok((id, node)) => written += self.write(&id, node).await,
                Err(err) => warn!(%err, "skipping feature that failed to encode"),
            }
        }
        written
    }

    async fn write(&self, id: &FeatureId, value: JsonValue) -> usize {
        match self.collection.get(id.as_str()).put(value).await {
            Ok(()) => 1,
            Err(err) => {
                warn!(%id, %err, "store write failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Document, Scalar, Shallow, Store};
    use serde_json::json;

    fn setup() -> (Store, EditPublisher) {
        let store = Store::new(Document::new(&["map-features"]).unwrap());
        let publisher = EditPublisher::new(store.collection("map-features"));
        (store, publisher)
    }

    fn event(value: JsonValue) -> DrawEvent {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn create_writes_each_feature_at_its_id() {
        let (store, publisher) = setup();
        let written = publisher
            .handle(&event(json!({
                "type": "draw.create",
                "features": [
                    {"type": "Feature", "id": "p", "properties": {},
                     "geometry": {"type": "Point", "coordinates": [1.0, 2.0]}},
                    {"type": "Feature", "id": "l", "properties": {},
                     "geometry": {"type": "LineString", "coordinates": [[0.0, 0.0], [1.0, 1.0]]}}
                ]
            })))
            .await;
        assert_eq!(written, 2);

        let features = store.collection("map-features");
        assert!(matches!(features.get("p").once().await.unwrap(), Some(Shallow::Node(_))));
        assert!(matches!(features.get("l").once().await.unwrap(), Some(Shallow::Node(_))));
    }

    #[tokio::test]
    async fn polygon_is_skipped_without_a_write() {
        let (store, publisher) = setup();
        let written = publisher
            .handle(&event(json!({
                "type": "draw.create",
                "features": [
                    {"type": "Feature", "id": "poly", "properties": {},
                     "geometry": {"type": "Polygon",
                                  "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]}},
                    {"type": "Feature", "id": "ok", "properties": {},
                     "geometry": {"type": "Point", "coordinates": [0.0, 0.0]}}
                ]
            })))
            .await;
        assert_eq!(written, 1);
        let features = store.collection("map-features");
        assert_eq!(features.get("poly").once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_writes_tombstone_and_keeps_key() {
        let (store, publisher) = setup();
        let point = json!({"type": "Feature", "id": "p", "properties": {},
                           "geometry": {"type": "Point", "coordinates": [1.0, 2.0]}});
        publisher
            .handle(&event(json!({"type": "draw.create", "features": [point.clone()]})))
            .await;
        let written = publisher
            .handle(&event(json!({"type": "draw.delete", "features": [point]})))
            .await;
        assert_eq!(written, 1);

        let features = store.collection("map-features");
        assert_eq!(
            features.get("p").once().await.unwrap(),
            Some(Shallow::Scalar(Scalar::Null))
        );
    }

    #[tokio::test]
    async fn update_overwrites_coordinates() {
        let (store, publisher) = setup();
        let at = |x: f64| json!({"type": "Feature", "id": "p", "properties": {},
                                 "geometry": {"type": "Point", "coordinates": [x, 0.0]}});
        publisher
            .handle(&event(json!({"type": "draw.create", "features": [at(1.0)]})))
            .await;
        publisher
            .handle(&event(json!({"type": "draw.update", "action": "move", "features": [at(7.0)]})))
            .await;

        let node = store.collection("map-features").get("p");
        let feature = codec::decode(&FeatureId::from("p"), &node).await.unwrap();
        assert_eq!(
            feature.geometry,
            crate::feature::Geometry::Point(crate::feature::Coord::new(7.0, 0.0))
        );
    }

    #[tokio::test]
    async fn combine_is_not_persisted() {
        let (store, publisher) = setup();
        let written = publisher
            .handle(&event(json!({
                "type": "draw.combine",
                "deletedFeatures": [],
                "createdFeatures": [
                    {"type": "Feature", "id": "m", "properties": {},
                     "geometry": {"type": "MultiPoint", "coordinates": [[0.0, 0.0]]}}
                ]
            })))
            .await;
        assert_eq!(written, 0);
        assert!(store.collection("map-features").get("m").once().await.unwrap().is_none());
    }
}
