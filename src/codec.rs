//! Conversion between in-memory features and the store's nested tree form.
//!
//! Stored layout of a feature (the id is the collection key, not a field):
//!
//! ```text
//! { properties: {..},
//!   geometry: { type: "Point",      coordinates: { x, y } } }
//!   geometry: { type: "LineString", coordinates: { "0": { x, y }, "1": .. } }
//! ```
//!
//! The store has no array type, so line string vertices are keyed by their
//! decimal index. Decoding walks `"0", "1", ..` and stops at the first gap.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

use crate::feature::{Coord, Feature, FeatureId, Geometry, GeometryKind, Properties};
use crate::store::{Entry, NodeHandle, Shallow, StoreError};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported geometry type `{0}`")]
    UnsupportedGeometry(String),

    #[error("malformed node at `{path}`: {reason}")]
    MalformedNode { path: String, reason: String },

    #[error("malformed feature: {0}")]
    MalformedFeature(String),

    #[error("property `{0}` holds an array, which the store cannot represent")]
    UnsupportedProperty(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

fn malformed(path: &str, reason: impl Into<String>) -> CodecError {
    CodecError::MalformedNode {
        path: path.to_string(),
        reason: reason.into(),
    }
}

// --- Encoding ---

/// Encode a feature into the node written at its collection key
pub fn encode(feature: &Feature) -> Result<JsonValue, CodecError> {
    check_storable(&feature.properties, "properties")?;

    let coordinates = match &feature.geometry {
        Geometry::Point(coord) => coord_node(coord),
        Geometry::LineString(vertices) => {
            let indexed: Map<String, JsonValue> = vertices
                .iter()
                .enumerate()
                .map(|(index, coord)| (index.to_string(), coord_node(coord)))
                .collect();
            JsonValue::Object(indexed)
        }
    };

    Ok(json!({
        "properties": feature.properties,
        "geometry": {
            "type": feature.geometry.kind().as_str(),
            "coordinates": coordinates,
        },
    }))
}

/// Encode a GeoJSON feature straight from the drawing surface.
///
/// Returns the key to write at along with the node.
pub fn encode_geojson(feature: &geojson::Feature) -> Result<(FeatureId, JsonValue), CodecError> {
    let feature = Feature::from_geojson(feature)?;
    let node = encode(&feature)?;
    Ok((feature.id, node))
}

fn coord_node(coord: &Coord) -> JsonValue {
    json!({ "x": coord.x, "y": coord.y })
}

fn check_storable(properties: &Properties, path: &str) -> Result<(), CodecError> {
    for (key, value) in properties {
        let child_path = format!("{path}.{key}");
        match value {
            JsonValue::Array(_) => return Err(CodecError::UnsupportedProperty(child_path)),
            JsonValue::Object(nested) => check_storable(nested, &child_path)?,
            _ => {}
        }
    }
    Ok(())
}

// --- Decoding ---

/// Decode the feature stored under `id`.
///
/// Every nested node is its own fetch: the feature node, `geometry`,
/// `geometry.coordinates`, and one per line string vertex.
pub async fn decode<H: NodeHandle>(id: &FeatureId, node: &H) -> Result<Feature, CodecError> {
    let fields = expect_node(node.once().await?, id.as_str())?;

    let properties = match fields.get("properties") {
        Some(Entry::Child) => read_mapping(node.get("properties"), format!("{id}.properties")).await?,
        _ => Properties::new(),
    };

    let geometry_node = node.get("geometry");
    let geometry_path = format!("{id}.geometry");
    let geometry_fields = expect_node(geometry_node.once().await?, &geometry_path)?;
    let kind: GeometryKind = match geometry_fields.get("type") {
        Some(Entry::Scalar(scalar)) => match scalar.as_str() {
            Some(name) => name.parse()?,
            None => return Err(malformed(&geometry_path, "`type` is not a string")),
        },
        _ => return Err(malformed(&geometry_path, "missing `type`")),
    };

    let coordinates_node = geometry_node.get("coordinates");
    let coordinates_path = format!("{geometry_path}.coordinates");
    let coordinates = expect_node(coordinates_node.once().await?, &coordinates_path)?;

    let geometry = match kind {
        GeometryKind::Point => Geometry::Point(read_coord(&coordinates, &coordinates_path)?),
        GeometryKind::LineString => {
            let mut vertices = Vec::new();
            for index in 0usize.. {
                let key = index.to_string();
                if !coordinates.contains_key(&key) {
                    break;
                }
                let vertex_path = format!("{coordinates_path}.{key}");
                let vertex = expect_node(coordinates_node.get(&key).once().await?, &vertex_path)?;
                vertices.push(read_coord(&vertex, &vertex_path)?);
            }
            if vertices.is_empty() {
                return Err(malformed(&coordinates_path, "line string has no vertices"));
            }
            Geometry::LineString(vertices)
        }
    };

    Ok(Feature {
        id: id.clone(),
        properties,
        geometry,
    })
}

fn expect_node(value: Option<Shallow>, path: &str) -> Result<BTreeMap<String, Entry>, CodecError> {
    match value {
        Some(Shallow::Node(fields)) => Ok(fields),
        Some(Shallow::Scalar(scalar)) if scalar.is_null() => Err(malformed(path, "tombstoned")),
        Some(Shallow::Scalar(_)) => Err(malformed(path, "expected a node, found a scalar")),
        None => Err(malformed(path, "missing")),
    }
}

fn read_coord(fields: &BTreeMap<String, Entry>, path: &str) -> Result<Coord, CodecError> {
    let axis = |name: &str| match fields.get(name) {
        Some(Entry::Scalar(scalar)) => scalar
            .as_f64()
            .ok_or_else(|| malformed(path, format!("`{name}` is not a number"))),
        _ => Err(malformed(path, format!("missing `{name}`"))),
    };
    Ok(Coord::new(axis("x")?, axis("y")?))
}

type MappingFuture = Pin<Box<dyn Future<Output = Result<Properties, CodecError>> + Send>>;

/// Read a nested mapping, one fetch per level
fn read_mapping<H: NodeHandle>(node: H, path: String) -> MappingFuture {
    Box::pin(async move {
        let fields = expect_node(node.once().await?, &path)?;
        let mut mapping = Properties::new();
        for (key, entry) in fields {
            let value = match entry {
                Entry::Scalar(scalar) => scalar.into_json(),
                Entry::Child => {
                    let nested = read_mapping(node.get(&key), format!("{path}.{key}")).await?;
                    JsonValue::Object(nested)
                }
            };
            mapping.insert(key, value);
        }
        Ok(mapping)
    })
}
