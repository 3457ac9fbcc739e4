//! Map feature types shared by the codec, the watcher and the publisher.
//!
//! `Feature` is the in-memory form. The drawing surface speaks GeoJSON, so
//! conversions to and from `geojson::Feature` live here as well.

use std::str::FromStr;

use geojson::feature::Id;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::codec::CodecError;

/// Free-form feature properties, passed through unchanged
pub type Properties = Map<String, JsonValue>;

/// Feature identifier - doubles as the key in the shared collection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(pub String);

impl FeatureId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extract the id of a GeoJSON feature (numeric ids are stringified)
    pub fn from_geojson(feature: &geojson::Feature) -> Result<Self, CodecError> {
        match &feature.id {
            Some(Id::String(id)) => Ok(Self(id.clone())),
            Some(Id::Number(n)) => Ok(Self(n.to_string())),
            None => Err(CodecError::MalformedFeature("feature has no id".into())),
        }
    }
}

impl std::fmt::Display for FeatureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FeatureId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for FeatureId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A 2-d coordinate (longitude/latitude on the map)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn from_position(position: &[f64]) -> Result<Self, CodecError> {
        match position {
            [x, y, ..] if x.is_finite() && y.is_finite() => Ok(Self::new(*x, *y)),
            [_, _, ..] => Err(CodecError::MalformedFeature(
                "position has non-finite components".into(),
            )),
            _ => Err(CodecError::MalformedFeature(format!(
                "position needs two components, got {}",
                position.len()
            ))),
        }
    }

    fn to_position(self) -> Vec<f64> {
        vec![self.x, self.y]
    }
}

/// Supported geometry kinds, as named in the stored `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryKind {
    Point,
    LineString,
}

impl GeometryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GeometryKind::Point => "Point",
            GeometryKind::LineString => "LineString",
        }
    }
}

impl FromStr for GeometryKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Point" => Ok(GeometryKind::Point),
            "LineString" => Ok(GeometryKind::LineString),
            other => Err(CodecError::UnsupportedGeometry(other.to_string())),
        }
    }
}

/// Feature geometry. Only points and line strings can be drawn and stored.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Coord),
    /// Ordered, non-empty vertex sequence
    LineString(Vec<Coord>),
}

impl Geometry {
    pub fn kind(&self) -> GeometryKind {
        match self {
            Geometry::Point(_) => GeometryKind::Point,
            Geometry::LineString(_) => GeometryKind::LineString,
        }
    }

    /// Convert a GeoJSON geometry, rejecting every kind we cannot store
    pub fn from_geojson(geometry: &geojson::Geometry) -> Result<Self, CodecError> {
        use geojson::Value;

        match &geometry.value {
            Value::Point(position) => Ok(Geometry::Point(Coord::from_position(position)?)),
            Value::LineString(positions) => {
                if positions.is_empty() {
                    return Err(CodecError::MalformedFeature(
                        "line string has no vertices".into(),
                    ));
                }
                let vertices = positions
                    .iter()
                    .map(|p| Coord::from_position(p))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Geometry::LineString(vertices))
            }
            Value::MultiPoint(_) => Err(unsupported("MultiPoint")),
            Value::MultiLineString(_) => Err(unsupported("MultiLineString")),
            Value::Polygon(_) => Err(unsupported("Polygon")),
            Value::MultiPolygon(_) => Err(unsupported("MultiPolygon")),
            Value::GeometryCollection(_) => Err(unsupported("GeometryCollection")),
        }
    }

    pub fn to_geojson(&self) -> geojson::Geometry {
        let value = match self {
            Geometry::Point(coord) => geojson::Value::Point(coord.to_position()),
            Geometry::LineString(vertices) => {
                geojson::Value::LineString(vertices.iter().map(|c| c.to_position()).collect())
            }
        };
        geojson::Geometry::new(value)
    }
}

fn unsupported(kind: &str) -> CodecError {
    CodecError::UnsupportedGeometry(kind.to_string())
}

/// A drawable map feature
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: FeatureId,
    pub properties: Properties,
    pub geometry: Geometry,
}

impl Feature {
    pub fn new(id: impl Into<FeatureId>, geometry: Geometry) -> Self {
        Self {
            id: id.into(),
            properties: Properties::new(),
            geometry,
        }
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Convert from the drawing surface's GeoJSON form
    pub fn from_geojson(feature: &geojson::Feature) -> Result<Self, CodecError> {
        let id = FeatureId::from_geojson(feature)?;
        let geometry = match &feature.geometry {
            Some(geometry) => Geometry::from_geojson(geometry)?,
            None => {
                return Err(CodecError::MalformedFeature(format!(
                    "feature {id} has no geometry"
                )));
            }
        };
        Ok(Self {
            id,
            properties: feature.properties.clone().unwrap_or_default(),
            geometry,
        })
    }

    pub fn to_geojson(&self) -> geojson::Feature {
        geojson::Feature {
            bbox: None,
            geometry: Some(self.geometry.to_geojson()),
            id: Some(Id::String(self.id.0.clone())),
            properties: Some(self.properties.clone()),
            foreign_members: None,
        }
    }
}

impl TryFrom<&geojson::Feature> for Feature {
    type Error = CodecError;

    fn try_from(feature: &geojson::Feature) -> Result<Self, Self::Error> {
        Feature::from_geojson(feature)
    }
}

impl From<&Feature> for geojson::Feature {
    fn from(feature: &Feature) -> Self {
        feature.to_geojson()
    }
}
