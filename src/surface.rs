//! Drawing surface contract and gesture events.
//!
//! The surface is the interactive editor that renders features and turns
//! user gestures into events. It is owned elsewhere; the watcher mutates it
//! and the publisher consumes its events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::feature::{Feature, FeatureId};

/// Mutation API of the drawing surface
pub trait DrawingSurface: Send + 'static {
    fn add(&mut self, feature: Feature);

    /// Remove a feature; `false` if it was not present
    fn delete_by_id(&mut self, id: &FeatureId) -> bool;

    fn has_id(&self, id: &FeatureId) -> bool;
}

/// What an update gesture did to its features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateAction {
    /// Whole features dragged
    Move,
    /// Vertices added, moved or removed
    ChangeCoordinates,
    #[serde(other)]
    Other,
}

/// Gesture events emitted by the drawing surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DrawEvent {
    #[serde(rename = "draw.create")]
    Create { features: Vec<geojson::Feature> },

    #[serde(rename = "draw.update")]
    Update {
        features: Vec<geojson::Feature>,
        action: UpdateAction,
    },

    #[serde(rename = "draw.delete")]
    Delete { features: Vec<geojson::Feature> },

    #[serde(rename = "draw.combine", rename_all = "camelCase")]
    Combine {
        deleted_features: Vec<geojson::Feature>,
        created_features: Vec<geojson::Feature>,
    },

    #[serde(rename = "draw.uncombine", rename_all = "camelCase")]
    Uncombine {
        deleted_features: Vec<geojson::Feature>,
        created_features: Vec<geojson::Feature>,
    },
}

impl DrawEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DrawEvent::Create { .. } => "draw.create",
            DrawEvent::Update { .. } => "draw.update",
            DrawEvent::Delete { .. } => "draw.delete",
            DrawEvent::Combine { .. } => "draw.combine",
            DrawEvent::Uncombine { .. } => "draw.uncombine",
        }
    }
}

/// In-memory surface keyed by feature id
#[derive(Debug, Default)]
pub struct MemorySurface {
    features: BTreeMap<FeatureId, Feature>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &FeatureId) -> Option<&Feature> {
        self.features.get(id)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.values()
    }
}

impl DrawingSurface for MemorySurface {
    fn add(&mut self, feature: Feature) {
        self.features.insert(feature.id.clone(), feature);
    }

    fn delete_by_id(&mut self, id: &FeatureId) -> bool {
        self.features.remove(id).is_some()
    }

    fn has_id(&self, id: &FeatureId) -> bool {
        self.features.contains_key(id)
    }
}
