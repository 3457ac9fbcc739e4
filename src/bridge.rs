//! JSON-lines bridge to an external drawing surface.
//!
//! Gesture events arrive one JSON object per line; surface mutations are
//! written back one JSON object per line. Any map UI that can speak this over
//! a pipe can sit on the other end.

use std::collections::HashSet;
use std::io::Write;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::feature::{Feature, FeatureId};
use crate::surface::{DrawEvent, DrawingSurface};

/// One line written to the surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SurfaceCommand {
    Add { feature: geojson::Feature },
    Delete { id: FeatureId },
}

/// Parse one gesture line
pub fn parse_event(line: &str) -> Result<DrawEvent> {
    serde_json::from_str(line).with_context(|| format!("invalid gesture line: {line}"))
}

/// Surface that forwards mutations as JSON lines
pub struct JsonLinesSurface<W> {
    out: W,
    shown: HashSet<FeatureId>,
}

impl<W: Write> JsonLinesSurface<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            shown: HashSet::new(),
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Track what a gesture did to the surface on its own side of the pipe.
    ///
    /// The surface draws and erases features itself before the gesture line
    /// reaches us, so the ids it shows are not only the ones added here.
    /// Call this before the gesture is published so the store echo replaces
    /// the drawn feature instead of duplicating it.
    pub fn record_gesture(&mut self, event: &DrawEvent) {
        let (gone, drawn): (&[geojson::Feature], &[geojson::Feature]) = match event {
            DrawEvent::Create { features } | DrawEvent::Update { features, .. } => (&[], features),
            DrawEvent::Delete { features } => (features, &[]),
            DrawEvent::Combine {
                deleted_features,
                created_features,
            }
            | DrawEvent::Uncombine {
                deleted_features,
                created_features,
            } => (deleted_features, created_features),
        };
        for feature in gone {
            if let Ok(id) = FeatureId::from_geojson(feature) {
                self.shown.remove(&id);
            }
        }
        for feature in drawn {
            if let Ok(id) = FeatureId::from_geojson(feature) {
                self.shown.insert(id);
            }
        }
    }

    fn emit(&mut self, command: &SurfaceCommand) {
        let written = serde_json::to_writer(&mut self.out, command)
            .map_err(anyhow::Error::from)
            .and_then(|()| {
                self.out.write_all(b"\n")?;
                self.out.flush()?;
                Ok(())
            });
        if let Err(err) = written {
            warn!(%err, "failed to write surface command");
        }
    }
}

impl<W: Write + Send + 'static> DrawingSurface for JsonLinesSurface<W> {
    fn add(&mut self, feature: Feature) {
        let id = feature.id.clone();
        self.emit(&SurfaceCommand::Add {
            feature: feature.to_geojson(),
        });
        self.shown.insert(id);
    }

    fn delete_by_id(&mut self, id: &FeatureId) -> bool {
        if !self.shown.remove(id) {
            return false;
        }
        self.emit(&SurfaceCommand::Delete { id: id.clone() });
        true
    }

    fn has_id(&self, id: &FeatureId) -> bool {
        self.shown.contains(id)
    }
}
