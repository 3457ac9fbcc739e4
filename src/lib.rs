//! Collaborative map feature editing.
//!
//! Map features drawn on a local surface are encoded into a replicated tree
//! store; changes from peers are decoded back onto the surface.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod feature;
pub mod publisher;
pub mod store;
pub mod surface;
pub mod sync;
pub mod watcher;

pub use codec::{decode, encode, CodecError};
pub use feature::{Coord, Feature, FeatureId, Geometry, GeometryKind};
pub use publisher::EditPublisher;
pub use store::{Collection, NodeHandle, Store, StoreError};
pub use surface::{DrawEvent, DrawingSurface, MemorySurface};
pub use watcher::{FeatureWatcher, WatchReport};
