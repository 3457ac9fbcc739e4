//! Replicated tree store.
//!
//! The store is a tree of nested maps with scalar leaves. A node read is
//! shallow: scalars come back inline, nested maps come back as `Entry::Child`
//! and need their own fetch. Writing `null` at a key is a tombstone.
//!
//! The automerge document IS the replicated state; `sync` ships it between
//! peers and `Store::merge_remote` folds peer changes back in.

pub mod collection;
pub mod document;
pub mod json;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Number, Value as JsonValue};
use thiserror::Error;

pub use collection::{CancelHandle, Collection, Node, Store, Subscription};
pub use document::{default_storage_path, Document};
pub use json::JsonNode;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    #[error("value at `{0}` is an array, which the store cannot represent")]
    UnsupportedValue(String),

    #[error("cannot write through a read-only node")]
    ReadOnly,

    #[error("cannot write at the document root")]
    EmptyPath,
}

/// A leaf value
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(Number),
    Text(String),
}

impl Scalar {
    /// Leaves only; arrays and objects have no scalar form
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Null => Some(Scalar::Null),
            JsonValue::Bool(b) => Some(Scalar::Bool(*b)),
            JsonValue::Number(n) => Some(Scalar::Number(n.clone())),
            JsonValue::String(s) => Some(Scalar::Text(s.clone())),
            JsonValue::Array(_) | JsonValue::Object(_) => None,
        }
    }

    pub fn into_json(self) -> JsonValue {
        match self {
            Scalar::Null => JsonValue::Null,
            Scalar::Bool(b) => JsonValue::Bool(b),
            Scalar::Number(n) => JsonValue::Number(n),
            Scalar::Text(s) => JsonValue::String(s),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// One field of a node as seen by a shallow read
#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Scalar(Scalar),
    /// A nested node - fetch it through `NodeHandle::get`
    Child,
}

/// Result of a one-shot read
#[derive(Debug, Clone, PartialEq)]
pub enum Shallow {
    Scalar(Scalar),
    Node(BTreeMap<String, Entry>),
}

impl Shallow {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Shallow::Scalar(Scalar::Null))
    }
}

/// A change to one entry of a collection
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub key: String,
    pub value: Shallow,
}

impl Change {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_tombstone()
    }
}

/// Capability to navigate, read and write one node of the tree.
///
/// Reads are one level deep; every `once` is a separate suspension point.
#[async_trait]
pub trait NodeHandle: Clone + Send + Sync + 'static {
    /// Navigate one level into a nested node
    fn get(&self, field: &str) -> Self;

    /// Read the node's current value. `None` means the key never existed.
    async fn once(&self) -> Result<Option<Shallow>, StoreError>;

    /// Overwrite the node. `JsonValue::Null` writes a tombstone.
    async fn put(&self, value: JsonValue) -> Result<(), StoreError>;
}

/// Reject values the tree cannot hold before anything is written
pub(crate) fn check_storable(value: &JsonValue, path: &str) -> Result<(), StoreError> {
    match value {
        JsonValue::Array(_) => Err(StoreError::UnsupportedValue(path.to_string())),
        JsonValue::Object(fields) => {
            for (key, child) in fields {
                check_storable(child, &format!("{path}.{key}"))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
