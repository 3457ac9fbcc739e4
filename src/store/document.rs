//! Local-first automerge document holding every feature collection.
//!
//! Collections are maps under the document root. Each entry is a nested map
//! tree (or a `null` tombstone) written through `put`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use automerge::transaction::{CommitOptions, Transactable};
use automerge::{ActorId, Automerge, ObjId, ObjType, ReadDoc, ScalarValue, ROOT};
use serde_json::{Map, Number, Value as JsonValue};

use super::{check_storable, Entry, Scalar, Shallow, StoreError};

/// Get the default storage path for the feature document
pub fn default_storage_path() -> PathBuf {
    // Use XDG data directory if available, otherwise fallback to ~/.local/share
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("irohmap").join("features.automerge")
}

/// The automerge-backed document
pub struct Document {
    doc: Automerge,
    /// Path where document is persisted (if any)
    storage_path: Option<PathBuf>,
    /// Whether there are unsaved changes
    dirty: bool,
}

impl Document {
    /// Create an empty document with the given collections.
    pub fn new(collections: &[&str]) -> Result<Self> {
        let mut doc = Self {
            doc: Automerge::new(),
            storage_path: None,
            dirty: false,
        };
        doc.ensure_collections(collections)?;
        doc.dirty = false;
        Ok(doc)
    }

    /// Load from disk
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let doc = Automerge::load(&bytes)?;
        Ok(Self {
            doc,
            storage_path: Some(path.to_path_buf()),
            dirty: false,
        })
    }

    /// Save to disk (no-op without a storage path)
    pub fn save(&mut self) -> Result<()> {
        if let Some(path) = &self.storage_path {
            // Ensure parent directory exists
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, self.doc.save())?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Get the underlying automerge document (for sync)
    pub fn automerge(&self) -> &Automerge {
        &self.doc
    }

    /// Clone the automerge document (for sync)
    pub fn clone_automerge(&self) -> Automerge {
        self.doc.clone()
    }

    /// Merge remote changes
    pub fn merge(&mut self, other: &mut Automerge) -> Result<(), StoreError> {
        let applied = self.doc.merge(other)?;
        if !applied.is_empty() {
            self.dirty = true;
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn storage_path(&self) -> Option<&PathBuf> {
        self.storage_path.as_ref()
    }

    pub fn set_storage_path(&mut self, path: PathBuf) {
        self.storage_path = Some(path);
    }

    /// Add the genesis change of every collection the document lacks.
    ///
    /// A collection map is only ever created by its genesis change: one
    /// actor derived from the collection name, fixed timestamp, no deps. Every
    /// peer produces the identical change, so merges see a single map per
    /// collection instead of conflicting copies. Returns the collections
    /// that were added.
    pub fn ensure_collections(&mut self, collections: &[&str]) -> Result<Vec<String>, StoreError> {
        let mut added = Vec::new();
        for name in collections {
            if self.has_collection(name)? {
                continue;
            }
            let mut genesis = genesis(name)?;
            self.merge(&mut genesis)?;
            added.push(name.to_string());
        }
        Ok(added)
    }

    pub fn has_collection(&self, name: &str) -> Result<bool, StoreError> {
        Ok(matches!(
            self.doc.get(ROOT, name)?,
            Some((automerge::Value::Object(ObjType::Map), _))
        ))
    }

    // --- Tree operations ---

    /// Write `value` at `path`, creating intermediate maps as needed.
    ///
    /// Objects replace whatever was there; `null` writes a tombstone.
    pub fn put(&mut self, path: &[String], value: &JsonValue) -> Result<(), StoreError> {
        let Some((last, parents)) = path.split_last() else {
            return Err(StoreError::EmptyPath);
        };
        check_storable(value, &path.join("."))?;

        let mut tx = self.doc.transaction();
        let mut obj = ROOT;
        for segment in parents {
            let existing = match tx.get(&obj, segment.as_str())? {
                Some((automerge::Value::Object(ObjType::Map), id)) => Some(id),
                _ => None,
            };
            obj = match existing {
                Some(id) => id,
                None => tx.put_object(&obj, segment.as_str(), ObjType::Map)?,
            };
        }
        write_value(&mut tx, &obj, last, value)?;
        tx.commit();

        self.dirty = true;
        Ok(())
    }

    /// Shallow read of the node at `path`
    pub fn read(&self, path: &[String]) -> Result<Option<Shallow>, StoreError> {
        let Some((last, parents)) = path.split_last() else {
            return Ok(Some(Shallow::Node(self.shallow_fields(&ROOT)?)));
        };
        let Some(parent) = self.resolve_map(parents)? else {
            return Ok(None);
        };
        let shallow = match self.doc.get(&parent, last.as_str())? {
            None => None,
            Some((automerge::Value::Scalar(s), _)) => Some(Shallow::Scalar(scalar_from(&s))),
            Some((automerge::Value::Object(ObjType::Map), id)) => {
                Some(Shallow::Node(self.shallow_fields(&id)?))
            }
            // Lists and text are never written by this crate
            Some((automerge::Value::Object(_), _)) => None,
        };
        Ok(shallow)
    }

    /// Keys of a collection, in document order
    pub fn keys(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        match self.doc.get(ROOT, collection)? {
            Some((automerge::Value::Object(ObjType::Map), id)) => Ok(self.doc.keys(&id).collect()),
            _ => Ok(Vec::new()),
        }
    }

    /// Deep copy of every entry in a collection (used to diff merges)
    pub fn materialize(&self, collection: &str) -> Result<BTreeMap<String, JsonValue>, StoreError> {
        let mut entries = BTreeMap::new();
        if let Some((automerge::Value::Object(ObjType::Map), id)) = self.doc.get(ROOT, collection)? {
            for key in self.doc.keys(&id) {
                if let Some(value) = self.materialize_prop(&id, &key)? {
                    entries.insert(key, value);
                }
            }
        }
        Ok(entries)
    }

    fn materialize_prop(&self, obj: &ObjId, key: &str) -> Result<Option<JsonValue>, StoreError> {
        match self.doc.get(obj, key)? {
            Some((automerge::Value::Scalar(s), _)) => Ok(Some(scalar_from(&s).into_json())),
            Some((automerge::Value::Object(ObjType::Map), id)) => {
                let mut fields = Map::new();
                for child in self.doc.keys(&id) {
                    if let Some(value) = self.materialize_prop(&id, &child)? {
                        fields.insert(child, value);
                    }
                }
                Ok(Some(JsonValue::Object(fields)))
            }
            _ => Ok(None),
        }
    }

    fn resolve_map(&self, path: &[String]) -> Result<Option<ObjId>, StoreError> {
        let mut obj = ROOT;
        for segment in path {
            obj = match self.doc.get(&obj, segment.as_str())? {
                Some((automerge::Value::Object(ObjType::Map), id)) => id,
                _ => return Ok(None),
            };
        }
        Ok(Some(obj))
    }

    fn shallow_fields(&self, obj: &ObjId) -> Result<BTreeMap<String, Entry>, StoreError> {
        let mut fields = BTreeMap::new();
        for key in self.doc.keys(obj) {
            let entry = match self.doc.get(obj, key.as_str())? {
                Some((automerge::Value::Scalar(s), _)) => Entry::Scalar(scalar_from(&s)),
                Some((automerge::Value::Object(_), _)) => Entry::Child,
                None => continue,
            };
            fields.insert(key, entry);
        }
        Ok(fields)
    }
}

fn genesis(collection: &str) -> Result<Automerge, StoreError> {
    let actor = ActorId::from(format!("irohmap-genesis:{collection}").as_bytes());
    let mut doc = Automerge::new().with_actor(actor);
    let mut tx = doc.transaction();
    tx.put_object(ROOT, collection, ObjType::Map)?;
    let _ = tx.commit_with(CommitOptions::default().with_time(0));
    Ok(doc)
}

// --- Serialization helpers ---

fn write_value<T: Transactable>(
    tx: &mut T,
    obj: &ObjId,
    key: &str,
    value: &JsonValue,
) -> Result<(), StoreError> {
    match value {
        JsonValue::Object(fields) => {
            let child = tx.put_object(obj, key, ObjType::Map)?;
            for (field, nested) in fields {
                write_value(tx, &child, field, nested)?;
            }
        }
        JsonValue::Null => tx.put(obj, key, ScalarValue::Null)?,
        JsonValue::Bool(b) => tx.put(obj, key, *b)?,
        JsonValue::Number(n) => tx.put(obj, key, number_to_scalar(n))?,
        JsonValue::String(s) => tx.put(obj, key, s.as_str())?,
        JsonValue::Array(_) => return Err(StoreError::UnsupportedValue(key.to_string())),
    }
    Ok(())
}

fn number_to_scalar(n: &Number) -> ScalarValue {
    if let Some(i) = n.as_i64() {
        ScalarValue::Int(i)
    } else if let Some(u) = n.as_u64() {
        ScalarValue::Uint(u)
    } else {
        ScalarValue::F64(n.as_f64().unwrap_or(f64::NAN))
    }
}

fn scalar_from(value: &ScalarValue) -> Scalar {
    match value {
        ScalarValue::Null => Scalar::Null,
        ScalarValue::Boolean(b) => Scalar::Bool(*b),
        ScalarValue::Int(i) => Scalar::Number((*i).into()),
        ScalarValue::Uint(u) => Scalar::Number((*u).into()),
        ScalarValue::F64(f) => Number::from_f64(*f).map_or(Scalar::Null, Scalar::Number),
        ScalarValue::Str(s) => Scalar::Text(s.to_string()),
        // Counters, timestamps and bytes are never written by this crate
        other => Scalar::Text(other.to_string()),
    }
}
