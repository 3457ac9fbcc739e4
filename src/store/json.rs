//! Read-only node handle over an in-memory JSON tree.
//!
//! Reads resolve immediately, which makes it handy for decoding a node that
//! was just encoded without going through a live store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::{Entry, NodeHandle, Scalar, Shallow, StoreError};

#[derive(Debug, Clone)]
pub struct JsonNode {
    root: Arc<JsonValue>,
    path: Vec<String>,
}

impl JsonNode {
    pub fn new(root: JsonValue) -> Self {
        Self {
            root: Arc::new(root),
            path: Vec::new(),
        }
    }

    fn resolve(&self) -> Option<&JsonValue> {
        let mut current = self.root.as_ref();
        for segment in &self.path {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }
}

#[async_trait]
impl NodeHandle for JsonNode {
    fn get(&self, field: &str) -> Self {
        let mut path = self.path.clone();
        path.push(field.to_string());
        Self {
            root: Arc::clone(&self.root),
            path,
        }
    }

    async fn once(&self) -> Result<Option<Shallow>, StoreError> {
        let Some(value) = self.resolve() else {
            return Ok(None);
        };
        let shallow = match value {
            JsonValue::Object(fields) => {
                let mut entries = BTreeMap::new();
                for (key, child) in fields {
                    let entry = match child {
                        JsonValue::Object(_) => Entry::Child,
                        other => match Scalar::from_json(other) {
                            Some(scalar) => Entry::Scalar(scalar),
                            None => {
                                let mut path = self.path.clone();
                                path.push(key.clone());
                                return Err(StoreError::UnsupportedValue(path.join(".")));
                            }
                        },
                    };
                    entries.insert(key.clone(), entry);
                }
                Shallow::Node(entries)
            }
            other => match Scalar::from_json(other) {
                Some(scalar) => Shallow::Scalar(scalar),
                None => return Err(StoreError::UnsupportedValue(self.path.join("."))),
            },
        };
        Ok(Some(shallow))
    }

    async fn put(&self, _value: JsonValue) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn reads_are_shallow() {
        let node = JsonNode::new(json!({"a": 1, "b": {"c": true}}));
        let Some(Shallow::Node(fields)) = node.once().await.unwrap() else {
            panic!("expected a node");
        };
        assert_eq!(fields["a"], Entry::Scalar(Scalar::Number(1.into())));
        assert_eq!(fields["b"], Entry::Child);

        let nested = node.get("b").get("c").once().await.unwrap();
        assert_eq!(nested, Some(Shallow::Scalar(Scalar::Bool(true))));
    }

    #[tokio::test]
    async fn missing_paths_read_as_absent() {
        let node = JsonNode::new(json!({"a": 1}));
        assert_eq!(node.get("z").once().await.unwrap(), None);
        assert_eq!(node.get("a").get("deeper").once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn array_fields_fail_the_read_instead_of_vanishing() {
        let node = JsonNode::new(json!({"properties": {"name": "trail", "tags": ["a", "b"]}}));
        let result = node.get("properties").once().await;
        assert!(matches!(result, Err(StoreError::UnsupportedValue(p)) if p == "properties.tags"));
    }

    #[tokio::test]
    async fn writes_are_refused() {
        let node = JsonNode::new(json!({}));
        assert!(matches!(
            node.get("a").put(json!(1)).await,
            Err(StoreError::ReadOnly)
        ));
    }
}
