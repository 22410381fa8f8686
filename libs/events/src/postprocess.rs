//! Field-level post-processing applied to data leaving the gateway.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::EventError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProcessKind {
    /// Overwrite (or insert) the field with `value`.
    Force,
    /// Drop the field.
    Remove,
    /// Replace a string field with its hex SHA-256 digest.
    Hash,
}

/// One `{action, field, value}` triple. `field` is a dot-separated path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostProcessAction {
    pub action: PostProcessKind,
    pub field: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Ordered list of redactions produced by authorization for one operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostProcess {
    pub actions: Vec<PostProcessAction>,
}

impl PostProcess {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Applies every action to `doc`, in order. Arrays are processed
    /// element by element. Missing fields are skipped, except for `force`
    /// which creates intermediate objects.
    pub fn apply(&self, doc: &mut serde_json::Value) -> Result<(), EventError> {
        for action in &self.actions {
            if let serde_json::Value::Array(items) = doc {
                for item in items.iter_mut() {
                    apply_one(action, item)?;
                }
            } else {
                apply_one(action, doc)?;
            }
        }
        Ok(())
    }
}

fn apply_one(action: &PostProcessAction, doc: &mut serde_json::Value) -> Result<(), EventError> {
    let mut path: Vec<&str> = action.field.split('.').filter(|s| !s.is_empty()).collect();
    let Some(leaf) = path.pop() else {
        return Err(EventError::InvalidPayload("post-process field is empty".to_string()));
    };

    let mut current = doc;
    for segment in path {
        let serde_json::Value::Object(map) = current else {
            return Ok(());
        };
        current = match action.action {
            PostProcessKind::Force => map
                .entry(segment.to_string())
                .or_insert_with(|| serde_json::Value::Object(Default::default())),
            _ => match map.get_mut(segment) {
                Some(next) => next,
                None => return Ok(()),
            },
        };
    }

    let serde_json::Value::Object(map) = current else {
        return Ok(());
    };

    match action.action {
        PostProcessKind::Force => {
            map.insert(leaf.to_string(), action.value.clone());
        }
        PostProcessKind::Remove => {
            map.remove(leaf);
        }
        PostProcessKind::Hash => {
            let digest = match map.get(leaf) {
                None => return Ok(()),
                Some(serde_json::Value::String(plain)) => {
                    hex::encode(Sha256::digest(plain.as_bytes()))
                }
                Some(_) => {
                    return Err(EventError::InvalidPayload(format!(
                        "cannot hash non-string field {}",
                        action.field
                    )))
                }
            };
            map.insert(leaf.to_string(), serde_json::Value::String(digest));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(action: PostProcessKind, field: &str, value: serde_json::Value) -> PostProcessAction {
        PostProcessAction {
            action,
            field: field.to_string(),
            value,
        }
    }

    #[test]
    fn remove_and_force_nested_fields() {
        let pp = PostProcess {
            actions: vec![
                action(PostProcessKind::Remove, "doc.card.number", json!(null)),
                action(PostProcessKind::Force, "doc.meta.source", json!("gateway")),
            ],
        };
        let mut doc = json!({"doc": {"card": {"number": "4111", "brand": "visa"}}});
        pp.apply(&mut doc).unwrap();
        assert_eq!(
            doc,
            json!({"doc": {"card": {"brand": "visa"}, "meta": {"source": "gateway"}}})
        );
    }

    #[test]
    fn hash_replaces_string_with_digest() {
        let pp = PostProcess {
            actions: vec![action(PostProcessKind::Hash, "email", json!(null))],
        };
        let mut doc = json!([{"email": "a@example.com"}, {"name": "no email"}]);
        pp.apply(&mut doc).unwrap();
        let hashed = doc[0]["email"].as_str().unwrap();
        assert_eq!(hashed.len(), 64);
        assert_ne!(hashed, "a@example.com");
        assert_eq!(doc[1], json!({"name": "no email"}));
    }

    #[test]
    fn hash_rejects_non_string() {
        let pp = PostProcess {
            actions: vec![action(PostProcessKind::Hash, "age", json!(null))],
        };
        assert!(pp.apply(&mut json!({"age": 42})).is_err());
    }

    #[test]
    fn empty_post_process_is_identity() {
        let mut doc = json!({"a": 1});
        PostProcess::none().apply(&mut doc).unwrap();
        assert_eq!(doc, json!({"a": 1}));
    }
}
