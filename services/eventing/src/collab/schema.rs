//! Schema boundary: can a mutation be turned into an event?

use std::collections::HashMap;

use serde_json::{Map, Value};

pub trait SchemaCollaborator: Send + Sync {
    /// Extracts the find that identifies the affected rows.
    ///
    /// For creates `obj` is the inserted document; for updates and deletes
    /// (`is_find`) it is the mutation's find clause. Returns the identifying
    /// find and whether it is specific enough to raise an event.
    fn check_if_eventing_is_possible(
        &self,
        db: &str,
        collection: &str,
        obj: &Value,
        is_find: bool,
    ) -> (Map<String, Value>, bool);
}

/// Identifies rows by their primary key fields.
#[derive(Debug, Clone)]
pub struct KeyedSchema {
    keys: HashMap<(String, String), Vec<String>>,
    default_key: Vec<String>,
}

impl KeyedSchema {
    /// Collections without an explicit key use `default_key`.
    pub fn new(default_key: Vec<String>) -> Self {
        Self {
            keys: HashMap::new(),
            default_key,
        }
    }

    pub fn with_key(mut self, db: &str, collection: &str, key: Vec<String>) -> Self {
        self.keys.insert((db.to_string(), collection.to_string()), key);
        self
    }

    fn key_for(&self, db: &str, collection: &str) -> &[String] {
        self.keys
            .get(&(db.to_string(), collection.to_string()))
            .unwrap_or(&self.default_key)
    }
}

impl Default for KeyedSchema {
    fn default() -> Self {
        Self::new(vec!["id".to_string()])
    }
}

impl SchemaCollaborator for KeyedSchema {
    fn check_if_eventing_is_possible(
        &self,
        db: &str,
        collection: &str,
        obj: &Value,
        is_find: bool,
    ) -> (Map<String, Value>, bool) {
        let key = self.key_for(db, collection);
        let Value::Object(fields) = obj else {
            return (Map::new(), false);
        };

        let mut find = Map::new();
        for field in key {
            match fields.get(field) {
                // A find on `{"id": {"$gt": 5}}` matches a range, not a row.
                Some(Value::Object(_)) if is_find => return (find, false),
                Some(Value::Null) | None => return (find, false),
                Some(value) => {
                    find.insert(field.clone(), value.clone());
                }
            }
        }
        let eligible = !find.is_empty();
        (find, eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(json!({"id": "o-1", "total": 5}), false, true)]
    #[case(json!({"total": 5}), false, false)]
    #[case(json!({"id": "o-1"}), true, true)]
    #[case(json!({"id": {"$in": ["a", "b"]}}), true, false)]
    #[case(json!({"id": null}), true, false)]
    #[case(json!([{"id": 1}]), false, false)]
    fn keyed_schema_eligibility(
        #[case] obj: Value,
        #[case] is_find: bool,
        #[case] eligible: bool,
    ) {
        let (_, ok) =
            KeyedSchema::default().check_if_eventing_is_possible("db", "orders", &obj, is_find);
        assert_eq!(ok, eligible);
    }

    #[test]
    fn keyed_schema_extracts_composite_key() {
        let schema = KeyedSchema::default().with_key(
            "db",
            "lines",
            vec!["order_id".to_string(), "line".to_string()],
        );
        let row = json!({"order_id": 7, "line": 2, "qty": 1});
        let (find, ok) = schema.check_if_eventing_is_possible("db", "lines", &row, false);
        assert!(ok);
        assert_eq!(Value::Object(find), json!({"order_id": 7, "line": 2}));
    }
}
