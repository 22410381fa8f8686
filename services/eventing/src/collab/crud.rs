//! CRUD engine boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{CollabError, InternalClient};

/// Field written into documents created by eventing so a replayed create can
/// be recognised.
pub const EVENT_ID_FIELD: &str = "_event_id";

/// A collection inside a project's database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrudTarget<'a> {
    pub project: &'a str,
    pub db: &'a str,
    pub collection: &'a str,
}

/// One operation of a batch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchOp {
    Create { collection: String, doc: Value },
    Update { collection: String, find: Map<String, Value>, update: Value },
    Delete { collection: String, find: Map<String, Value> },
}

#[async_trait]
pub trait CrudCollaborator: Send + Sync {
    async fn create(
        &self,
        target: CrudTarget<'_>,
        token: &str,
        doc: Value,
    ) -> Result<(), CollabError>;

    async fn read(
        &self,
        target: CrudTarget<'_>,
        token: &str,
        find: Map<String, Value>,
    ) -> Result<Vec<Value>, CollabError>;

    /// Returns the number of matched documents.
    async fn update(
        &self,
        target: CrudTarget<'_>,
        token: &str,
        find: Map<String, Value>,
        update: Value,
    ) -> Result<u64, CollabError>;

    async fn delete(
        &self,
        target: CrudTarget<'_>,
        token: &str,
        find: Map<String, Value>,
    ) -> Result<u64, CollabError>;

    async fn batch(
        &self,
        project: &str,
        db: &str,
        token: &str,
        ops: Vec<BatchOp>,
    ) -> Result<(), CollabError>;

    /// Create without client-facing validation and hooks. Writes made on
    /// behalf of an event go through here so they do not raise events of
    /// their own through the public pipeline.
    async fn internal_create(
        &self,
        target: CrudTarget<'_>,
        token: &str,
        doc: Value,
    ) -> Result<(), CollabError>;

    async fn internal_update(
        &self,
        target: CrudTarget<'_>,
        token: &str,
        find: Map<String, Value>,
        update: Value,
    ) -> Result<u64, CollabError>;
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    #[serde(default)]
    count: u64,
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    #[serde(default)]
    result: Vec<Value>,
}

/// Talks to the gateway's CRUD endpoints.
pub struct HttpCrudClient {
    client: InternalClient,
    base_url: String,
}

impl HttpCrudClient {
    pub fn new(client: InternalClient, gateway_url: &str) -> Self {
        Self {
            client,
            base_url: gateway_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, target: CrudTarget<'_>, op: &str) -> String {
        format!(
            "{}/v1/api/{}/crud/{}/{}/{}",
            self.base_url, target.project, target.db, target.collection, op
        )
    }

    fn internal_url(&self, target: CrudTarget<'_>, op: &str) -> String {
        format!(
            "{}/v1/internal/crud/{}/{}/{}/{}",
            self.base_url, target.project, target.db, target.collection, op
        )
    }

    async fn send(&self, url: &str, token: &str, body: Value) -> Result<(), CollabError> {
        self.client
            .make_http_request(Method::POST, url, Some(token), None, Some(&body))
            .await?;
        Ok(())
    }

    async fn count(&self, url: &str, token: &str, body: Value) -> Result<u64, CollabError> {
        let response: CountResponse = self.client.post_json(url, Some(token), &body).await?;
        Ok(response.count)
    }
}

#[async_trait]
impl CrudCollaborator for HttpCrudClient {
    async fn create(
        &self,
        target: CrudTarget<'_>,
        token: &str,
        doc: Value,
    ) -> Result<(), CollabError> {
        self.send(&self.url(target, "create"), token, json!({ "doc": doc, "op": "all" }))
            .await
    }

    async fn read(
        &self,
        target: CrudTarget<'_>,
        token: &str,
        find: Map<String, Value>,
    ) -> Result<Vec<Value>, CollabError> {
        let body = json!({ "find": find, "op": "all" });
        let response: ReadResponse = self
            .client
            .post_json(&self.url(target, "read"), Some(token), &body)
            .await?;
        Ok(response.result)
    }

    async fn update(
        &self,
        target: CrudTarget<'_>,
        token: &str,
        find: Map<String, Value>,
        update: Value,
    ) -> Result<u64, CollabError> {
        let body = json!({ "find": find, "update": update, "op": "all" });
        self.count(&self.url(target, "update"), token, body).await
    }

    async fn delete(
        &self,
        target: CrudTarget<'_>,
        token: &str,
        find: Map<String, Value>,
    ) -> Result<u64, CollabError> {
        let body = json!({ "find": find, "op": "all" });
        self.count(&self.url(target, "delete"), token, body).await
    }

    async fn batch(
        &self,
        project: &str,
        db: &str,
        token: &str,
        ops: Vec<BatchOp>,
    ) -> Result<(), CollabError> {
        let url = format!("{}/v1/api/{}/crud/{}/batch", self.base_url, project, db);
        self.send(&url, token, json!({ "reqs": ops })).await
    }

    async fn internal_create(
        &self,
        target: CrudTarget<'_>,
        token: &str,
        doc: Value,
    ) -> Result<(), CollabError> {
        self.send(&self.internal_url(target, "create"), token, json!({ "doc": doc, "op": "all" }))
            .await
    }

    async fn internal_update(
        &self,
        target: CrudTarget<'_>,
        token: &str,
        find: Map<String, Value>,
        update: Value,
    ) -> Result<u64, CollabError> {
        let body = json!({ "find": find, "update": update, "op": "all" });
        self.count(&self.internal_url(target, "update"), token, body).await
    }
}

type CollectionKey = (String, String, String);

/// In-memory collections. Like the gateway, every create inserts; spotting a
/// replayed create is up to the caller.
#[derive(Default)]
pub struct MemoryCrud {
    collections: Mutex<HashMap<CollectionKey, Vec<Value>>>,
    failures_left: AtomicU32,
}

impl MemoryCrud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls fail with a retryable error.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn documents(&self, project: &str, db: &str, collection: &str) -> Vec<Value> {
        self.lock()
            .get(&key(CrudTarget { project, db, collection }))
            .cloned()
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CollectionKey, Vec<Value>>> {
        self.collections.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn injected_failure(&self) -> Result<(), CollabError> {
        let took = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match took {
            Ok(_) => Err(CollabError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn insert(&self, target: CrudTarget<'_>, doc: Value) -> Result<(), CollabError> {
        self.injected_failure()?;
        let docs = match doc {
            Value::Array(docs) => docs,
            doc @ Value::Object(_) => vec![doc],
            other => return Err(CollabError::Invalid(format!("cannot insert {other}"))),
        };

        self.lock().entry(key(target)).or_default().extend(docs);
        Ok(())
    }

    fn apply_update(
        &self,
        target: CrudTarget<'_>,
        find: &Map<String, Value>,
        update: &Value,
    ) -> Result<u64, CollabError> {
        self.injected_failure()?;
        let set = update.get("$set").unwrap_or(update);
        let Value::Object(set) = set else {
            return Err(CollabError::Invalid("update must be an object".to_string()));
        };

        let mut collections = self.lock();
        let mut matched = 0;
        for row in collections.entry(key(target)).or_default().iter_mut() {
            if matches_find(row, find) {
                if let Value::Object(fields) = row {
                    for (k, v) in set {
                        fields.insert(k.clone(), v.clone());
                    }
                }
                matched += 1;
            }
        }
        Ok(matched)
    }
}

fn key(target: CrudTarget<'_>) -> CollectionKey {
    (
        target.project.to_string(),
        target.db.to_string(),
        target.collection.to_string(),
    )
}

fn matches_find(row: &Value, find: &Map<String, Value>) -> bool {
    find.iter().all(|(field, expected)| row.get(field) == Some(expected))
}

#[async_trait]
impl CrudCollaborator for MemoryCrud {
    async fn create(
        &self,
        target: CrudTarget<'_>,
        _token: &str,
        doc: Value,
    ) -> Result<(), CollabError> {
        self.insert(target, doc)
    }

    async fn read(
        &self,
        target: CrudTarget<'_>,
        _token: &str,
        find: Map<String, Value>,
    ) -> Result<Vec<Value>, CollabError> {
        self.injected_failure()?;
        Ok(self
            .lock()
            .get(&key(target))
            .map(|rows| rows.iter().filter(|row| matches_find(row, &find)).cloned().collect())
            .unwrap_or_default())
    }

    async fn update(
        &self,
        target: CrudTarget<'_>,
        _token: &str,
        find: Map<String, Value>,
        update: Value,
    ) -> Result<u64, CollabError> {
        self.apply_update(target, &find, &update)
    }

    async fn delete(
        &self,
        target: CrudTarget<'_>,
        _token: &str,
        find: Map<String, Value>,
    ) -> Result<u64, CollabError> {
        self.injected_failure()?;
        let mut collections = self.lock();
        let rows = collections.entry(key(target)).or_default();
        let before = rows.len();
        rows.retain(|row| !matches_find(row, &find));
        Ok((before - rows.len()) as u64)
    }

    async fn batch(
        &self,
        project: &str,
        db: &str,
        token: &str,
        ops: Vec<BatchOp>,
    ) -> Result<(), CollabError> {
        for op in ops {
            match op {
                BatchOp::Create { collection, doc } => {
                    self.create(CrudTarget { project, db, collection: &collection }, token, doc)
                        .await?;
                }
                BatchOp::Update { collection, find, update } => {
                    let target = CrudTarget {
                        project,
                        db,
                        collection: &collection,
                    };
                    self.update(target, token, find, update).await?;
                }
                BatchOp::Delete { collection, find } => {
                    self.delete(CrudTarget { project, db, collection: &collection }, token, find)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn internal_create(
        &self,
        target: CrudTarget<'_>,
        _token: &str,
        doc: Value,
    ) -> Result<(), CollabError> {
        self.insert(target, doc)
    }

    async fn internal_update(
        &self,
        target: CrudTarget<'_>,
        _token: &str,
        find: Map<String, Value>,
        update: Value,
    ) -> Result<u64, CollabError> {
        self.apply_update(target, &find, &update)
    }
}
