//! Turning committed mutations into staged events.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sgw_events::{MutationKind, NewEvent, RulesSnapshot};
use sgw_id::EventId;
use tracing::{debug, warn};

use crate::collab::SchemaCollaborator;
use crate::db::EventStore;
use crate::rules::RuleRegistry;

/// A mutation reported by the CRUD pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub db: String,
    pub collection: String,
    pub kind: MutationKind,

    /// Find clause of an update or delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub find: Option<Value>,

    /// The inserted document, or the document after an update. A create may
    /// carry an array of documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,

    /// The document before an update or delete, when the pipeline has it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
}

/// Result of evaluating one mutation against a rules snapshot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Evaluation {
    /// Find identifying the affected rows.
    pub find: Map<String, Value>,
    pub eligible: bool,
    /// Ids of the rules that fire, in rule-id order.
    pub rules: Vec<String>,
}

/// Decides which rules fire for a mutation. Has no side effects.
pub struct TriggerEvaluator {
    schema: Arc<dyn SchemaCollaborator>,
}

impl TriggerEvaluator {
    pub fn new(schema: Arc<dyn SchemaCollaborator>) -> Self {
        Self { schema }
    }

    /// Evaluates `kind` on `db`.`collection`. For creates `obj` is the
    /// document, for updates and deletes the find clause.
    pub fn evaluate(
        &self,
        snapshot: &RulesSnapshot,
        db: &str,
        kind: MutationKind,
        collection: &str,
        obj: &Value,
    ) -> Evaluation {
        let rules: Vec<String> = snapshot
            .matching(db, collection, kind)
            .map(|rule| rule.id.clone())
            .collect();
        if rules.is_empty() {
            return Evaluation::default();
        }

        let (find, eligible) = self
            .schema
            .check_if_eventing_is_possible(db, collection, obj, kind.is_find());
        let rules = if eligible { rules } else { Vec::new() };
        Evaluation { find, eligible, rules }
    }
}

/// Routing key shared by every event about the same row, so they land on
/// the same token and keep their order.
pub fn routing_key(db: &str, collection: &str, find: &Map<String, Value>) -> String {
    // serde_json maps are sorted by key, so this is canonical.
    format!("{db}/{collection}/{}", Value::Object(find.clone()))
}

/// Events computed before a mutation commits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedEvents {
    events: Vec<NewEvent>,
}

impl PreparedEvents {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[NewEvent] {
        &self.events
    }
}

/// Hook the CRUD pipeline calls around each mutation.
///
/// `prepare` runs before the mutation commits and stages nothing. `commit`
/// stages the prepared events only when the mutation actually committed.
/// Neither ever fails the mutation: problems are logged and dropped.
pub struct MutationHook {
    evaluator: TriggerEvaluator,
    registry: Arc<RuleRegistry>,
    store: Arc<dyn EventStore>,
}

impl MutationHook {
    pub fn new(
        evaluator: TriggerEvaluator,
        registry: Arc<RuleRegistry>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            evaluator,
            registry,
            store,
        }
    }

    pub fn prepare(&self, project: &str, mutation: &Mutation) -> PreparedEvents {
        let snapshot = self.registry.snapshot(project);
        let objects: Vec<&Value> = match (mutation.kind, &mutation.doc, &mutation.find) {
            (MutationKind::Create, Some(Value::Array(docs)), _) => docs.iter().collect(),
            (MutationKind::Create, Some(doc), _) => vec![doc],
            (_, _, Some(find)) if mutation.kind.is_find() => vec![find],
            _ => Vec::new(),
        };

        let mut events = Vec::new();
        for obj in objects {
            let evaluation = self
                .evaluator
                .evaluate(&snapshot, &mutation.db, mutation.kind, &mutation.collection, obj);
            if !evaluation.eligible {
                if !snapshot.is_empty() {
                    debug!(
                        project = %project,
                        db = %mutation.db,
                        collection = %mutation.collection,
                        kind = %mutation.kind,
                        "Mutation not eligible for eventing"
                    );
                }
                continue;
            }

            let doc = match mutation.kind {
                MutationKind::Create => obj.clone(),
                _ => mutation.doc.clone().unwrap_or(Value::Null),
            };
            let payload = json!({
                "db": mutation.db,
                "col": mutation.collection,
                "find": evaluation.find,
                "doc": doc,
                "before": mutation.before,
            });
            let key = routing_key(&mutation.db, &mutation.collection, &evaluation.find);

            for rule in evaluation.rules {
                events.push(
                    NewEvent::new(project, mutation.kind.event_type(), payload.clone())
                        .rule(rule)
                        .routing_key(key.clone()),
                );
            }
        }

        PreparedEvents { events }
    }

    /// Stages prepared events if the mutation committed. Returns the ids of
    /// the events that were staged.
    pub async fn commit(&self, prepared: PreparedEvents, committed: bool) -> Vec<EventId> {
        if !committed {
            if !prepared.is_empty() {
                debug!(events = prepared.len(), "Mutation rolled back, dropping prepared events");
            }
            return Vec::new();
        }

        let mut staged = Vec::with_capacity(prepared.len());
        for new in prepared.events {
            let rule = new.rule.clone();
            match self.store.stage(new).await {
                Ok(event) => {
                    debug!(
                        event_id = %event.id,
                        token = event.token,
                        rule = ?rule,
                        "Staged mutation event",
                    );
                    staged.push(event.id);
                }
                Err(e) => {
                    warn!(error = %e, rule = ?rule, "Failed to stage mutation event");
                }
            }
        }
        staged
    }

    /// `prepare` and `commit` for a mutation that has already committed.
    pub async fn on_committed(&self, project: &str, mutation: &Mutation) -> Vec<EventId> {
        let prepared = self.prepare(project, mutation);
        self.commit(prepared, true).await
    }
}
