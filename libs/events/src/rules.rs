//! Eventing rules and the per-project snapshot they are read from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ActionKind, EventError, MutationKind};

/// CRUD operation executed by an [`RuleAction::InvokeCrud`] action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrudOp {
    /// Insert the event document (tagged with `_event_id`).
    #[default]
    Create,
    /// Apply the event document to the rows selected by the event's find.
    Update,
    /// Delete the rows selected by the event's find.
    Delete,
}

/// What to do when an event fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    InvokeCrud {
        db: String,
        collection: String,
        #[serde(default)]
        op: CrudOp,
    },
    InvokeWebhook {
        url: String,
    },
    InvokeFunction {
        service: String,
        function: String,
    },
}

impl RuleAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            RuleAction::InvokeCrud { .. } => ActionKind::Crud,
            RuleAction::InvokeWebhook { .. } => ActionKind::Webhook,
            RuleAction::InvokeFunction { .. } => ActionKind::Function,
        }
    }
}

/// A configured trigger: which mutations raise an event and what runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventingRule {
    pub id: String,

    /// Database alias watched by the rule. Empty for custom-event rules.
    #[serde(default)]
    pub source_db: String,

    #[serde(default)]
    pub collection: String,

    /// `DB_INSERT` / `create`, `DB_UPDATE` / `update`, `DB_DELETE` /
    /// `delete`, or a custom type.
    pub event_type: String,

    pub action: RuleAction,

    /// Overrides the node-wide retry ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    /// Overrides the node-wide per-attempt deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl EventingRule {
    /// Whether this rule fires for `kind` on `db`.`collection`.
    pub fn matches_mutation(&self, db: &str, collection: &str, kind: MutationKind) -> bool {
        self.source_db == db && self.collection == collection && kind.matches(&self.event_type)
    }

    /// Rejects rules whose action cannot be executed.
    pub fn validate(&self) -> Result<(), EventError> {
        let invalid = |reason: &str| EventError::InvalidRule {
            rule: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("rule id is empty"));
        }
        if self.event_type.trim().is_empty() {
            return Err(invalid("event type is empty"));
        }
        let is_db_rule = [MutationKind::Create, MutationKind::Update, MutationKind::Delete]
            .iter()
            .any(|kind| kind.matches(&self.event_type));
        if is_db_rule && (self.source_db.is_empty() || self.collection.is_empty()) {
            return Err(invalid("database rules need source_db and collection"));
        }

        match &self.action {
            RuleAction::InvokeWebhook { url } => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(invalid("webhook url must be http(s)"));
                }
            }
            RuleAction::InvokeFunction { service, function } => {
                if service.is_empty() || function.is_empty() {
                    return Err(invalid("function target needs service and function"));
                }
            }
            RuleAction::InvokeCrud { db, collection, .. } => {
                if db.is_empty() || collection.is_empty() {
                    return Err(invalid("crud target needs db and collection"));
                }
            }
        }
        Ok(())
    }
}

/// Immutable view of one project's rules.
///
/// A new snapshot is built on every reconfiguration; readers hold the one
/// they loaded for the duration of a call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesSnapshot {
    pub project: String,
    pub version: u64,
    /// Keyed by rule id so iteration order is deterministic.
    pub rules: BTreeMap<String, EventingRule>,
}

impl RulesSnapshot {
    pub fn new(
        project: impl Into<String>,
        version: u64,
        rules: impl IntoIterator<Item = EventingRule>,
    ) -> Self {
        Self {
            project: project.into(),
            version,
            rules: rules.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    pub fn get(&self, rule_id: &str) -> Option<&EventingRule> {
        self.rules.get(rule_id)
    }

    /// Rules that fire for a mutation, in rule-id order.
    pub fn matching<'a>(
        &'a self,
        db: &'a str,
        collection: &'a str,
        kind: MutationKind,
    ) -> impl Iterator<Item = &'a EventingRule> + 'a {
        self.rules
            .values()
            .filter(move |rule| rule.matches_mutation(db, collection, kind))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webhook_rule(id: &str, event_type: &str) -> EventingRule {
        EventingRule {
            id: id.to_string(),
            source_db: "db".to_string(),
            collection: "orders".to_string(),
            event_type: event_type.to_string(),
            action: RuleAction::InvokeWebhook {
                url: "https://hooks.example.com/orders".to_string(),
            },
            retries: None,
            timeout_ms: None,
        }
    }

    #[test]
    fn matching_is_sorted_and_filtered() {
        let snapshot = RulesSnapshot::new(
            "p",
            1,
            vec![
                webhook_rule("zeta", "create"),
                webhook_rule("alpha", "DB_INSERT"),
                webhook_rule("other", "DB_DELETE"),
            ],
        );
        let ids: Vec<&str> = snapshot
            .matching("db", "orders", MutationKind::Create)
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
        assert_eq!(snapshot.matching("db", "users", MutationKind::Create).count(), 0);
    }

    #[test]
    fn validate_rejects_non_http_webhook() {
        let mut rule = webhook_rule("r", "create");
        rule.action = RuleAction::InvokeWebhook {
            url: "ftp://example.com".to_string(),
        };
        assert!(matches!(rule.validate(), Err(EventError::InvalidRule { .. })));
    }

    #[test]
    fn validate_requires_collection_for_db_rules() {
        let mut rule = webhook_rule("r", "DB_UPDATE");
        rule.collection.clear();
        assert!(rule.validate().is_err());

        let mut custom = webhook_rule("c", "invoice.due");
        custom.collection.clear();
        custom.source_db.clear();
        assert!(custom.validate().is_ok());
    }

    #[test]
    fn action_deserializes_from_tagged_toml_shape() {
        let action: RuleAction = serde_json::from_value(serde_json::json!({
            "kind": "invoke_crud",
            "db": "audit",
            "collection": "order_log",
        }))
        .unwrap();
        assert_eq!(
            action,
            RuleAction::InvokeCrud {
                db: "audit".to_string(),
                collection: "order_log".to_string(),
                op: CrudOp::Create,
            }
        );
        assert_eq!(action.kind(), ActionKind::Crud);
    }
}
