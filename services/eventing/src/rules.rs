//! Per-project rule snapshots and the rules file they are loaded from.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::Deserialize;
use sgw_events::{EventError, EventingRule, RulesSnapshot};
use thiserror::Error;
use tracing::{info, warn};

use crate::collab::{EventingPolicy, KeyedSchema, RealtimeSink};

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("failed to read rules file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse rules file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Invalid(#[from] EventError),

    #[error("rule id {0} is used more than once")]
    DuplicateRule(String),
}

/// Eventing configuration of one project in the rules file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub rules: Vec<EventingRule>,

    #[serde(default)]
    pub policy: Option<EventingPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionSchema {
    pub primary_key: Vec<String>,
}

/// The TOML rules file.
///
/// ```toml
/// [[projects.shop.rules]]
/// id = "order-created"
/// source_db = "db"
/// collection = "orders"
/// event_type = "create"
/// action = { kind = "invoke_webhook", url = "https://hooks.example.com/orders" }
///
/// [projects.shop.policy]
/// allowed_actions = ["webhook", "crud"]
///
/// [schema.db.orders]
/// primary_key = ["id"]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,

    /// Primary keys by database alias, then collection.
    #[serde(default)]
    pub schema: BTreeMap<String, BTreeMap<String, CollectionSchema>>,
}

impl RulesFile {
    pub fn parse(contents: &str) -> Result<Self, RulesError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Self, RulesError> {
        let contents = std::fs::read_to_string(path).map_err(|source| RulesError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Builds the schema collaborator from the `[schema]` tables.
    pub fn keyed_schema(&self) -> KeyedSchema {
        let mut schema = KeyedSchema::default();
        for (db, collections) in &self.schema {
            for (collection, config) in collections {
                schema = schema.with_key(db, collection, config.primary_key.clone());
            }
        }
        schema
    }
}

/// Holds the current rules snapshot of every project.
///
/// Readers load a snapshot without locking; writers are serialised so that
/// versions and realtime notifications go out in the same order.
pub struct RuleRegistry {
    snapshots: ArcSwap<HashMap<String, Arc<RulesSnapshot>>>,
    realtime: Arc<dyn RealtimeSink>,
    writer: Mutex<()>,
}

impl RuleRegistry {
    pub fn new(realtime: Arc<dyn RealtimeSink>) -> Self {
        Self {
            snapshots: ArcSwap::from_pointee(HashMap::new()),
            realtime,
            writer: Mutex::new(()),
        }
    }

    /// The current snapshot of `project`. Projects without rules get an
    /// empty snapshot at version 0.
    pub fn snapshot(&self, project: &str) -> Arc<RulesSnapshot> {
        self.snapshots
            .load()
            .get(project)
            .cloned()
            .unwrap_or_else(|| Arc::new(RulesSnapshot::new(project, 0, Vec::new())))
    }

    pub fn projects(&self) -> Vec<String> {
        let mut projects: Vec<String> = self.snapshots.load().keys().cloned().collect();
        projects.sort();
        projects
    }

    /// Replaces the rules of `project`. The whole set is rejected if any
    /// rule is invalid.
    pub fn replace(
        &self,
        project: &str,
        rules: Vec<EventingRule>,
    ) -> Result<Arc<RulesSnapshot>, RulesError> {
        let mut ids = BTreeSet::new();
        for rule in &rules {
            rule.validate()?;
            if !ids.insert(rule.id.as_str()) {
                return Err(RulesError::DuplicateRule(rule.id.clone()));
            }
        }

        let _guard = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = self.snapshots.load_full();
        let version = current.get(project).map_or(0, |s| s.version) + 1;
        let snapshot = Arc::new(RulesSnapshot::new(project, version, rules));

        let mut next = HashMap::clone(&current);
        next.insert(project.to_string(), snapshot.clone());
        self.snapshots.store(Arc::new(next));

        let published: Vec<EventingRule> = snapshot.rules.values().cloned().collect();
        self.realtime.set_realtime_triggers(project, &published);
        info!(project = %project, version, rules = snapshot.len(), "Replaced eventing rules");

        Ok(snapshot)
    }

    /// Installs every project of a rules file. Invalid rules are skipped so
    /// one bad entry does not disable a project's other rules.
    pub fn load(&self, file: &RulesFile) -> Result<(), RulesError> {
        for (project, config) in &file.projects {
            let mut seen = BTreeSet::new();
            let rules: Vec<EventingRule> = config
                .rules
                .iter()
                .filter(|rule| match rule.validate() {
                    Ok(()) if seen.insert(rule.id.clone()) => true,
                    Ok(()) => {
                        warn!(
                            project = %project,
                            rule = %rule.id,
                            "Skipping duplicate eventing rule",
                        );
                        false
                    }
                    Err(e) => {
                        warn!(
                            project = %project,
                            rule = %rule.id,
                            error = %e,
                            "Skipping invalid eventing rule",
                        );
                        false
                    }
                })
                .cloned()
                .collect();
            self.replace(project, rules)?;
        }
        Ok(())
    }
}
