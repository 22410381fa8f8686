//! Application state shared across request handlers.

use std::sync::Arc;

use crate::authz::Authorizer;
use crate::db::{Database, EventStore};
use crate::delivery::DeliveryManager;
use crate::partition::TokenPartitioner;
use crate::rules::RuleRegistry;
use crate::trigger::MutationHook;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn EventStore>,
    partitioner: Arc<TokenPartitioner>,
    registry: Arc<RuleRegistry>,
    authorizer: Arc<Authorizer>,
    hook: Arc<MutationHook>,
    delivery: DeliveryManager,
    db: Option<Database>,
}

/// Components the state is assembled from.
pub struct AppComponents {
    pub store: Arc<dyn EventStore>,
    pub partitioner: Arc<TokenPartitioner>,
    pub registry: Arc<RuleRegistry>,
    pub authorizer: Arc<Authorizer>,
    pub hook: Arc<MutationHook>,
    pub delivery: DeliveryManager,
    /// Present when events are kept in Postgres; checked by `/readyz`.
    pub db: Option<Database>,
}

impl AppState {
    pub fn new(components: AppComponents) -> Self {
        let AppComponents {
            store,
            partitioner,
            registry,
            authorizer,
            hook,
            delivery,
            db,
        } = components;
        Self {
            inner: Arc::new(AppStateInner {
                store,
                partitioner,
                registry,
                authorizer,
                hook,
                delivery,
                db,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.inner.store
    }

    pub fn partitioner(&self) -> &TokenPartitioner {
        &self.inner.partitioner
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.inner.registry
    }

    pub fn authorizer(&self) -> &Authorizer {
        &self.inner.authorizer
    }

    pub fn hook(&self) -> &MutationHook {
        &self.inner.hook
    }

    pub fn delivery(&self) -> &DeliveryManager {
        &self.inner.delivery
    }

    pub fn db(&self) -> Option<&Database> {
        self.inner.db.as_ref()
    }
}
