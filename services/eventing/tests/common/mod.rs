//! Shared harness for eventing integration tests.
//!
//! A `TestNode` wires the real delivery pipeline to in-process doubles: an
//! in-memory event store, `StaticAuth`, `MemoryCrud`. Delivery is driven
//! explicitly with `run_once` so tests stay deterministic; the HTTP API is
//! served on an ephemeral port when peers need to reach the node.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sgw_eventing::{
    api,
    authz::Authorizer,
    collab::{InternalClient, KeyedSchema, MemoryCrud, RecordingRealtimeSink, StaticAuth},
    db::{EventStore, MemoryEventStore},
    delivery::{Backoff, DeliveryConfig, DeliveryManager},
    dispatch::Dispatcher,
    partition::{MembershipView, TokenPartitioner},
    rules::RuleRegistry,
    state::{AppComponents, AppState},
    trigger::{Mutation, MutationHook, TriggerEvaluator},
};
use sgw_events::{ClusterNode, CrudOp, Event, EventingRule, RuleAction, TokenRange, TokenSpace};
use sgw_id::EventId;
use tokio::net::TcpListener;

pub const PROJECT: &str = "shop";
pub const SPACE_SIZE: u32 = 100;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sgw_eventing=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn space() -> TokenSpace {
    TokenSpace::new(SPACE_SIZE)
}

/// Immediate retries and a short deadline.
pub fn test_delivery_config() -> DeliveryConfig {
    DeliveryConfig {
        backoff: Backoff::none(),
        max_retries: 3,
        dispatch_timeout: Duration::from_secs(2),
        processing_lease: Duration::from_secs(60),
        shutdown_grace: Duration::from_secs(1),
        ..DeliveryConfig::default()
    }
}

pub struct TestNode {
    pub node_id: String,
    pub url: String,
    pub store: Arc<MemoryEventStore>,
    pub partitioner: Arc<TokenPartitioner>,
    pub registry: Arc<RuleRegistry>,
    pub auth: Arc<StaticAuth>,
    pub crud: Arc<MemoryCrud>,
    pub realtime: Arc<RecordingRealtimeSink>,
    pub dispatcher: Arc<Dispatcher>,
    pub delivery: DeliveryManager,
    pub state: AppState,
}

pub struct NodeBuilder {
    node_id: String,
    url: String,
    view: Option<MembershipView>,
    delivery: DeliveryConfig,
    functions_url: String,
    schema: KeyedSchema,
}

impl NodeBuilder {
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            url: format!("http://{node_id}.invalid"),
            view: None,
            delivery: test_delivery_config(),
            functions_url: "http://functions.invalid".to_string(),
            schema: KeyedSchema::default(),
        }
    }

    pub fn url(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }

    /// Defaults to a view where this node owns every token.
    pub fn view(mut self, view: MembershipView) -> Self {
        self.view = Some(view);
        self
    }

    pub fn delivery(mut self, config: DeliveryConfig) -> Self {
        self.delivery = config;
        self
    }

    pub fn functions_url(mut self, url: &str) -> Self {
        self.functions_url = url.to_string();
        self
    }

    pub fn build(self) -> TestNode {
        let space = space();
        let view = self
            .view
            .unwrap_or_else(|| MembershipView::single_node(1, space, &self.node_id, &self.url));

        let store = Arc::new(MemoryEventStore::new(&self.node_id, space));
        let store_dyn: Arc<dyn EventStore> = store.clone();
        let partitioner = Arc::new(TokenPartitioner::new(&self.node_id, view));
        let realtime = Arc::new(RecordingRealtimeSink::new());
        let registry = Arc::new(RuleRegistry::new(realtime.clone()));
        let auth = Arc::new(StaticAuth::new());
        let crud = Arc::new(MemoryCrud::new());
        let http = InternalClient::new(Duration::from_secs(5)).unwrap();

        let authorizer = Arc::new(Authorizer::new(auth.clone(), Duration::from_secs(60)));
        let dispatcher = Arc::new(Dispatcher::new(
            partitioner.clone(),
            authorizer.clone(),
            crud.clone(),
            http,
            &self.functions_url,
        ));
        let delivery = DeliveryManager::new(
            store_dyn.clone(),
            dispatcher.clone(),
            registry.clone(),
            self.delivery,
        );
        let hook = Arc::new(MutationHook::new(
            TriggerEvaluator::new(Arc::new(self.schema)),
            registry.clone(),
            store_dyn.clone(),
        ));

        let state = AppState::new(AppComponents {
            store: store_dyn,
            partitioner: partitioner.clone(),
            registry: registry.clone(),
            authorizer,
            hook,
            delivery: delivery.clone(),
            db: None,
        });

        TestNode {
            node_id: self.node_id,
            url: self.url,
            store,
            partitioner,
            registry,
            auth,
            crud,
            realtime,
            dispatcher,
            delivery,
            state,
        }
    }
}

impl TestNode {
    pub fn router(&self) -> axum::Router {
        api::create_router(self.state.clone())
    }

    /// Serves the node's API on `listener` until the test ends.
    pub fn serve(&self, listener: TcpListener) {
        let app = self.router();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
    }

    pub fn set_rules(&self, rules: Vec<EventingRule>) {
        self.registry.replace(PROJECT, rules).unwrap();
    }

    /// Reports a committed mutation through the mutation hook.
    pub async fn commit_mutation(&self, mutation: Mutation) -> Vec<EventId> {
        self.state.hook().on_committed(PROJECT, &mutation).await
    }

    pub async fn event(&self, id: EventId) -> Event {
        self.store.get(id).await.unwrap().expect("event is held by this node")
    }

    /// Runs delivery sweeps until one starts nothing. Returns the number of
    /// attempts made.
    pub async fn drain(&self) -> usize {
        let mut attempts = 0;
        for _ in 0..50 {
            let started = self.delivery.run_once().await.unwrap();
            if started == 0 {
                break;
            }
            attempts += started;
        }
        attempts
    }
}

/// Reserves an ephemeral port so the node's URL is known before it is built.
pub async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    (listener, url)
}

/// `a` owns `[0, 50)`, `b` owns `[50, 100)`.
pub fn split_view(version: u64, a: (&str, &str), b: (&str, &str)) -> MembershipView {
    let node = |(id, url): (&str, &str), start, end| ClusterNode {
        node_id: id.to_string(),
        url: url.to_string(),
        range: TokenRange::new(start, end).unwrap(),
    };
    MembershipView::new(version, space(), vec![node(a, 0, 50), node(b, 50, SPACE_SIZE)]).unwrap()
}

/// One node owning the whole space.
pub fn single_view(version: u64, (id, url): (&str, &str)) -> MembershipView {
    let node = ClusterNode {
        node_id: id.to_string(),
        url: url.to_string(),
        range: TokenRange::new(0, SPACE_SIZE).unwrap(),
    };
    MembershipView::new(version, space(), vec![node]).unwrap()
}

/// A routing key whose token falls in `range`.
pub fn key_in(range: TokenRange, prefix: &str) -> String {
    let space = space();
    (0..10_000)
        .map(|i| format!("{prefix}-{i}"))
        .find(|key| range.contains(space.token_for(key)))
        .expect("some key hashes into the range")
}

pub fn webhook_rule(id: &str, event_type: &str, url: &str) -> EventingRule {
    EventingRule {
        id: id.to_string(),
        source_db: String::new(),
        collection: String::new(),
        event_type: event_type.to_string(),
        action: RuleAction::InvokeWebhook { url: url.to_string() },
        retries: None,
        timeout_ms: None,
    }
}

pub fn audit_rule(id: &str) -> EventingRule {
    EventingRule {
        id: id.to_string(),
        source_db: "db".to_string(),
        collection: "orders".to_string(),
        event_type: "DB_INSERT".to_string(),
        action: RuleAction::InvokeCrud {
            db: "db".to_string(),
            collection: "order_log".to_string(),
            op: CrudOp::Create,
        },
        retries: None,
        timeout_ms: None,
    }
}

pub fn payload_seq(body: &[u8]) -> Option<i64> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value["data"]["seq"].as_i64()
}
