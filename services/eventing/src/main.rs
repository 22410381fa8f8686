//! sgw eventing coordinator
//!
//! Runs one gateway node's share of eventing: it stages events raised by
//! committed mutations and client requests, routes each event to the node
//! owning its token, and drives delivery to a final status.

use std::sync::Arc;

use anyhow::Result;
use sgw_eventing::{
    api,
    authz::Authorizer,
    collab::{HttpCrudClient, InternalClient, JwtAuth, WatchRealtimeSink},
    config::{self, StoreBackend},
    db::{Database, EventStore, MemoryEventStore},
    delivery::DeliveryManager,
    dispatch::Dispatcher,
    partition::{HttpMembershipSource, MembershipRefresher, MembershipView, TokenPartitioner},
    rules::{RuleRegistry, RulesFile},
    state::{AppComponents, AppState},
    trigger::{MutationHook, TriggerEvaluator},
};
use sgw_events::TokenSpace;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SGW_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting sgw eventing coordinator");
    info!(
        listen_addr = %config.listen_addr,
        node_id = %config.node_id,
        token_space = config.token_space,
        store = ?config.store,
        "Configuration loaded"
    );

    let space = TokenSpace::new(config.token_space);

    // Event store
    let (store, db): (Arc<dyn EventStore>, Option<Database>) = match config.store {
        StoreBackend::Memory => {
            warn!("Using the in-memory event store; staged events do not survive a restart");
            (Arc::new(MemoryEventStore::new(&config.node_id, space)), None)
        }
        StoreBackend::Postgres => {
            let db = match Database::connect(&config.database).await {
                Ok(db) => {
                    info!("Database connection established");
                    db
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };

            // Run migrations in dev mode
            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = db.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }

            (Arc::new(db.event_store(&config.node_id, space)), Some(db))
        }
    };

    // Rules, schema keys and authorization policies
    let rules_file = match &config.rules_file {
        Some(path) => {
            info!(path = %path.display(), "Loading eventing rules");
            RulesFile::load(path)?
        }
        None => {
            warn!("SGW_RULES_FILE not set; starting without eventing rules");
            RulesFile::default()
        }
    };

    let auth = Arc::new(JwtAuth::new(&config.node_id, &config.jwt_secret, config.token_ttl));
    for (project, project_config) in &rules_file.projects {
        if let Some(policy) = &project_config.policy {
            auth.set_policy(project, policy.clone());
        }
    }

    let realtime = Arc::new(WatchRealtimeSink::new());
    let registry = Arc::new(RuleRegistry::new(realtime));
    registry.load(&rules_file)?;
    info!(projects = registry.projects().len(), "Eventing rules loaded");

    // Membership
    let http = InternalClient::new(config.http_timeout)?;
    let (partitioner, refresher) = match &config.coordinator_url {
        Some(url) => {
            let partitioner = Arc::new(TokenPartitioner::new(
                &config.node_id,
                MembershipView::empty(space),
            ));
            let source = Arc::new(HttpMembershipSource::new(http.clone(), url, space));
            let refresher =
                MembershipRefresher::new(source, partitioner.clone(), config.membership_refresh);
            if let Err(e) = refresher.refresh_once().await {
                warn!(
                    error = %e,
                    coordinator = %url,
                    "Initial membership fetch failed; events stay staged until a view arrives",
                );
            }
            (partitioner, Some(refresher))
        }
        None => {
            info!("No coordinator configured; this node owns the whole token space");
            let view = MembershipView::single_node(1, space, &config.node_id, &config.node_url);
            (Arc::new(TokenPartitioner::new(&config.node_id, view)), None)
        }
    };

    // Delivery pipeline
    let authorizer = Arc::new(Authorizer::new(auth, config.credential_refresh_before));
    let crud = Arc::new(HttpCrudClient::new(http.clone(), &config.gateway_url));
    let dispatcher = Arc::new(Dispatcher::new(
        partitioner.clone(),
        authorizer.clone(),
        crud,
        http,
        &config.functions_url,
    ));
    let delivery = DeliveryManager::new(
        store.clone(),
        dispatcher,
        registry.clone(),
        config.delivery.clone(),
    );

    let evaluator = TriggerEvaluator::new(Arc::new(rules_file.keyed_schema()));
    let hook = Arc::new(MutationHook::new(evaluator, registry.clone(), store.clone()));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start membership refresher in background
    let refresher_handle = refresher.map(|refresher| {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            refresher.run(shutdown_rx).await;
        })
    });

    // Start delivery manager in background
    let delivery_handle = tokio::spawn({
        let delivery = delivery.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move {
            delivery.run(shutdown_rx).await;
        }
    });

    // Create application state
    let state = AppState::new(AppComponents {
        store,
        partitioner,
        registry,
        authorizer,
        hook,
        delivery,
        db,
    });

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Wait for workers to finish. The delivery manager drains in-flight
    // attempts within its own grace period first.
    info!("Waiting for workers to shut down...");
    let shutdown_timeout = config.delivery.shutdown_grace + std::time::Duration::from_secs(5);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, delivery_handle).await {
        warn!(error = %e, "Delivery manager did not shut down in time");
    }

    if let Some(handle) = refresher_handle {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Membership refresher did not shut down in time");
        }
    }

    info!("Eventing coordinator shutdown complete");
    Ok(())
}
