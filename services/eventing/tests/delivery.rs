//! Delivery integration tests.
//!
//! Drive staged events through the delivery manager against wiremock
//! targets and in-memory collaborators, on one node and across two.

mod common;

use std::time::Duration;

use serde_json::json;
use sgw_eventing::collab::{CrudCollaborator, CrudTarget, StaticAuth};
use sgw_eventing::db::EventStore;
use sgw_eventing::delivery::DeliveryConfig;
use sgw_eventing::trigger::Mutation;
use sgw_events::{EventStatus, MutationKind, NewEvent, TokenRange};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;

async fn webhook_target(status: u16, expected_calls: u64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(status))
        .expect(expected_calls)
        .mount(&server)
        .await;
    server
}

fn custom_event(rule: &str, key: &str, seq: i64) -> NewEvent {
    NewEvent::new(PROJECT, "order.paid", json!({"seq": seq}))
        .rule(rule)
        .routing_key(key)
}

#[tokio::test]
async fn local_webhook_event_is_processed_after_one_call() {
    init_tracing();
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("authorization", format!("Bearer {}", StaticAuth::SERVICE_TOKEN).as_str()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&target)
        .await;

    let node = NodeBuilder::new("node-a").build();
    node.set_rules(vec![webhook_rule("notify", "order.paid", &format!("{}/hook", target.uri()))]);
    let staged = node.store.stage(custom_event("notify", "o-1", 1)).await.unwrap();

    assert_eq!(node.drain().await, 1);

    let event = node.event(staged.id).await;
    assert_eq!(event.status, EventStatus::Processed);
    assert_eq!(event.retries, 0);
    let stats = node.delivery.stats();
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.processed, 1);

    let requests = target.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["id"], staged.id.to_string());
    assert_eq!(body["type"], "order.paid");
    assert_eq!(body["data"], json!({"seq": 1}));
    assert_eq!(
        requests[0].headers.get("x-event-id").unwrap().to_str().unwrap(),
        staged.id.to_string()
    );
}

#[tokio::test]
async fn committed_insert_reaches_its_webhook_once() {
    init_tracing();
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_partial_json(json!({"data": {"db": "db", "col": "orders"}})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&target)
        .await;

    let node = NodeBuilder::new("node-a").build();
    let mut rule = webhook_rule("on-order", "DB_INSERT", &format!("{}/hook", target.uri()));
    rule.source_db = "db".to_string();
    rule.collection = "orders".to_string();
    node.set_rules(vec![rule]);

    let staged = node
        .commit_mutation(Mutation {
            db: "db".to_string(),
            collection: "orders".to_string(),
            kind: MutationKind::Create,
            find: None,
            doc: Some(json!({"id": "o-7", "total": 30})),
            before: None,
        })
        .await;
    assert_eq!(staged.len(), 1);
    assert_eq!(node.event(staged[0]).await.status, EventStatus::Staged);

    assert_eq!(node.drain().await, 1);

    let event = node.event(staged[0]).await;
    assert_eq!(event.status, EventStatus::Processed);
    assert_eq!(event.event_type, "DB_INSERT");
    assert_eq!(event.rule.as_deref(), Some("on-order"));
    target.verify().await;
}

#[tokio::test]
async fn failing_webhook_stops_at_retry_ceiling() {
    init_tracing();
    let target = webhook_target(500, 3).await;

    let node = NodeBuilder::new("node-a").build();
    node.set_rules(vec![webhook_rule("notify", "order.paid", &format!("{}/hook", target.uri()))]);
    let staged = node.store.stage(custom_event("notify", "o-1", 1)).await.unwrap();

    assert_eq!(node.drain().await, 3);

    let event = node.event(staged.id).await;
    assert_eq!(event.status, EventStatus::Failed);
    assert_eq!(event.retries, 3);
    assert!(event.last_error.is_some());

    let stats = node.delivery.stats();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.failed, 1);
    target.verify().await;
}

#[tokio::test]
async fn rule_retry_override_wins_over_node_ceiling() {
    init_tracing();
    let target = webhook_target(503, 1).await;

    let node = NodeBuilder::new("node-a").build();
    let mut rule = webhook_rule("notify", "order.paid", &format!("{}/hook", target.uri()));
    rule.retries = Some(1);
    node.set_rules(vec![rule]);
    let staged = node.store.stage(custom_event("notify", "o-1", 1)).await.unwrap();

    node.drain().await;

    let event = node.event(staged.id).await;
    assert_eq!(event.status, EventStatus::Failed);
    assert_eq!(event.retries, 1);
}

#[tokio::test]
async fn denied_action_fails_without_retry() {
    init_tracing();
    let target = webhook_target(200, 0).await;

    let node = NodeBuilder::new("node-a").build();
    node.set_rules(vec![webhook_rule("notify", "order.paid", &format!("{}/hook", target.uri()))]);
    node.auth.deny_rule("notify");
    let staged = node.store.stage(custom_event("notify", "o-1", 1)).await.unwrap();

    assert_eq!(node.drain().await, 1);

    let event = node.event(staged.id).await;
    assert_eq!(event.status, EventStatus::Failed);
    assert_eq!(event.retries, 0);
    assert!(event.last_error.unwrap().contains("not authorised"));
}

#[tokio::test]
async fn attempt_deadline_counts_as_transient_failure() {
    init_tracing();
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&target)
        .await;

    let node = NodeBuilder::new("node-a")
        .delivery(DeliveryConfig {
            dispatch_timeout: Duration::from_millis(100),
            ..test_delivery_config()
        })
        .build();
    node.set_rules(vec![webhook_rule("notify", "order.paid", &format!("{}/hook", target.uri()))]);
    let staged = node.store.stage(custom_event("notify", "o-1", 1)).await.unwrap();

    assert_eq!(node.delivery.run_once().await.unwrap(), 1);

    let event = node.event(staged.id).await;
    assert_eq!(event.status, EventStatus::Staged);
    assert_eq!(event.retries, 1);
    assert!(event.last_error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn events_sharing_a_token_are_delivered_in_order() {
    init_tracing();
    let target = webhook_target(200, 3).await;

    let node = NodeBuilder::new("node-a").build();
    node.set_rules(vec![webhook_rule("notify", "order.paid", &format!("{}/hook", target.uri()))]);
    let mut ids = Vec::new();
    for seq in 1..=3 {
        ids.push(node.store.stage(custom_event("notify", "o-1", seq)).await.unwrap().id);
    }

    // One sweep starts only the head of the token.
    assert_eq!(node.delivery.run_once().await.unwrap(), 1);
    assert_eq!(node.event(ids[0]).await.status, EventStatus::Processed);
    assert_eq!(node.event(ids[1]).await.status, EventStatus::Staged);
    assert_eq!(node.event(ids[2]).await.status, EventStatus::Staged);

    node.drain().await;

    let seqs: Vec<i64> = target
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter_map(|req| payload_seq(&req.body))
        .collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[tokio::test]
async fn failing_head_blocks_its_token_but_not_others() {
    init_tracing();
    let target = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&target)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&target)
        .await;

    let node = NodeBuilder::new("node-a")
        .delivery(DeliveryConfig {
            backoff: sgw_eventing::delivery::Backoff {
                base: Duration::from_secs(60),
                max: Duration::from_secs(60),
                jitter: 0.0,
            },
            ..test_delivery_config()
        })
        .build();
    node.set_rules(vec![
        webhook_rule("flaky", "order.paid", &format!("{}/flaky", target.uri())),
        webhook_rule("notify", "order.shipped", &format!("{}/hook", target.uri())),
    ]);

    let head = node.store.stage(custom_event("flaky", "o-1", 1)).await.unwrap();
    let behind = node.store.stage(custom_event("notify", "o-1", 2)).await.unwrap();
    let elsewhere = node
        .store
        .stage(custom_event("notify", &other_key_for(&head), 3))
        .await
        .unwrap();

    node.drain().await;

    let head = node.event(head.id).await;
    assert_eq!(head.status, EventStatus::Staged);
    assert_eq!(head.retries, 1);
    assert_eq!(node.event(behind.id).await.status, EventStatus::Staged);
    assert_eq!(node.event(elsewhere.id).await.status, EventStatus::Processed);
}

/// A routing key whose token differs from `event`'s.
fn other_key_for(event: &sgw_events::Event) -> String {
    let space = space();
    (0..)
        .map(|i| format!("elsewhere-{i}"))
        .find(|key| space.token_for(key) != event.token)
        .unwrap()
}

#[tokio::test]
async fn redelivered_crud_event_writes_one_row() {
    init_tracing();
    let node = NodeBuilder::new("node-a").build();
    node.set_rules(vec![audit_rule("audit")]);

    let staged = node
        .commit_mutation(Mutation {
            db: "db".to_string(),
            collection: "orders".to_string(),
            kind: MutationKind::Create,
            find: None,
            doc: Some(json!({"id": "o-1", "total": 12})),
            before: None,
        })
        .await;
    assert_eq!(staged.len(), 1);
    let event = node.event(staged[0]).await;

    // The first attempt succeeded but its acknowledgment was lost.
    let rules = node.registry.snapshot(PROJECT);
    node.dispatcher.dispatch(&rules, &event).await.unwrap();
    node.dispatcher.dispatch(&rules, &event).await.unwrap();

    let rows = node.crud.documents(PROJECT, "db", "order_log");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], "o-1");
    assert_eq!(rows[0]["_event_id"], event.id.to_string());
}

#[tokio::test]
async fn redelivered_bulk_create_writes_each_row_once() {
    init_tracing();
    let node = NodeBuilder::new("node-a").build();
    node.set_rules(vec![audit_rule("audit")]);

    let event = node
        .store
        .stage(
            NewEvent::new(PROJECT, "DB_INSERT", json!({"doc": [{"id": "o-1"}, {"id": "o-2"}]}))
                .rule("audit")
                .routing_key("orders/bulk"),
        )
        .await
        .unwrap();

    let rules = node.registry.snapshot(PROJECT);
    node.dispatcher.dispatch(&rules, &event).await.unwrap();
    node.dispatcher.dispatch(&rules, &event).await.unwrap();

    let rows = node.crud.documents(PROJECT, "db", "order_log");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["_event_id"], format!("{}:0", event.id));
    assert_eq!(rows[1]["_event_id"], format!("{}:1", event.id));
}

#[tokio::test]
async fn bulk_create_fills_in_rows_missing_after_a_partial_write() {
    init_tracing();
    let node = NodeBuilder::new("node-a").build();
    node.set_rules(vec![audit_rule("audit")]);

    let event = node
        .store
        .stage(
            NewEvent::new(PROJECT, "DB_INSERT", json!({"doc": [{"id": "o-1"}, {"id": "o-2"}]}))
                .rule("audit")
                .routing_key("orders/bulk"),
        )
        .await
        .unwrap();

    // An earlier attempt got the first row in before failing.
    let target = CrudTarget {
        project: PROJECT,
        db: "db",
        collection: "order_log",
    };
    let first = json!({"id": "o-1", "_event_id": format!("{}:0", event.id)});
    node.crud.internal_create(target, "svc", first).await.unwrap();

    let rules = node.registry.snapshot(PROJECT);
    node.dispatcher.dispatch(&rules, &event).await.unwrap();

    let rows = node.crud.documents(PROJECT, "db", "order_log");
    let ids: Vec<&str> = rows.iter().filter_map(|row| row["id"].as_str()).collect();
    assert_eq!(ids, vec!["o-1", "o-2"]);
}

#[tokio::test]
async fn crud_outage_is_retried_until_it_succeeds() {
    init_tracing();
    let node = NodeBuilder::new("node-a").build();
    node.set_rules(vec![audit_rule("audit")]);
    node.crud.fail_next(2);

    let staged = node
        .commit_mutation(Mutation {
            db: "db".to_string(),
            collection: "orders".to_string(),
            kind: MutationKind::Create,
            find: None,
            doc: Some(json!({"id": "o-2"})),
            before: None,
        })
        .await;

    assert_eq!(node.drain().await, 3);

    let event = node.event(staged[0]).await;
    assert_eq!(event.status, EventStatus::Processed);
    assert_eq!(event.retries, 2);
    assert_eq!(node.crud.documents(PROJECT, "db", "order_log").len(), 1);
}

#[tokio::test]
async fn abandoned_attempt_is_recovered_as_a_failure() {
    init_tracing();
    let node = NodeBuilder::new("node-a")
        .delivery(DeliveryConfig {
            processing_lease: Duration::from_millis(20),
            ..test_delivery_config()
        })
        .build();
    node.set_rules(vec![webhook_rule("notify", "order.paid", "http://127.0.0.1:9/hook")]);
    let staged = node.store.stage(custom_event("notify", "o-1", 1)).await.unwrap();

    // Claimed by a worker that never reported back.
    node.store.mark_processing(staged.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(node.delivery.recover_once().await.unwrap(), 1);

    let event = node.event(staged.id).await;
    assert_eq!(event.status, EventStatus::Staged);
    assert_eq!(event.retries, 1);
    assert_eq!(node.delivery.stats().recovered, 1);
}

#[tokio::test]
async fn event_for_remote_token_is_forwarded_then_executed_by_owner() {
    init_tracing();
    let target = webhook_target(200, 1).await;
    let (listener_a, url_a) = bind().await;
    let (listener_b, url_b) = bind().await;
    let view = split_view(1, ("node-a", &url_a), ("node-b", &url_b));

    let a = NodeBuilder::new("node-a").url(&url_a).view(view.clone()).build();
    let b = NodeBuilder::new("node-b").url(&url_b).view(view).build();
    a.serve(listener_a);
    b.serve(listener_b);
    let rules = vec![webhook_rule("notify", "order.paid", &format!("{}/hook", target.uri()))];
    a.set_rules(rules.clone());
    b.set_rules(rules);

    let key = key_in(TokenRange::new(50, SPACE_SIZE).unwrap(), "order");
    let staged = a.store.stage(custom_event("notify", &key, 1)).await.unwrap();

    assert_eq!(a.drain().await, 1);
    assert_eq!(a.event(staged.id).await.status, EventStatus::Processed);
    assert_eq!(a.delivery.stats().forwarded, 1);

    // The owner holds the record with the same id and token.
    let held = b.event(staged.id).await;
    assert_eq!(held.status, EventStatus::Staged);
    assert_eq!(held.token, staged.token);
    assert_eq!(held.source_node_id, "node-a");

    assert_eq!(b.drain().await, 1);
    assert_eq!(b.event(staged.id).await.status, EventStatus::Processed);
    target.verify().await;
}

#[tokio::test]
async fn event_handed_back_after_rebalance_runs_once_on_its_origin() {
    init_tracing();
    let target = webhook_target(200, 1).await;
    let (listener_a, url_a) = bind().await;
    let (listener_b, url_b) = bind().await;
    let split = split_view(1, ("node-a", &url_a), ("node-b", &url_b));

    let a = NodeBuilder::new("node-a").url(&url_a).view(split.clone()).build();
    let b = NodeBuilder::new("node-b").url(&url_b).view(split).build();
    a.serve(listener_a);
    b.serve(listener_b);
    let rules = vec![webhook_rule("notify", "order.paid", &format!("{}/hook", target.uri()))];
    a.set_rules(rules.clone());
    b.set_rules(rules);

    let key = key_in(TokenRange::new(50, SPACE_SIZE).unwrap(), "order");
    let staged = a.store.stage(custom_event("notify", &key, 1)).await.unwrap();
    assert_eq!(a.drain().await, 1);
    assert_eq!(b.event(staged.id).await.status, EventStatus::Staged);
    assert_eq!(a.event(staged.id).await.forwarded_to.as_deref(), Some("node-b"));

    // The upper half moves back to node-a before node-b gets to it.
    let merged = single_view(2, ("node-a", &url_a));
    assert!(a.partitioner.apply(merged.clone()).unwrap());
    assert!(b.partitioner.apply(merged).unwrap());

    assert_eq!(b.drain().await, 1);
    let released = b.event(staged.id).await;
    assert_eq!(released.status, EventStatus::Processed);
    assert_eq!(released.forwarded_to.as_deref(), Some("node-a"));

    let taken_back = a.event(staged.id).await;
    assert_eq!(taken_back.status, EventStatus::Staged);
    assert_eq!(taken_back.forwarded_to, None);

    assert_eq!(a.drain().await, 1);
    let done = a.event(staged.id).await;
    assert_eq!(done.status, EventStatus::Processed);
    assert_eq!(done.forwarded_to, None);
    assert_eq!(a.delivery.stats().processed, 1);
    target.verify().await;
}

#[tokio::test]
async fn unreachable_owner_keeps_event_staged() {
    init_tracing();
    let (listener_b, url_b) = bind().await;
    // Nothing serves node-b.
    drop(listener_b);
    let view = split_view(1, ("node-a", "http://127.0.0.1:1"), ("node-b", &url_b));

    let a = NodeBuilder::new("node-a").view(view).build();
    a.set_rules(vec![webhook_rule("notify", "order.paid", "http://127.0.0.1:9/hook")]);

    let key = key_in(TokenRange::new(50, SPACE_SIZE).unwrap(), "order");
    let staged = a.store.stage(custom_event("notify", &key, 1)).await.unwrap();

    assert_eq!(a.delivery.run_once().await.unwrap(), 1);

    let event = a.event(staged.id).await;
    assert_eq!(event.status, EventStatus::Staged);
    assert_eq!(event.retries, 1);
    assert_eq!(a.delivery.stats().forwarded, 0);
}

#[tokio::test]
async fn stale_owner_refuses_and_sender_executes_after_view_update() {
    init_tracing();
    let target = webhook_target(200, 1).await;
    let (listener_a, url_a) = bind().await;
    let (listener_b, url_b) = bind().await;

    // node-a still routes the upper half to node-b; node-b already moved it
    // back to node-a.
    let old = split_view(1, ("node-a", &url_a), ("node-b", &url_b));
    let new = single_view(2, ("node-a", &url_a));

    let a = NodeBuilder::new("node-a").url(&url_a).view(old).build();
    let b = NodeBuilder::new("node-b").url(&url_b).view(new.clone()).build();
    a.serve(listener_a);
    b.serve(listener_b);
    a.set_rules(vec![webhook_rule("notify", "order.paid", &format!("{}/hook", target.uri()))]);

    let key = key_in(TokenRange::new(50, SPACE_SIZE).unwrap(), "order");
    let staged = a.store.stage(custom_event("notify", &key, 1)).await.unwrap();

    assert_eq!(a.delivery.run_once().await.unwrap(), 1);
    let event = a.event(staged.id).await;
    assert_eq!(event.status, EventStatus::Staged);
    assert_eq!(event.retries, 1);
    assert!(event.last_error.unwrap().contains("stale ownership"));
    assert!(b.store.get(staged.id).await.unwrap().is_none());

    assert!(a.partitioner.apply(new).unwrap());
    assert_eq!(a.delivery.run_once().await.unwrap(), 1);
    assert_eq!(a.event(staged.id).await.status, EventStatus::Processed);
    target.verify().await;
}

#[tokio::test]
async fn delivery_loop_stops_on_shutdown() {
    init_tracing();
    let target = webhook_target(200, 1).await;
    let node = NodeBuilder::new("node-a")
        .delivery(DeliveryConfig {
            poll_interval: Duration::from_millis(10),
            ..test_delivery_config()
        })
        .build();
    node.set_rules(vec![webhook_rule("notify", "order.paid", &format!("{}/hook", target.uri()))]);
    let staged = node.store.stage(custom_event("notify", "o-1", 1)).await.unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let delivery = node.delivery.clone();
    let handle = tokio::spawn(async move { delivery.run(shutdown_rx).await });

    let mut processed = false;
    for _ in 0..100 {
        if node.event(staged.id).await.status == EventStatus::Processed {
            processed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(processed, "event was not delivered by the loop");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("delivery loop did not stop")
        .unwrap();
}
