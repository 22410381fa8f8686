//! Where membership views come from.

use async_trait::async_trait;
use serde::Deserialize;
use sgw_events::{ClusterNode, TokenSpace};
use tokio::sync::Mutex;

use super::{MembershipView, PartitionError};
use crate::collab::InternalClient;

/// The cluster coordination service, as seen by this node.
#[async_trait]
pub trait MembershipSource: Send + Sync {
    async fn fetch(&self) -> Result<MembershipView, PartitionError>;
}

/// Body of `GET /v1/cluster/members` on the coordinator.
#[derive(Debug, Deserialize)]
struct MembersResponse {
    version: u64,
    nodes: Vec<ClusterNode>,
}

/// Polls the coordinator over HTTP.
pub struct HttpMembershipSource {
    client: InternalClient,
    url: String,
    space: TokenSpace,
}

impl HttpMembershipSource {
    pub fn new(client: InternalClient, coordinator_url: &str, space: TokenSpace) -> Self {
        Self {
            client,
            url: format!("{}/v1/cluster/members", coordinator_url.trim_end_matches('/')),
            space,
        }
    }
}

#[async_trait]
impl MembershipSource for HttpMembershipSource {
    async fn fetch(&self) -> Result<MembershipView, PartitionError> {
        let members: MembersResponse = self
            .client
            .get_json(&self.url, None)
            .await
            .map_err(|e| PartitionError::Source(e.to_string()))?;
        MembershipView::new(members.version, self.space, members.nodes)
    }
}

/// A fixed view that can be swapped by hand. Used for single-node
/// deployments and in tests.
pub struct StaticMembership {
    view: Mutex<MembershipView>,
}

impl StaticMembership {
    pub fn new(view: MembershipView) -> Self {
        Self {
            view: Mutex::new(view),
        }
    }

    pub async fn set(&self, view: MembershipView) {
        *self.view.lock().await = view;
    }
}

#[async_trait]
impl MembershipSource for StaticMembership {
    async fn fetch(&self) -> Result<MembershipView, PartitionError> {
        Ok(self.view.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn http_source_builds_validated_view() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/cluster/members"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "version": 7,
                "nodes": [
                    {"node_id": "b", "url": "http://b", "range": {"start": 50, "end": 100}},
                    {"node_id": "a", "url": "http://a", "range": {"start": 0, "end": 50}},
                ],
            })))
            .mount(&server)
            .await;

        let client = InternalClient::new(Duration::from_secs(5)).unwrap();
        let source = HttpMembershipSource::new(client, &server.uri(), TokenSpace::new(100));
        let view = source.fetch().await.unwrap();
        assert_eq!(view.version, 7);
        assert_eq!(view.nodes()[0].node_id, "a");
        assert!(view.is_complete());
    }

    #[tokio::test]
    async fn http_source_rejects_overlapping_view() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/cluster/members"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "version": 2,
                "nodes": [
                    {"node_id": "a", "url": "http://a", "range": {"start": 0, "end": 60}},
                    {"node_id": "b", "url": "http://b", "range": {"start": 40, "end": 100}},
                ],
            })))
            .mount(&server)
            .await;

        let client = InternalClient::new(Duration::from_secs(5)).unwrap();
        let source = HttpMembershipSource::new(client, &server.uri(), TokenSpace::new(100));
        assert!(matches!(source.fetch().await, Err(PartitionError::InvalidView(_))));
    }

    #[tokio::test]
    async fn http_source_reports_unreachable_coordinator() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = InternalClient::new(Duration::from_secs(5)).unwrap();
        let source = HttpMembershipSource::new(client, &server.uri(), TokenSpace::new(100));
        assert!(matches!(source.fetch().await, Err(PartitionError::Source(_))));
    }
}
