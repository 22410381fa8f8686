//! Outbound HTTP shared by the dispatcher and the collaborator adapters.

use std::time::Duration;

use reqwest::Method;
use serde::de::DeserializeOwned;
use sgw_id::EventId;
use thiserror::Error;
use tracing::{debug, warn};

/// Header carrying the event id so targets can de-duplicate redeliveries.
pub const EVENT_ID_HEADER: &str = "x-event-id";

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("invalid response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Thin wrapper over a pooled `reqwest::Client`.
#[derive(Clone)]
pub struct InternalClient {
    client: reqwest::Client,
}

impl InternalClient {
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(HttpError::Build)?;
        Ok(Self { client })
    }

    /// Sends one request and fails on any non-2xx status.
    ///
    /// `token` goes out as a bearer credential; it is never logged.
    pub async fn make_http_request(
        &self,
        method: Method,
        url: &str,
        token: Option<&str>,
        event_id: Option<EventId>,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, HttpError> {
        let mut request = self.client.request(method.clone(), url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(id) = event_id {
            request = request.header(EVENT_ID_HEADER, id.to_string());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(method = %method, url = %url, "Sending request");
        let response = request.send().await.map_err(|source| HttpError::Transport {
            url: url.to_string(),
            source,
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, url = %url, body = %body, "Request rejected");
            return Err(HttpError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        token: Option<&str>,
    ) -> Result<T, HttpError> {
        let response = self.make_http_request(Method::GET, url, token, None, None).await?;
        read_json(url, response).await
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        token: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<T, HttpError> {
        let response = self
            .make_http_request(Method::POST, url, token, None, Some(body))
            .await?;
        read_json(url, response).await
    }
}

async fn read_json<T: DeserializeOwned>(
    url: &str,
    response: reqwest::Response,
) -> Result<T, HttpError> {
    response.json().await.map_err(|e| HttpError::Decode {
        url: url.to_string(),
        reason: e.to_string(),
    })
}
