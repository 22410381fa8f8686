//! Authorization of eventing operations under internally minted credentials.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sgw_events::{Event, EventingRule, PostProcess};
use tokio::sync::RwLock;
use tracing::debug;

use crate::collab::{AuthCollaborator, AuthError, EventingOp, IssuedToken};

/// A bearer credential minted by the gateway. Never logged or persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceCredential(Arc<str>);

impl ServiceCredential {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ServiceCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServiceCredential(<redacted>)")
    }
}

struct Cached {
    credential: ServiceCredential,
    expires_at: DateTime<Utc>,
}

/// Caches one kind of credential and re-mints it shortly before expiry.
struct CredentialCache {
    slot: RwLock<Option<Cached>>,
    refresh_before: chrono::Duration,
}

impl CredentialCache {
    fn new(refresh_before: Duration) -> Self {
        Self {
            slot: RwLock::new(None),
            refresh_before: chrono::Duration::from_std(refresh_before)
                .unwrap_or(chrono::Duration::zero()),
        }
    }

    fn fresh(&self, cached: &Option<Cached>, now: DateTime<Utc>) -> Option<ServiceCredential> {
        cached
            .as_ref()
            .filter(|c| c.expires_at - self.refresh_before > now)
            .map(|c| c.credential.clone())
    }

    async fn get<F, Fut>(&self, mint: F) -> Result<ServiceCredential, AuthError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<IssuedToken, AuthError>>,
    {
        if let Some(credential) = self.fresh(&*self.slot.read().await, Utc::now()) {
            return Ok(credential);
        }

        let mut slot = self.slot.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(credential) = self.fresh(&slot, Utc::now()) {
            return Ok(credential);
        }

        let issued = mint().await?;
        debug!(expires_at = %issued.expires_at, "Minted credential");
        let credential = ServiceCredential::new(issued.token);
        *slot = Some(Cached {
            credential: credential.clone(),
            expires_at: issued.expires_at,
        });
        Ok(credential)
    }
}

/// Decides whether an event's action may run and under which credential.
pub struct Authorizer {
    auth: Arc<dyn AuthCollaborator>,
    service: CredentialCache,
    internal: CredentialCache,
}

impl Authorizer {
    /// Credentials are re-minted `refresh_before` ahead of their expiry.
    pub fn new(auth: Arc<dyn AuthCollaborator>, refresh_before: Duration) -> Self {
        Self {
            auth,
            service: CredentialCache::new(refresh_before),
            internal: CredentialCache::new(refresh_before),
        }
    }

    /// Credential used to execute actions on a project's behalf.
    pub async fn service_credential(&self) -> Result<ServiceCredential, AuthError> {
        self.service.get(|| self.auth.sc_access_token()).await
    }

    /// Credential used for node-to-node calls.
    pub async fn internal_credential(&self) -> Result<ServiceCredential, AuthError> {
        self.internal.get(|| self.auth.internal_access_token()).await
    }

    /// Authorises the action of `event` and returns the redactions to apply
    /// to its payload.
    pub async fn authorize(
        &self,
        credential: &ServiceCredential,
        event: &Event,
        rule: Option<&EventingRule>,
    ) -> Result<PostProcess, AuthError> {
        let op = EventingOp {
            project: &event.project,
            event_type: &event.event_type,
            rule,
        };
        self.auth.is_eventing_op_authorised(credential.as_str(), op).await
    }

    /// Authorises a caller-supplied token, e.g. for queueing a custom event.
    pub async fn authorize_caller(
        &self,
        token: &str,
        op: EventingOp<'_>,
    ) -> Result<PostProcess, AuthError> {
        self.auth.is_eventing_op_authorised(token, op).await
    }

    pub fn verify_internal(&self, token: &str) -> Result<(), AuthError> {
        self.auth.verify_internal(token)
    }
}
