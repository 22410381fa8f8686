//! Auth boundary: minting internal credentials and deciding whether an
//! eventing operation is allowed.
//!
//! Tokens are HS256-signed JWTs carrying a [`Role`]. Internal tokens are
//! minted per node for node-to-node calls; service tokens are minted for
//! the actions eventing executes on a project's behalf.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sgw_events::{event_types, ActionKind, EventingRule, PostProcess, PostProcessAction, RuleAction};
use sgw_id::Ulid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// The caller may not perform the operation. Terminal for an event.
    #[error("operation not authorised: {0}")]
    Denied(String),

    #[error("invalid credential: {0}")]
    InvalidToken(String),

    #[error("failed to mint credential: {0}")]
    Mint(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Node-to-node traffic inside the cluster.
    Internal,
    /// Actions executed by the gateway on a project's behalf.
    Service,
    /// An end user of a project.
    User,
}

/// JWT claims carried by every token the gateway issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
}

/// A freshly minted credential and when it stops being valid.
#[derive(Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// What is being authorised.
#[derive(Debug, Clone, Copy)]
pub struct EventingOp<'a> {
    pub project: &'a str,
    pub event_type: &'a str,
    /// The rule whose action will run, if any.
    pub rule: Option<&'a EventingRule>,
}

/// Per-project eventing policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventingPolicy {
    /// Action kinds rules may run. Empty allows all.
    #[serde(default)]
    pub allowed_actions: BTreeSet<ActionKind>,

    /// Collections no rule may read from or write to.
    #[serde(default)]
    pub denied_collections: BTreeSet<String>,

    /// Whether end users may queue custom events.
    #[serde(default = "default_true")]
    pub allow_custom_events: bool,

    /// Redactions applied to payloads leaving the gateway.
    #[serde(default)]
    pub redactions: Vec<PostProcessAction>,
}

fn default_true() -> bool {
    true
}

impl Default for EventingPolicy {
    fn default() -> Self {
        Self {
            allowed_actions: BTreeSet::new(),
            denied_collections: BTreeSet::new(),
            allow_custom_events: true,
            redactions: Vec::new(),
        }
    }
}

impl EventingPolicy {
    pub fn check(&self, op: &EventingOp<'_>, role: Role) -> Result<PostProcess, AuthError> {
        let custom = !event_types::is_db_event(op.event_type);
        if role == Role::User && custom && !self.allow_custom_events {
            return Err(AuthError::Denied(format!(
                "custom events are disabled for project {}",
                op.project
            )));
        }

        if let Some(rule) = op.rule {
            let kind = rule.action.kind();
            if !self.allowed_actions.is_empty() && !self.allowed_actions.contains(&kind) {
                return Err(AuthError::Denied(format!("{kind} actions are not allowed")));
            }
            if self.denied_collections.contains(&rule.collection) {
                return Err(AuthError::Denied(format!(
                    "collection {} is closed to eventing",
                    rule.collection
                )));
            }
            if let RuleAction::InvokeCrud { collection, .. } = &rule.action {
                if self.denied_collections.contains(collection) {
                    return Err(AuthError::Denied(format!(
                        "collection {collection} is closed to eventing"
                    )));
                }
            }
        }

        Ok(PostProcess {
            actions: self.redactions.clone(),
        })
    }
}

#[async_trait]
pub trait AuthCollaborator: Send + Sync {
    /// Credential for calls to other gateway nodes.
    async fn internal_access_token(&self) -> Result<IssuedToken, AuthError>;

    /// Credential for actions executed on a project's behalf.
    async fn sc_access_token(&self) -> Result<IssuedToken, AuthError>;

    /// Decides whether `token` may run `op`, returning the redactions to
    /// apply to anything the operation sends out.
    async fn is_eventing_op_authorised(
        &self,
        token: &str,
        op: EventingOp<'_>,
    ) -> Result<PostProcess, AuthError>;

    /// Accepts only internal credentials.
    fn verify_internal(&self, token: &str) -> Result<(), AuthError>;
}

/// HS256 JWT auth with per-project policies.
pub struct JwtAuth {
    node_id: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
    policies: ArcSwap<HashMap<String, EventingPolicy>>,
}

impl JwtAuth {
    pub fn new(node_id: impl Into<String>, secret: &str, ttl: Duration) -> Self {
        Self {
            node_id: node_id.into(),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
            policies: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn set_policy(&self, project: &str, policy: EventingPolicy) {
        self.policies.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(project.to_string(), policy.clone());
            next
        });
    }

    /// Signs a token. Also used to issue user tokens in tests and tooling.
    pub fn issue(
        &self,
        sub: &str,
        role: Role,
        project: Option<&str>,
    ) -> Result<IssuedToken, AuthError> {
        let now = Utc::now();
        let ttl =
            chrono::Duration::from_std(self.ttl).map_err(|e| AuthError::Mint(e.to_string()))?;
        let expires_at = now + ttl;
        let claims = Claims {
            sub: sub.to_string(),
            role,
            project: project.map(str::to_string),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            jti: Ulid::new().to_string(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AuthError::Mint(e.to_string()))?;
        Ok(IssuedToken { token, expires_at })
    }

    pub fn claims(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

#[async_trait]
impl AuthCollaborator for JwtAuth {
    async fn internal_access_token(&self) -> Result<IssuedToken, AuthError> {
        self.issue(&self.node_id, Role::Internal, None)
    }

    async fn sc_access_token(&self) -> Result<IssuedToken, AuthError> {
        self.issue(&self.node_id, Role::Service, None)
    }

    async fn is_eventing_op_authorised(
        &self,
        token: &str,
        op: EventingOp<'_>,
    ) -> Result<PostProcess, AuthError> {
        let claims = self.claims(token)?;
        if claims.role == Role::User && claims.project.as_deref() != Some(op.project) {
            return Err(AuthError::Denied(format!(
                "token is not valid for project {}",
                op.project
            )));
        }

        let policies = self.policies.load();
        match policies.get(op.project) {
            Some(policy) => policy.check(&op, claims.role),
            None => EventingPolicy::default().check(&op, claims.role),
        }
    }

    fn verify_internal(&self, token: &str) -> Result<(), AuthError> {
        let claims = self.claims(token)?;
        if claims.role != Role::Internal {
            return Err(AuthError::Denied("internal credential required".to_string()));
        }
        Ok(())
    }
}

/// Fixed tokens and switchable decisions.
pub struct StaticAuth {
    deny: AtomicBool,
    fail_mint: AtomicBool,
    denied_rules: Mutex<BTreeSet<String>>,
    redactions: Mutex<Vec<PostProcessAction>>,
    minted: AtomicU64,
    ttl: Duration,
}

impl StaticAuth {
    pub const INTERNAL_TOKEN: &'static str = "internal-token";
    pub const SERVICE_TOKEN: &'static str = "service-token";

    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(3600))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            deny: AtomicBool::new(false),
            fail_mint: AtomicBool::new(false),
            denied_rules: Mutex::new(BTreeSet::new()),
            redactions: Mutex::new(Vec::new()),
            minted: AtomicU64::new(0),
            ttl,
        }
    }

    /// Denies every operation.
    pub fn deny_all(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    pub fn deny_rule(&self, rule: &str) {
        self.denied_rules
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(rule.to_string());
    }

    pub fn fail_minting(&self, fail: bool) {
        self.fail_mint.store(fail, Ordering::SeqCst);
    }

    pub fn set_redactions(&self, actions: Vec<PostProcessAction>) {
        *self.redactions.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = actions;
    }

    /// Number of credentials handed out so far.
    pub fn minted(&self) -> u64 {
        self.minted.load(Ordering::SeqCst)
    }

    fn mint(&self, token: &str) -> Result<IssuedToken, AuthError> {
        if self.fail_mint.load(Ordering::SeqCst) {
            return Err(AuthError::Mint("minting disabled".to_string()));
        }
        self.minted.fetch_add(1, Ordering::SeqCst);
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero());
        Ok(IssuedToken {
            token: token.to_string(),
            expires_at: Utc::now() + ttl,
        })
    }
}

impl Default for StaticAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthCollaborator for StaticAuth {
    async fn internal_access_token(&self) -> Result<IssuedToken, AuthError> {
        self.mint(Self::INTERNAL_TOKEN)
    }

    async fn sc_access_token(&self) -> Result<IssuedToken, AuthError> {
        self.mint(Self::SERVICE_TOKEN)
    }

    async fn is_eventing_op_authorised(
        &self,
        token: &str,
        op: EventingOp<'_>,
    ) -> Result<PostProcess, AuthError> {
        if token.is_empty() {
            return Err(AuthError::InvalidToken("empty token".to_string()));
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(AuthError::Denied("denied".to_string()));
        }
        if let Some(rule) = op.rule {
            let denied = self
                .denied_rules
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .contains(&rule.id);
            if denied {
                return Err(AuthError::Denied(format!("rule {} denied", rule.id)));
            }
        }
        let actions = self
            .redactions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        Ok(PostProcess { actions })
    }

    fn verify_internal(&self, token: &str) -> Result<(), AuthError> {
        if token == Self::INTERNAL_TOKEN {
            Ok(())
        } else {
            Err(AuthError::Denied("internal credential required".to_string()))
        }
    }
}
