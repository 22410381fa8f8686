//! Narrow interfaces to the rest of the gateway.
//!
//! The eventing core never talks to the CRUD engine, the schema module, the
//! auth module or realtime delivery directly. Each is reached through a trait
//! with one production adapter and one in-process double used by
//! single-node mode and tests.

mod auth;
mod crud;
mod http;
mod realtime;
mod schema;

pub use auth::{
    AuthCollaborator, AuthError, EventingOp, EventingPolicy, IssuedToken, JwtAuth, Role, StaticAuth,
};
pub use crud::{BatchOp, CrudCollaborator, CrudTarget, HttpCrudClient, MemoryCrud, EVENT_ID_FIELD};
pub use http::{HttpError, InternalClient, EVENT_ID_HEADER};
pub use realtime::{RealtimeSink, RecordingRealtimeSink, WatchRealtimeSink};
pub use schema::{KeyedSchema, SchemaCollaborator};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The collaborator refused the request itself; retrying will not help.
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

impl CollabError {
    /// 4xx answers other than 408/409/429 are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            CollabError::Http(e) => match e.status() {
                Some(status) => !(400..500).contains(&status) || matches!(status, 408 | 409 | 429),
                None => true,
            },
            CollabError::Invalid(_) => false,
            CollabError::Unavailable(_) => true,
        }
    }
}
