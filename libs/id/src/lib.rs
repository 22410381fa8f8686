//! # sgw-id
//!
//! Typed identifiers for the gateway eventing coordinator.
//!
//! All identifiers use a prefixed format: `{prefix}_{ulid}`, for example
//! `evt_01HV4Z2WQXKJNM8GPQY6VBKC3D`. The prefix makes log lines and stored
//! records self-describing and prevents mixing identifier kinds; the ULID
//! keeps identifiers time-sortable, which the event store relies on when it
//! breaks ties between events created in the same millisecond.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
