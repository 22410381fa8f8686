//! # sgw-events
//!
//! Data model shared by every part of the eventing coordinator.
//!
//! ## Records
//!
//! - [`Event`]: one unit of work. It is staged durably, routed to the node
//!   owning its `token`, then executed or forwarded. Status changes are
//!   checked by [`EventStatus::can_transition_to`].
//! - [`EventingRule`]: configuration that turns a database mutation into an
//!   event and names the action to run. Rules for a project are grouped in a
//!   versioned [`RulesSnapshot`].
//! - [`TokenRange`] and [`ClusterNode`]: the partitioning of the token space
//!   across the cluster.
//! - [`PostProcess`]: field-level redaction applied to a payload before it
//!   leaves the gateway.

mod cluster;
mod error;
mod event;
mod postprocess;
mod rules;
mod types;

pub use cluster::*;
pub use error::EventError;
pub use event::*;
pub use postprocess::*;
pub use rules::*;
pub use types::*;
