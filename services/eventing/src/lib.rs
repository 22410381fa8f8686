//! sgw eventing coordinator library.
//!
//! This crate primarily ships an `eventing` binary, but exposes its
//! components to enable integration testing and embedding in a gateway
//! process.

pub mod api;
pub mod authz;
pub mod collab;
pub mod config;
pub mod db;
pub mod delivery;
pub mod dispatch;
pub mod partition;
pub mod rules;
pub mod state;
pub mod trigger;
