//! # actlabs_core
//!
//! Core domain logic for the actlabs managed server: the per-user server
//! lifecycle, bearer-token verification, bad-request rate limiting and the
//! Azure collaborators they drive.

pub mod auth;
pub mod azure;
pub mod cloud;
pub mod config;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod rate_limit;
pub mod readiness;
pub mod secrets;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
