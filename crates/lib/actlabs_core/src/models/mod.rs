//! Domain models shared by the orchestrator, the cloud clients and the API.

pub mod auth;
pub mod server;

pub use auth::{Audience, AuthClaim};
pub use server::{ResourceNames, ServerRecord, ServerStatus};
