//! Request handlers.

pub mod server;
