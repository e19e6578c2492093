//! Request middleware.

pub mod admission;
