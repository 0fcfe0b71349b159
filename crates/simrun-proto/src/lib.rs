//! Wire messages shared by the simrun master, workers and task runners.
//!
//! This crate contains:
//! - JSON request/response bodies for every remote operation
//! - Route paths, so servers and clients cannot drift apart
//! - Error codes carried in error bodies and their mapping to domain errors

pub mod convert;
pub mod messages;
pub mod paths;

pub use convert::ErrorCode;
pub use messages::*;
