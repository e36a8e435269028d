//! Outbound messaging abstractions.

pub mod port;
pub mod queued;
pub mod types;
