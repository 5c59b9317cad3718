//! Nomad scheduler API layer
//!
//! This module provides a typed client for the subset of the nomad HTTP API
//! the driver consumes: job register/deregister, blocking job info queries,
//! job summaries, and allocation/node lookups.

pub mod client;
pub mod types;

pub use client::Client;
pub use types::*;
