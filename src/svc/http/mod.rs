//! # HTTP module
//!
//! This module provides the outbound http client used to materialize
//! `Request`/`DisposableRequest` calls against external apis, and the
//! inbound server used to expose health and metrics endpoints.

pub mod client;
pub mod server;
