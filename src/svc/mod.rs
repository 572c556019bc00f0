//! # Services module
//!
//! This module provides services to interact with kubernetes and external
//! HTTP apis, and the helpers to do so.

pub mod capabilities;
pub mod cfg;
pub mod crd;
pub mod disposable_engine;
pub mod expr;
pub mod http;
pub mod k8s;
pub mod request_generator;
pub mod response_check;
pub mod secret_patcher;
pub mod status_handler;
pub mod telemetry;
