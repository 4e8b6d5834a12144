//! # nimbus-server
//!
//! REST API, server-sent event stream and process assembly for the nimbus
//! control plane.

pub mod api;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
