//! HTTP layer for the registry gateway.
//!
//! Three axum routers share one [`AppState`](crate::AppState):
//!
//! - [`handler`]: the client-facing gateway that routes every request to the
//!   cache server or the origin registry and proxies it there
//! - [`cache_server`]: the internal file server over the cache directory
//! - [`admin`]: health and metrics for operators

pub mod admin;
pub mod cache_server;
pub mod forward;
pub mod handler;
