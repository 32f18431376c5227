//! HTTP middleware for authentication and ingress throttling.
pub mod auth;
pub mod rate_limit;
