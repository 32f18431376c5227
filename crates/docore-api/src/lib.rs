//! docore HTTP API.
//!
//! Accepts log events on `POST /api/logs`, stamps and validates them, and
//! publishes them to the channel for the delivery engine.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod server;

pub use config::Config;
pub use server::{create_router, shutdown_signal, start_server, AppState};
