//! ClinicComm API - REST API server
//!
//! This crate exposes the delivery core over HTTP: direct and triggered
//! scheduling, provider callbacks, templates, settings, opt-outs, webhooks
//! and analytics.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod routes;

pub use auth::AppState;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
