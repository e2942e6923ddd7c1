//! API request handlers

pub mod analytics;
pub mod callbacks;
pub mod compliance;
pub mod config;
pub mod events;
pub mod health;
pub mod messages;
pub mod metrics;
pub mod templates;
pub mod webhooks;

pub use health::*;
