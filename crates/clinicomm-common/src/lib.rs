//! ClinicComm Common - Shared types and utilities
//!
//! This crate provides the channel model, the runtime delivery settings,
//! configuration and the error type shared across all ClinicComm crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::{Channel, DeliveryConfig};
