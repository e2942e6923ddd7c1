//! ClinicComm Storage - SQLite persistence
//!
//! Holds messages, templates, opt-outs, webhook registrations and the
//! delivery settings row. Migrations are embedded and applied on startup.

pub mod db;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use models::*;
pub use repository::*;
