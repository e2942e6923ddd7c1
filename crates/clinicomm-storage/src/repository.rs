//! Repository layer for data access

pub mod compliance;
pub mod messages;
pub mod settings;
pub mod templates;
pub mod webhooks;

pub use compliance::{ComplianceRepository, DbComplianceRepository};
pub use messages::{MessageFilter, MessageRepository};
pub use settings::SettingsRepository;
pub use templates::{TemplateFilter, TemplateRepository};
pub use webhooks::{CreateWebhook, WebhookRepository};
