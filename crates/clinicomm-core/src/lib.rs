//! ClinicComm Core - Patient message delivery engine
//!
//! This crate provides template rendering, channel adapters, the delivery
//! state machine and scheduler, automation triggers, compliance checks,
//! analytics and outbound webhooks.

pub mod analytics;
pub mod channels;
pub mod compliance;
pub mod delivery;
pub mod metrics;
pub mod settings;
pub mod templates;
pub mod triggers;
pub mod webhooks;

pub use analytics::{AnalyticsAggregator, AnalyticsWindow, ChannelStats, DailyPoint};
pub use channels::{
    normalize_address, AdapterRegistry, ChannelAdapter, ChannelCheck, OutboundMessage, SendOutcome,
};
pub use compliance::{ComplianceDecision, ComplianceGate, UnsubscribeLinks};
pub use delivery::{
    compose, CallbackKind, DeliveryTracker, MessageRequest, ProviderCallback, ScheduleOutcome,
    Scheduler,
};
pub use metrics::DeliveryMetrics;
pub use settings::SettingsManager;
pub use templates::{CreateTemplate, TemplateCatalog, UpdateTemplate};
pub use triggers::{TriggerEngine, TriggerReport, TriggerRequest};
pub use webhooks::{RegisterWebhook, WebhookNotifier};
