//! Error types for ClinicComm

use thiserror::Error;

/// Main error type for ClinicComm
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Missing template variables: {}", .0.join(", "))]
    Render(Vec<String>),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Provider temporarily unavailable: {0}")]
    ProviderTransient(String),

    #[error("Provider rejected message: {0}")]
    ProviderRejected(String),

    #[error("Recipient opted out: {0}")]
    ComplianceSuppressed(String),

    #[error("Scheduler unavailable: {0}")]
    SchedulerUnavailable(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Webhook error: {0}")]
    Webhook(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for ClinicComm
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Config(_) => 500,
            Error::Database(_) => 500,
            Error::Validation(_) => 422,
            Error::NotFound(_) => 404,
            Error::Render(_) => 422,
            Error::InvalidAddress(_) => 422,
            Error::ProviderTransient(_) => 502,
            Error::ProviderRejected(_) => 502,
            Error::ComplianceSuppressed(_) => 409,
            Error::SchedulerUnavailable(_) => 503,
            Error::InvalidTransition(_) => 409,
            Error::Webhook(_) => 502,
            Error::Internal(_) => 500,
            Error::Other(_) => 500,
        }
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Render(_) => "RENDER_ERROR",
            Error::InvalidAddress(_) => "INVALID_ADDRESS",
            Error::ProviderTransient(_) => "PROVIDER_TRANSIENT",
            Error::ProviderRejected(_) => "PROVIDER_REJECTED",
            Error::ComplianceSuppressed(_) => "OPTED_OUT",
            Error::SchedulerUnavailable(_) => "SCHEDULER_UNAVAILABLE",
            Error::InvalidTransition(_) => "INVALID_TRANSITION",
            Error::Webhook(_) => "WEBHOOK_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SchedulerUnavailable(_) | Error::ProviderTransient(_)
        )
    }
}
