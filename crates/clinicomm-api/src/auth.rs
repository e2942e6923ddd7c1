//! Application state and API key authentication

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use clinicomm_common::{Config, Result};
use clinicomm_core::{
    AdapterRegistry, AnalyticsAggregator, ComplianceGate, DeliveryMetrics, DeliveryTracker,
    Scheduler, SettingsManager, TemplateCatalog, TriggerEngine, UnsubscribeLinks,
    WebhookNotifier,
};
use clinicomm_storage::repository::{
    DbComplianceRepository, MessageRepository, SettingsRepository, TemplateRepository,
    WebhookRepository,
};
use clinicomm_storage::DatabasePool;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db_pool: DatabasePool,
    pub messages: MessageRepository,
    pub scheduler: Arc<Scheduler>,
    pub tracker: Arc<DeliveryTracker>,
    pub triggers: Arc<TriggerEngine>,
    pub catalog: TemplateCatalog,
    pub compliance: ComplianceGate,
    pub settings: Arc<SettingsManager>,
    pub adapters: Arc<AdapterRegistry>,
    pub webhooks: Arc<WebhookNotifier>,
    pub analytics: AnalyticsAggregator,
    pub unsubscribe: Option<UnsubscribeLinks>,
    pub metrics: DeliveryMetrics,
    pub api_key: Option<String>,
}

impl AppState {
    /// Wire every service over one database pool
    pub async fn build(
        config: &Config,
        db_pool: DatabasePool,
        adapters: AdapterRegistry,
    ) -> Result<Self> {
        let pool = db_pool.pool().clone();
        let messages = MessageRepository::new(pool.clone());
        let catalog = TemplateCatalog::new(TemplateRepository::new(pool.clone()));
        let compliance = ComplianceGate::new(Arc::new(DbComplianceRepository::new(
            db_pool.clone(),
        )));
        let settings = Arc::new(
            SettingsManager::load(SettingsRepository::new(pool.clone()), config.delivery.clone())
                .await?,
        );
        let webhooks = Arc::new(WebhookNotifier::new(
            WebhookRepository::new(pool),
            config.webhooks.clone(),
        )?);
        let metrics = DeliveryMetrics::new()?;
        let adapters = Arc::new(adapters);

        let unsubscribe = match &config.server.unsubscribe_secret {
            Some(secret) if !secret.is_empty() => {
                Some(UnsubscribeLinks::new(secret.as_bytes(), &config.server.public_url))
            }
            _ => {
                info!("No unsubscribe secret configured, unsubscribe links disabled");
                None
            }
        };

        let mut scheduler = Scheduler::new(
            messages.clone(),
            Arc::clone(&adapters),
            compliance.clone(),
            settings.subscribe(),
            &config.scheduler,
        )
        .with_webhooks(Arc::clone(&webhooks))
        .with_metrics(metrics.clone());
        if let Some(links) = &unsubscribe {
            scheduler = scheduler.with_unsubscribe_links(links.clone());
        }
        let scheduler = Arc::new(scheduler);

        let tracker = Arc::new(
            DeliveryTracker::new(messages.clone(), compliance.clone(), settings.subscribe())
                .with_webhooks(Arc::clone(&webhooks)),
        );
        let triggers = Arc::new(TriggerEngine::new(catalog.clone(), Arc::clone(&scheduler)));

        Ok(Self {
            db_pool,
            analytics: AnalyticsAggregator::new(messages.clone()),
            messages,
            scheduler,
            tracker,
            triggers,
            catalog,
            compliance,
            settings,
            adapters,
            webhooks,
            unsubscribe,
            metrics,
            api_key: config.server.api_key.clone().filter(|k| !k.is_empty()),
        })
    }
}

/// Extract API key from request
pub fn extract_api_key(req: &Request) -> Option<&str> {
    // Check Authorization header
    if let Some(auth) = req.headers().get("authorization") {
        if let Ok(auth_str) = auth.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token);
            }
        }
    }

    // Check X-API-Key header
    req.headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
}

/// Compare digests so the check does not leak the key length or prefix
fn keys_match(provided: &str, expected: &str) -> bool {
    Sha256::digest(provided.as_bytes()) == Sha256::digest(expected.as_bytes())
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> std::result::Result<Response, StatusCode> {
    let Some(expected) = &state.api_key else {
        return Ok(next.run(request).await);
    };

    let api_key = extract_api_key(&request).ok_or_else(|| {
        warn!("Missing API key in request to {}", request.uri().path());
        StatusCode::UNAUTHORIZED
    })?;

    if !keys_match(api_key, expected) {
        warn!("Invalid API key in request to {}", request.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}
