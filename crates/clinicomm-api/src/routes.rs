//! API routes

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::auth::{auth_middleware, AppState};
use crate::handlers::{
    analytics, callbacks, compliance, config, events, health, messages, metrics, templates,
    webhooks,
};

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    // Health check routes (no auth required)
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/ready", get(health::readiness))
        .route("/detailed", get(health::health_detailed));

    // Message routes
    let message_routes = Router::new()
        .route("/", get(messages::list_messages))
        .route("/", post(messages::create_message))
        .route("/:id", get(messages::get_message))
        .route("/:id/cancel", post(messages::cancel_message));

    // Template routes
    let template_routes = Router::new()
        .route("/", get(templates::list_templates))
        .route("/", post(templates::create_template))
        .route("/:id", get(templates::get_template))
        .route("/:id", put(templates::update_template))
        .route("/:id", delete(templates::delete_template))
        .route("/:id/duplicate", post(templates::duplicate_template))
        .route("/:id/default", post(templates::set_default_template));

    // Delivery settings routes
    let config_routes = Router::new()
        .route("/", get(config::get_config))
        .route("/", put(config::update_config))
        .route("/test", post(config::test_config));

    // Opt-out routes
    let compliance_routes = Router::new()
        .route("/opt-outs", get(compliance::list_opt_outs))
        .route("/opt-outs", post(compliance::create_opt_out))
        .route("/opt-outs/:address", delete(compliance::delete_opt_out));

    // Webhook routes
    let webhook_routes = Router::new()
        .route("/", get(webhooks::list_webhooks))
        .route("/", post(webhooks::create_webhook))
        .route("/:id", delete(webhooks::delete_webhook))
        .route("/:id/activate", post(webhooks::activate_webhook))
        .route("/:id/deactivate", post(webhooks::deactivate_webhook));

    // Analytics routes
    let analytics_routes = Router::new()
        .route("/", get(analytics::get_analytics))
        .route("/series", get(analytics::get_analytics_series));

    // API v1 routes with authentication
    let protected = Router::new()
        .route("/events", post(events::trigger_event))
        .route("/callbacks/:channel", post(callbacks::provider_callback))
        .nest("/messages", message_routes)
        .nest("/templates", template_routes)
        .nest("/config", config_routes)
        .nest("/compliance", compliance_routes)
        .nest("/webhooks", webhook_routes)
        .nest("/analytics", analytics_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Patients follow this link from their inbox
    let api_v1 = Router::new()
        .merge(protected)
        .route("/unsubscribe/:token", get(compliance::unsubscribe))
        .nest("/health", health_routes);

    // Combine all routes
    Router::new()
        .nest("/api/v1", api_v1)
        .route("/metrics", get(metrics::metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue, StatusCode};
    use axum_test::TestServer;
    use clinicomm_common::Config;
    use clinicomm_core::AdapterRegistry;
    use clinicomm_storage::DatabasePool;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    async fn server_with(config: Config) -> TestServer {
        let db = DatabasePool::in_memory().await.unwrap();
        let state = AppState::build(&config, db, AdapterRegistry::new())
            .await
            .unwrap();
        TestServer::new(create_router(Arc::new(state))).unwrap()
    }

    async fn server() -> TestServer {
        server_with(Config::default()).await
    }

    fn future(hours: i64) -> String {
        (chrono::Utc::now() + chrono::Duration::hours(hours)).to_rfc3339()
    }

    #[tokio::test]
    async fn health_is_public() {
        let mut config = Config::default();
        config.server.api_key = Some("ck_test".to_string());
        let server = server_with(config).await;

        server.get("/api/v1/health").await.assert_status_ok();
        assert_eq!(
            server.get("/api/v1/messages").await.status_code(),
            StatusCode::UNAUTHORIZED
        );

        let authorized = server
            .get("/api/v1/messages")
            .add_header(
                HeaderName::from_static("x-api-key"),
                HeaderValue::from_static("ck_test"),
            )
            .await;
        authorized.assert_status_ok();
    }

    #[tokio::test]
    async fn schedule_get_and_cancel_message() {
        let server = server().await;

        let created = server
            .post("/api/v1/messages")
            .json(&json!({
                "channel": "sms",
                "recipient": { "name": "Carlos", "address": "(11) 99999-0000" },
                "content": "Olá {{patientName}}, sua consulta é amanhã",
                "variables": { "patientName": "Carlos" },
                "scheduled_for": future(2)
            }))
            .await;
        assert_eq!(created.status_code(), StatusCode::CREATED);
        let body: Value = created.json();
        assert_eq!(body["status"], "scheduled");
        assert_eq!(body["content"], "Olá Carlos, sua consulta é amanhã");
        let id = body["id"].as_str().unwrap().to_string();

        let fetched: Value = server.get(&format!("/api/v1/messages/{}", id)).await.json();
        assert_eq!(fetched["id"], id.as_str());

        let cancelled: Value = server
            .post(&format!("/api/v1/messages/{}/cancel", id))
            .await
            .json();
        assert_eq!(cancelled["status"], "cancelled");

        let again = server
            .post(&format!("/api/v1/messages/{}/cancel", id))
            .await;
        assert_eq!(again.status_code(), StatusCode::CONFLICT);
        let error: Value = again.json();
        assert_eq!(error["error"]["code"], "INVALID_TRANSITION");
    }

    #[tokio::test]
    async fn render_error_lists_missing_variables() {
        let server = server().await;

        let response = server
            .post("/api/v1/messages")
            .json(&json!({
                "channel": "sms",
                "recipient": { "name": "Carlos", "address": "11999990000" },
                "content": "Pagamento de {{price}} em {{paymentLink}}"
            }))
            .await;

        assert_eq!(response.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: Value = response.json();
        assert_eq!(body["error"]["code"], "RENDER_ERROR");
        assert_eq!(body["error"]["missing_variables"], json!(["paymentLink", "price"]));
    }

    #[tokio::test]
    async fn opted_out_message_is_stored_as_failed() {
        let server = server().await;

        server
            .post("/api/v1/compliance/opt-outs")
            .json(&json!({ "address": "+55 11 99999-0000", "reason": "STOP" }))
            .await
            .assert_status(StatusCode::CREATED);

        let body: Value = server
            .post("/api/v1/messages")
            .json(&json!({
                "channel": "sms",
                "recipient": { "name": "Carlos", "address": "11999990000" },
                "content": "Lembrete"
            }))
            .await
            .json();
        assert_eq!(body["status"], "failed_terminal");
        assert_eq!(body["failure_reason"], "opted_out");

        server
            .delete("/api/v1/compliance/opt-outs/5511999990000")
            .await
            .assert_status(StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn template_lifecycle_and_trigger() {
        let server = server().await;

        let template: Value = server
            .post("/api/v1/templates")
            .json(&json!({
                "name": "Lembrete",
                "channel": "email",
                "category": "reminder",
                "subject": "Consulta em {{appointmentDate}}",
                "content": "Olá {{patientName}}, sua consulta é em {{appointmentDate}}"
            }))
            .await
            .json();
        let id = template["id"].as_str().unwrap().to_string();
        assert_eq!(
            template["variables"],
            json!(["appointmentDate", "patientName"])
        );

        server
            .post(&format!("/api/v1/templates/{}/default", id))
            .await
            .assert_status_ok();

        let copy = server
            .post(&format!("/api/v1/templates/{}/duplicate", id))
            .await;
        assert_eq!(copy.status_code(), StatusCode::CREATED);
        assert_eq!(copy.json::<Value>()["name"], "Lembrete (copy)");

        let event = json!({
            "event_type": "appointment_reminder",
            "entity_id": "42",
            "occurs_at": future(48),
            "recipient": { "name": "Carlos", "email": "carlos@example.com" },
            "variables": { "appointmentDate": "10/03/2025" },
            "hours_before": [24],
            "channels": ["email"]
        });

        let first: Value = server.post("/api/v1/events").json(&event).await.json();
        let second: Value = server.post("/api/v1/events").json(&event).await.json();
        assert_eq!(first["scheduled"].as_array().unwrap().len(), 1);
        assert_eq!(second["duplicates"].as_array().unwrap().len(), 1);
        assert_eq!(
            second["duplicates"][0]["message_id"],
            first["scheduled"][0]["message_id"]
        );

        let listed: Value = server.get("/api/v1/messages?entity_id=42").await.json();
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn config_update_is_validated() {
        let server = server().await;

        let mut config: Value = server.get("/api/v1/config").await.json();
        config["retry_attempts"] = json!(5);
        let updated: Value = server.put("/api/v1/config").json(&config).await.json();
        assert_eq!(updated["retry_attempts"], 5);

        config["retry_delay_minutes"] = json!(0);
        let invalid = server.put("/api/v1/config").json(&config).await;
        assert_eq!(invalid.status_code(), StatusCode::UNPROCESSABLE_ENTITY);

        let verdicts: Value = server.post("/api/v1/config/test").await.json();
        assert_eq!(verdicts.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_callback_is_not_found() {
        let server = server().await;
        let response = server
            .post("/api/v1/callbacks/sms")
            .json(&json!({ "tracking_id": "nope", "event": "delivered" }))
            .await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unsubscribe_link_records_opt_out() {
        let mut config = Config::default();
        config.server.unsubscribe_secret = Some("s3cret".to_string());
        let server = server_with(config.clone()).await;

        let links = clinicomm_core::UnsubscribeLinks::new("s3cret", &config.server.public_url);
        let token = links.token("ana@example.com").unwrap();

        server
            .get(&format!("/api/v1/unsubscribe/{}", token))
            .await
            .assert_status_ok();
        server
            .get("/api/v1/unsubscribe/forged.token")
            .await
            .assert_status(StatusCode::NOT_FOUND);

        let entries: Value = server.get("/api/v1/compliance/opt-outs").await.json();
        assert_eq!(entries[0]["address"], "ana@example.com");
        assert_eq!(entries[0]["source"], "unsubscribe_link");
    }

    #[tokio::test]
    async fn analytics_and_metrics() {
        let server = server().await;
        let start = (chrono::Utc::now() - chrono::Duration::days(1)).to_rfc3339();
        let end = future(24);

        let window = server
            .get("/api/v1/analytics")
            .add_query_param("start", &start)
            .add_query_param("end", &end)
            .await;
        window.assert_status_ok();
        assert_eq!(window.json::<Value>()["totals"]["delivery_rate"], Value::Null);

        let metrics = server.get("/metrics").await;
        metrics.assert_status_ok();
        assert!(metrics.text().contains("clinicomm_pending_messages"));
    }
}
