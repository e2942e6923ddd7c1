//! Prometheus metrics for the delivery engine

use clinicomm_common::{Channel, Error, Result};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Delivery counters and gauges
#[derive(Clone)]
pub struct DeliveryMetrics {
    registry: Registry,
    scheduled: IntCounterVec,
    outcomes: IntCounterVec,
    pending: IntGauge,
}

impl DeliveryMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("clinicomm".to_string()), None)
            .map_err(metrics_error)?;

        let scheduled = IntCounterVec::new(
            Opts::new("messages_scheduled_total", "Messages accepted for scheduling"),
            &["channel"],
        )
        .map_err(metrics_error)?;
        let outcomes = IntCounterVec::new(
            Opts::new("dispatch_outcomes_total", "Dispatch results by status"),
            &["channel", "status"],
        )
        .map_err(metrics_error)?;
        let pending = IntGauge::new("pending_messages", "Messages waiting in the scheduler")
            .map_err(metrics_error)?;

        registry
            .register(Box::new(scheduled.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(outcomes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(pending.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            scheduled,
            outcomes,
            pending,
        })
    }

    pub fn record_scheduled(&self, channel: Channel) {
        self.scheduled.with_label_values(&[channel.as_str()]).inc();
    }

    pub fn record_outcome(&self, channel: Channel, status: &str) {
        self.outcomes
            .with_label_values(&[channel.as_str(), status])
            .inc();
    }

    pub fn set_pending(&self, count: usize) {
        self.pending.set(count as i64);
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("Metrics error: {}", e))
}
