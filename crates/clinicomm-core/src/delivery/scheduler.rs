//! Scheduler - Pending set and dispatch worker
//!
//! The scheduler is the only component that waits on time. Pending messages
//! live in an in-memory set ordered by due time, backed by the durable
//! store; the set lock is held only to insert, remove or dequeue. Each due
//! message is dispatched in its own task, bounded by the channel's
//! semaphore. A dispatch first claims the message in the store, so a
//! concurrent cancel and a due-time fire can never both win.

use super::lifecycle::{self, DeliveryEvent, Directive, RetryPolicy};
use crate::channels::{normalize_address, AdapterRegistry, OutboundMessage, SendOutcome};
use crate::compliance::{ComplianceDecision, ComplianceGate, UnsubscribeLinks};
use crate::metrics::DeliveryMetrics;
use crate::webhooks::WebhookNotifier;
use chrono::{DateTime, Utc};
use clinicomm_common::config::SchedulerConfig;
use clinicomm_common::types::MessageId;
use clinicomm_common::{Channel, DeliveryConfig, Error, Result};
use clinicomm_storage::models::{DeliveryStatus, Message};
use clinicomm_storage::repository::MessageRepository;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of a schedule request
#[derive(Debug, Clone)]
pub enum ScheduleOutcome {
    /// Stored and waiting for its due time
    Scheduled(Message),
    /// A live message already exists for the same trigger combination
    Duplicate(Message),
    /// Stored as a terminal failure (opted out, invalid address, channel off)
    Failed(Message),
}

impl ScheduleOutcome {
    pub fn message(&self) -> &Message {
        match self {
            ScheduleOutcome::Scheduled(m)
            | ScheduleOutcome::Duplicate(m)
            | ScheduleOutcome::Failed(m) => m,
        }
    }
}

/// Ordered pending set with an id index
#[derive(Debug, Default)]
struct PendingSet {
    order: BTreeSet<(DateTime<Utc>, MessageId)>,
    index: HashMap<MessageId, (DateTime<Utc>, Channel)>,
}

impl PendingSet {
    /// Insert or move an entry; returns true when it became the earliest
    fn insert(&mut self, id: MessageId, channel: Channel, due: DateTime<Utc>) -> bool {
        if let Some((old_due, _)) = self.index.insert(id, (due, channel)) {
            self.order.remove(&(old_due, id));
        }
        self.order.insert((due, id));
        self.order.first() == Some(&(due, id))
    }

    fn remove(&mut self, id: MessageId) -> bool {
        match self.index.remove(&id) {
            Some((due, _)) => self.order.remove(&(due, id)),
            None => false,
        }
    }

    fn pop_due(&mut self, now: DateTime<Utc>, limit: usize) -> Vec<(MessageId, Channel)> {
        let mut due = Vec::new();
        while due.len() < limit {
            match self.order.first().copied() {
                Some((at, id)) if at <= now => {
                    self.order.remove(&(at, id));
                    if let Some((_, channel)) = self.index.remove(&id) {
                        due.push((id, channel));
                    }
                }
                _ => break,
            }
        }
        due
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        self.order.first().map(|(at, _)| *at)
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Message scheduler and dispatcher
pub struct Scheduler {
    messages: MessageRepository,
    adapters: Arc<AdapterRegistry>,
    compliance: ComplianceGate,
    settings: watch::Receiver<Arc<DeliveryConfig>>,
    webhooks: Option<Arc<WebhookNotifier>>,
    unsubscribe: Option<UnsubscribeLinks>,
    metrics: Option<DeliveryMetrics>,
    pending: Mutex<PendingSet>,
    /// Claimed by this process but the outcome could not be saved
    stranded: Mutex<HashSet<MessageId>>,
    wake: Notify,
    poll_interval: Duration,
    batch_size: usize,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        messages: MessageRepository,
        adapters: Arc<AdapterRegistry>,
        compliance: ComplianceGate,
        settings: watch::Receiver<Arc<DeliveryConfig>>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            messages,
            adapters,
            compliance,
            settings,
            webhooks: None,
            unsubscribe: None,
            metrics: None,
            pending: Mutex::new(PendingSet::default()),
            stranded: Mutex::new(HashSet::new()),
            wake: Notify::new(),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            batch_size: config.batch_size.max(1),
        }
    }

    /// Publish lifecycle events to webhooks
    pub fn with_webhooks(mut self, webhooks: Arc<WebhookNotifier>) -> Self {
        self.webhooks = Some(webhooks);
        self
    }

    /// Append signed unsubscribe links to emails when enabled in settings
    pub fn with_unsubscribe_links(mut self, links: UnsubscribeLinks) -> Self {
        self.unsubscribe = Some(links);
        self
    }

    /// Record scheduling and dispatch metrics
    pub fn with_metrics(mut self, metrics: DeliveryMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn snapshot(&self) -> Arc<DeliveryConfig> {
        self.settings.borrow().clone()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingSet> {
        // A poisoned set is still structurally valid
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stranded(&self) -> std::sync::MutexGuard<'_, HashSet<MessageId>> {
        self.stranded.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of messages waiting in memory
    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    /// Earliest due time in the pending set
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.lock_pending().next_due()
    }

    /// Accept a draft message.
    ///
    /// The message is written to the store before it enters the pending
    /// set; if the store is unreachable nothing is applied and the caller
    /// gets `SchedulerUnavailable`.
    pub async fn schedule(&self, mut message: Message) -> Result<ScheduleOutcome> {
        if message.status != DeliveryStatus::Draft {
            return Err(Error::Validation(format!(
                "Only draft messages can be scheduled, got {}",
                message.status
            )));
        }

        let config = self.snapshot();
        let policy = RetryPolicy::from_config(&config);
        let event = self.admission(&message, &config).await?;
        let transition = lifecycle::apply(&mut message, event, &policy, Utc::now())?;

        let inserted = self.messages.insert(&message).await.map_err(unavailable)?;
        if !inserted {
            return self.existing_for_trigger(&message).await;
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_scheduled(message.channel);
        }

        if transition.status == DeliveryStatus::Scheduled {
            self.enqueue(message.id, message.channel, message.scheduled_for);
            info!(
                message_id = %message.id,
                channel = %message.channel,
                scheduled_for = %message.scheduled_for,
                "Message scheduled"
            );
            Ok(ScheduleOutcome::Scheduled(message))
        } else {
            warn!(
                message_id = %message.id,
                reason = ?message.failure_reason,
                "Message failed at scheduling"
            );
            self.publish(transition.notify, &message);
            Ok(ScheduleOutcome::Failed(message))
        }
    }

    /// Checks done before a message is accepted
    async fn admission(&self, message: &Message, config: &DeliveryConfig) -> Result<DeliveryEvent> {
        if !config.channel(message.channel).enabled {
            return Ok(DeliveryEvent::ChannelDisabled);
        }

        let address = match normalize_address(
            message.channel,
            &message.recipient_address,
            &config.default_country_code,
        ) {
            Ok(address) => address,
            Err(e) => {
                return Ok(DeliveryEvent::InvalidAddress {
                    reason: e.to_string(),
                })
            }
        };

        match self.compliance.check(message.channel, &address).await {
            Ok(ComplianceDecision::Suppress(_)) => Ok(DeliveryEvent::Suppressed),
            Ok(ComplianceDecision::Allow) => Ok(DeliveryEvent::Schedule),
            Err(e) => Err(Error::SchedulerUnavailable(e.to_string())),
        }
    }

    async fn existing_for_trigger(&self, message: &Message) -> Result<ScheduleOutcome> {
        let (Some(trigger_type), Some(entity_id), Some(hours_before)) = (
            message.trigger_type,
            message.trigger_entity_id.as_deref(),
            message.trigger_hours_before,
        ) else {
            return Err(Error::Internal(format!(
                "Message {} was not stored",
                message.id
            )));
        };

        let existing = self
            .messages
            .find_by_trigger(trigger_type, entity_id, hours_before, message.channel)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| {
                Error::SchedulerUnavailable(format!(
                    "Trigger {} for {} conflicted but no live message was found",
                    entity_id, message.channel
                ))
            })?;

        debug!(
            message_id = %existing.id,
            entity_id,
            hours_before,
            channel = %message.channel,
            "Duplicate trigger ignored"
        );
        Ok(ScheduleOutcome::Duplicate(existing))
    }

    /// Cancel a message that has not been claimed for dispatch
    pub async fn cancel(&self, id: MessageId) -> Result<Message> {
        match self.messages.cancel(id).await.map_err(unavailable)? {
            Some(message) => {
                self.lock_pending().remove(id);
                info!(message_id = %id, "Message cancelled");
                Ok(message)
            }
            None => match self.messages.get(id).await.map_err(unavailable)? {
                Some(message) => Err(Error::InvalidTransition(format!(
                    "Message {} cannot be cancelled in status {}",
                    id, message.status
                ))),
                None => Err(Error::NotFound(format!("Message {} not found", id))),
            },
        }
    }

    /// Put a message back in the pending set with a new due time
    pub fn requeue(&self, id: MessageId, channel: Channel, at: DateTime<Utc>) {
        self.enqueue(id, channel, at);
        debug!(message_id = %id, due = %at, "Message requeued");
    }

    fn enqueue(&self, id: MessageId, channel: Channel, due: DateTime<Utc>) {
        let (earliest, len) = {
            let mut pending = self.lock_pending();
            let earliest = pending.insert(id, channel, due);
            (earliest, pending.len())
        };

        if let Some(metrics) = &self.metrics {
            metrics.set_pending(len);
        }
        if earliest {
            self.wake.notify_one();
        }
    }

    /// Rebuild the pending set from the store.
    ///
    /// Messages left in flight by a previous process go back to
    /// `scheduled` and fire again (at-least-once).
    pub async fn recover(&self) -> Result<usize> {
        let reset = self.messages.reset_in_flight().await.map_err(unavailable)?;
        if reset > 0 {
            warn!(count = reset, "Re-queued messages left in flight by a previous run");
        }

        let pending = self.messages.list_pending().await.map_err(unavailable)?;
        let count = pending.len();
        for message in pending {
            self.enqueue(message.id, message.channel, message.due_at());
        }

        info!(count, "Scheduler recovered pending messages");
        Ok(count)
    }

    /// Dequeue every message due at `now` and dispatch each in its own task
    pub fn dispatch_due(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let due = {
            let mut pending = self.lock_pending();
            pending.pop_due(now, self.batch_size)
        };

        if due.is_empty() {
            return Vec::new();
        }
        debug!(count = due.len(), "Dispatching due messages");
        if let Some(metrics) = &self.metrics {
            metrics.set_pending(self.pending_len());
        }

        due.into_iter()
            .map(|(id, channel)| {
                let scheduler = Arc::clone(self);
                tokio::spawn(async move {
                    match scheduler.dispatch(id, channel).await {
                        Ok(_) => {}
                        Err(Error::SchedulerUnavailable(reason)) => {
                            let at = Utc::now() + scheduler.retry_backoff();
                            warn!(
                                message_id = %id,
                                error = %reason,
                                retry_at = %at,
                                "Store unavailable during dispatch"
                            );
                            scheduler.requeue(id, channel, at);
                        }
                        Err(e) => error!(message_id = %id, error = %e, "Dispatch failed"),
                    }
                })
            })
            .collect()
    }

    fn retry_backoff(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.poll_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(5))
    }

    /// Dispatch one message: claim, check, send, record.
    ///
    /// Returns `None` when the claim was lost (cancelled or already taken).
    /// A `SchedulerUnavailable` error leaves the message for another try;
    /// one stranded in `sending` is released back to `scheduled` first.
    pub async fn dispatch(&self, id: MessageId, channel: Channel) -> Result<Option<Message>> {
        let _permit = match self.adapters.permits(channel) {
            Some(semaphore) => Some(
                semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Internal(e.to_string()))?,
            ),
            None => None,
        };

        if self.lock_stranded().contains(&id) {
            self.messages.release(id).await.map_err(unavailable)?;
            self.lock_stranded().remove(&id);
            info!(message_id = %id, "Released message stranded by a store outage");
        }

        let Some(mut message) = self.messages.claim(id).await.map_err(unavailable)? else {
            debug!(message_id = %id, "Message no longer claimable");
            return Ok(None);
        };

        let config = self.snapshot();
        let policy = RetryPolicy::from_config(&config);
        let event = self.attempt(&message, &config).await;
        let transition = lifecycle::apply(&mut message, event, &policy, Utc::now())?;

        let saved = match self
            .messages
            .save_if_status(&message, DeliveryStatus::Sending)
            .await
        {
            Ok(saved) => saved,
            Err(e) => {
                self.lock_stranded().insert(id);
                return Err(unavailable(e));
            }
        };
        if !saved {
            warn!(message_id = %id, "Message changed during dispatch, result dropped");
            return Ok(None);
        }

        if let Some(Directive::Requeue { at }) = transition.directive {
            self.requeue(message.id, message.channel, at);
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_outcome(message.channel, message.status.as_str());
        }
        info!(
            message_id = %message.id,
            channel = %message.channel,
            status = %message.status,
            retry_count = message.retry_count,
            "Dispatch finished"
        );
        self.publish(transition.notify, &message);

        Ok(Some(message))
    }

    /// Run every pre-send check and, if they pass, the provider call
    async fn attempt(&self, message: &Message, config: &DeliveryConfig) -> DeliveryEvent {
        if !config.channel(message.channel).enabled {
            return DeliveryEvent::ChannelDisabled;
        }

        let address = match normalize_address(
            message.channel,
            &message.recipient_address,
            &config.default_country_code,
        ) {
            Ok(address) => address,
            Err(e) => {
                return DeliveryEvent::InvalidAddress {
                    reason: e.to_string(),
                }
            }
        };

        match self.compliance.check(message.channel, &address).await {
            Ok(ComplianceDecision::Suppress(_)) => return DeliveryEvent::Suppressed,
            Ok(ComplianceDecision::Allow) => {}
            Err(e) => {
                return DeliveryEvent::TransientError {
                    reason: format!("Opt-out list unavailable: {}", e),
                }
            }
        }

        let Some(adapter) = self.adapters.get(message.channel) else {
            return DeliveryEvent::Rejected {
                reason: format!("No adapter registered for {}", message.channel),
            };
        };

        let unsubscribe_url = match (&self.unsubscribe, message.channel) {
            (Some(links), Channel::Email) if config.unsubscribe_link => links.url(&address).ok(),
            _ => None,
        };

        let outbound = OutboundMessage {
            id: message.id,
            channel: message.channel,
            recipient_name: message.recipient_name.clone(),
            address,
            subject: message.subject.clone(),
            content: message.content.clone(),
            attachments: message.attachments.0.clone(),
            sender: config.sender.clone(),
            reply_to: config.reply_to.clone(),
            unsubscribe_url,
        };

        match adapter.send(&outbound).await {
            SendOutcome::Accepted {
                provider_message_id,
                response,
            } => DeliveryEvent::Accepted {
                provider_message_id,
                response,
            },
            SendOutcome::Rejected { reason } => DeliveryEvent::Rejected { reason },
            SendOutcome::TransientError { reason } => DeliveryEvent::TransientError { reason },
        }
    }

    fn publish(&self, event: Option<lifecycle::WebhookEvent>, message: &Message) {
        if let (Some(event), Some(webhooks)) = (event, &self.webhooks) {
            webhooks.notify(event, message);
        }
    }

    /// Dispatch loop. Sleeps until the earliest due time, the poll
    /// interval, or a wake-up from a newly scheduled earlier message.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            batch_size = self.batch_size,
            "Scheduler started"
        );

        loop {
            let now = Utc::now();
            self.dispatch_due(now);

            let sleep_for = match self.next_due() {
                Some(due) if due <= now => Duration::ZERO,
                Some(due) => (due - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(self.poll_interval),
                None => self.poll_interval,
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.wake.notified() => {}
            }
        }

        info!("Scheduler stopped");
    }
}

fn unavailable(e: sqlx::Error) -> Error {
    Error::SchedulerUnavailable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::testing::{accepted, transient, ScriptedAdapter};
    use crate::channels::{ChannelAdapter, ChannelCheck};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use clinicomm_storage::models::{FailureReason, TriggerType};
    use clinicomm_storage::repository::{ComplianceRepository, DbComplianceRepository};
    use clinicomm_storage::DatabasePool;
    use pretty_assertions::assert_eq;

    struct Harness {
        scheduler: Arc<Scheduler>,
        messages: MessageRepository,
        compliance: DbComplianceRepository,
        db: DatabasePool,
        _settings: watch::Sender<Arc<DeliveryConfig>>,
    }

    async fn harness(adapter: Arc<ScriptedAdapter>, config: DeliveryConfig) -> Harness {
        let db = DatabasePool::in_memory().await.unwrap();
        let messages = MessageRepository::new(db.pool().clone());
        let compliance = DbComplianceRepository::new(db.clone());

        let mut adapters = AdapterRegistry::new();
        adapters.register(adapter, 4);

        let (sender, receiver) = watch::channel(Arc::new(config));
        let scheduler = Scheduler::new(
            messages.clone(),
            Arc::new(adapters),
            ComplianceGate::new(Arc::new(compliance.clone())),
            receiver,
            &SchedulerConfig::default(),
        );

        Harness {
            scheduler: Arc::new(scheduler),
            messages,
            compliance,
            db,
            _settings: sender,
        }
    }

    fn email(due: DateTime<Utc>) -> Message {
        Message::draft(
            Channel::Email,
            "Carlos",
            "Carlos@Example.com",
            Some("Lembrete".to_string()),
            "Olá Carlos, sua consulta é em 10/03/2025",
            due,
        )
    }

    async fn drain(handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_no_delivery_before_due_time() {
        let adapter = ScriptedAdapter::new(Channel::Email, vec![accepted("a1")]);
        let h = harness(adapter.clone(), DeliveryConfig::default()).await;
        let due = Utc::now() + ChronoDuration::hours(1);

        let outcome = h.scheduler.schedule(email(due)).await.unwrap();
        let id = outcome.message().id;
        assert!(matches!(outcome, ScheduleOutcome::Scheduled(_)));

        drain(h.scheduler.dispatch_due(due - ChronoDuration::seconds(1))).await;
        assert_eq!(adapter.calls(), 0);

        drain(h.scheduler.dispatch_due(due)).await;
        assert_eq!(adapter.calls(), 1);

        let stored = h.messages.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Sent);
        assert_eq!(stored.tracking_id.as_deref(), Some("a1"));
        assert!(stored.sent_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_before_due_prevents_send() {
        let adapter = ScriptedAdapter::new(Channel::Email, vec![]);
        let h = harness(adapter.clone(), DeliveryConfig::default()).await;
        let due = Utc::now() + ChronoDuration::minutes(30);

        let id = h.scheduler.schedule(email(due)).await.unwrap().message().id;
        let cancelled = h.scheduler.cancel(id).await.unwrap();
        assert_eq!(cancelled.status, DeliveryStatus::Cancelled);
        assert_eq!(h.scheduler.pending_len(), 0);

        drain(h.scheduler.dispatch_due(due + ChronoDuration::minutes(1))).await;
        assert_eq!(adapter.calls(), 0);

        let err = h.scheduler.cancel(id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_cancel_wins_over_stale_pending_entry() {
        let adapter = ScriptedAdapter::new(Channel::Email, vec![]);
        let h = harness(adapter.clone(), DeliveryConfig::default()).await;
        let due = Utc::now() + ChronoDuration::minutes(1);

        let id = h.scheduler.schedule(email(due)).await.unwrap().message().id;
        // Cancel straight in the store, leaving the pending entry behind
        h.messages.cancel(id).await.unwrap().unwrap();

        assert!(h.scheduler.dispatch(id, Channel::Email).await.unwrap().is_none());
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_errors_retry_then_fail_terminal() {
        let adapter = ScriptedAdapter::new(
            Channel::Email,
            vec![transient(), transient(), transient()],
        );
        let mut config = DeliveryConfig::default();
        config.retry_attempts = 3;
        config.retry_delay_minutes = 10;
        let h = harness(adapter.clone(), config).await;

        let id = h.scheduler.schedule(email(Utc::now())).await.unwrap().message().id;

        let mut now = Utc::now();
        for attempt in 1..=2 {
            drain(h.scheduler.dispatch_due(now)).await;
            let stored = h.messages.get(id).await.unwrap().unwrap();
            assert_eq!(stored.status, DeliveryStatus::FailedRetryable);
            assert_eq!(stored.retry_count, attempt);
            let retry_at = stored.next_retry_at.unwrap();
            assert!(retry_at >= now + ChronoDuration::minutes(10));
            assert_eq!(h.scheduler.next_due(), Some(retry_at));

            // Not due yet
            drain(h.scheduler.dispatch_due(retry_at - ChronoDuration::seconds(1))).await;
            assert_eq!(adapter.calls(), attempt as usize);
            now = retry_at;
        }

        drain(h.scheduler.dispatch_due(now)).await;
        let stored = h.messages.get(id).await.unwrap().unwrap();
        assert_eq!(adapter.calls(), 3);
        assert_eq!(stored.status, DeliveryStatus::FailedTerminal);
        assert_eq!(stored.failure_reason, Some(FailureReason::RetriesExhausted));
        assert_eq!(stored.next_retry_at, None);
        assert_eq!(stored.retry_count, 3);
        assert_eq!(h.scheduler.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_opted_out_recipient_never_reaches_provider() {
        let adapter = ScriptedAdapter::new(Channel::Email, vec![]);
        let h = harness(adapter.clone(), DeliveryConfig::default()).await;
        h.compliance
            .opt_out("carlos@example.com", None, "api")
            .await
            .unwrap();

        let outcome = h.scheduler.schedule(email(Utc::now())).await.unwrap();
        let message = outcome.message().clone();
        assert!(matches!(outcome, ScheduleOutcome::Failed(_)));
        assert_eq!(message.status, DeliveryStatus::FailedTerminal);
        assert_eq!(message.failure_reason, Some(FailureReason::OptedOut));

        drain(h.scheduler.dispatch_due(Utc::now() + ChronoDuration::hours(1))).await;
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn test_opt_out_after_scheduling_is_checked_at_send() {
        let adapter = ScriptedAdapter::new(Channel::Email, vec![]);
        let h = harness(adapter.clone(), DeliveryConfig::default()).await;

        let id = h.scheduler.schedule(email(Utc::now())).await.unwrap().message().id;
        h.compliance
            .opt_out("carlos@example.com", Some("patient request"), "api")
            .await
            .unwrap();

        drain(h.scheduler.dispatch_due(Utc::now())).await;
        let stored = h.messages.get(id).await.unwrap().unwrap();
        assert_eq!(adapter.calls(), 0);
        assert_eq!(stored.status, DeliveryStatus::FailedTerminal);
        assert_eq!(stored.failure_reason, Some(FailureReason::OptedOut));
    }

    #[tokio::test]
    async fn test_invalid_address_fails_without_provider_call() {
        let adapter = ScriptedAdapter::new(Channel::Email, vec![]);
        let h = harness(adapter.clone(), DeliveryConfig::default()).await;

        let mut message = email(Utc::now());
        message.recipient_address = "carlos-at-example".to_string();
        let outcome = h.scheduler.schedule(message).await.unwrap();

        assert_eq!(
            outcome.message().failure_reason,
            Some(FailureReason::InvalidAddress)
        );
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_trigger_returns_existing() {
        let adapter = ScriptedAdapter::new(Channel::Email, vec![]);
        let h = harness(adapter, DeliveryConfig::default()).await;
        let due = Utc::now() + ChronoDuration::hours(24);

        let triggered = || {
            let mut m = email(due);
            m.trigger_type = Some(TriggerType::AppointmentReminder);
            m.trigger_entity_id = Some("42".to_string());
            m.trigger_hours_before = Some(24);
            m
        };

        let first = h.scheduler.schedule(triggered()).await.unwrap();
        let second = h.scheduler.schedule(triggered()).await.unwrap();

        assert!(matches!(first, ScheduleOutcome::Scheduled(_)));
        match second {
            ScheduleOutcome::Duplicate(existing) => assert_eq!(existing.id, first.message().id),
            other => panic!("expected duplicate, got {:?}", other),
        }
        assert_eq!(h.scheduler.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_recover_requeues_in_flight_messages() {
        let adapter = ScriptedAdapter::new(Channel::Email, vec![accepted("r1")]);
        let h = harness(adapter.clone(), DeliveryConfig::default()).await;

        let id = h.scheduler.schedule(email(Utc::now())).await.unwrap().message().id;
        // Simulate a crash after the claim
        h.messages.claim(id).await.unwrap().unwrap();

        let restarted = Arc::new(Scheduler::new(
            h.messages.clone(),
            Arc::clone(&h.scheduler.adapters),
            h.scheduler.compliance.clone(),
            h._settings.subscribe(),
            &SchedulerConfig::default(),
        ));

        assert_eq!(restarted.recover().await.unwrap(), 1);
        drain(restarted.dispatch_due(Utc::now())).await;

        assert_eq!(adapter.calls(), 1);
        let stored = h.messages.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn test_disabled_channel_fails_terminal() {
        let adapter = ScriptedAdapter::new(Channel::Email, vec![]);
        let mut config = DeliveryConfig::default();
        config.email.enabled = false;
        let h = harness(adapter.clone(), config).await;

        let outcome = h.scheduler.schedule(email(Utc::now())).await.unwrap();
        assert_eq!(
            outcome.message().failure_reason,
            Some(FailureReason::ChannelDisabled)
        );
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn test_run_loop_dispatches_and_stops() {
        let adapter = ScriptedAdapter::new(Channel::Email, vec![accepted("loop")]);
        let h = harness(adapter.clone(), DeliveryConfig::default()).await;
        let shutdown = CancellationToken::new();

        let runner = tokio::spawn(Arc::clone(&h.scheduler).run(shutdown.clone()));
        let id = h.scheduler.schedule(email(Utc::now())).await.unwrap().message().id;

        let mut sent = false;
        for _ in 0..50 {
            let stored = h.messages.get(id).await.unwrap().unwrap();
            if stored.status == DeliveryStatus::Sent {
                sent = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(sent);

        shutdown.cancel();
        runner.await.unwrap();
    }

    async fn take_messages_table_down(pool: &sqlx::SqlitePool) {
        sqlx::query("ALTER TABLE messages RENAME TO messages_down")
            .execute(pool)
            .await
            .unwrap();
    }

    async fn bring_messages_table_back(pool: &sqlx::SqlitePool) {
        sqlx::query("ALTER TABLE messages_down RENAME TO messages")
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_store_outage_at_claim_keeps_message_pending() {
        let adapter = ScriptedAdapter::new(Channel::Email, vec![accepted("after-outage")]);
        let h = harness(adapter.clone(), DeliveryConfig::default()).await;
        let id = h.scheduler.schedule(email(Utc::now())).await.unwrap().message().id;
        let now = Utc::now();

        take_messages_table_down(h.db.pool()).await;
        drain(h.scheduler.dispatch_due(now)).await;
        assert_eq!(adapter.calls(), 0);
        assert_eq!(h.scheduler.pending_len(), 1);
        assert!(h.scheduler.next_due().unwrap() > now);
        bring_messages_table_back(h.db.pool()).await;

        drain(h.scheduler.dispatch_due(now + ChronoDuration::days(1))).await;
        assert_eq!(adapter.calls(), 1);
        let stored = h.messages.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Sent);
        assert_eq!(h.scheduler.pending_len(), 0);
    }

    /// Accepts the send, then takes the messages table away before the
    /// result is saved
    struct FailingStoreAdapter {
        pool: sqlx::SqlitePool,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ChannelAdapter for FailingStoreAdapter {
        fn channel(&self) -> Channel {
            Channel::Email
        }

        async fn send(&self, _message: &OutboundMessage) -> SendOutcome {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call == 0 {
                take_messages_table_down(&self.pool).await;
            }
            accepted(&format!("attempt-{}", call + 1))
        }

        async fn check(&self) -> ChannelCheck {
            ChannelCheck::ok(Channel::Email, "test")
        }
    }

    #[tokio::test]
    async fn test_store_outage_at_save_releases_and_resends() {
        let placeholder = ScriptedAdapter::new(Channel::Email, vec![]);
        let h = harness(placeholder, DeliveryConfig::default()).await;
        let adapter = Arc::new(FailingStoreAdapter {
            pool: h.db.pool().clone(),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let mut adapters = AdapterRegistry::new();
        adapters.register(adapter.clone(), 4);
        let scheduler = Arc::new(Scheduler::new(
            h.messages.clone(),
            Arc::new(adapters),
            ComplianceGate::new(Arc::new(h.compliance.clone())),
            h._settings.subscribe(),
            &SchedulerConfig::default(),
        ));

        let id = scheduler.schedule(email(Utc::now())).await.unwrap().message().id;
        let now = Utc::now();

        drain(scheduler.dispatch_due(now)).await;
        assert_eq!(scheduler.pending_len(), 1);
        bring_messages_table_back(h.db.pool()).await;
        let stuck = h.messages.get(id).await.unwrap().unwrap();
        assert_eq!(stuck.status, DeliveryStatus::Sending);

        drain(scheduler.dispatch_due(now + ChronoDuration::days(1))).await;
        assert_eq!(adapter.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        let stored = h.messages.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Sent);
        assert_eq!(stored.tracking_id.as_deref(), Some("attempt-2"));
    }

    #[test]
    fn test_pending_set_orders_by_due_time() {
        let mut set = PendingSet::default();
        let now = Utc::now();
        let (a, b, c) = (uuid::Uuid::now_v7(), uuid::Uuid::now_v7(), uuid::Uuid::now_v7());

        assert!(set.insert(a, Channel::Email, now + ChronoDuration::minutes(5)));
        assert!(set.insert(b, Channel::Sms, now));
        assert!(!set.insert(c, Channel::Sms, now + ChronoDuration::minutes(10)));

        // Moving an entry replaces its old position
        set.insert(c, Channel::Sms, now - ChronoDuration::minutes(1));
        assert_eq!(set.len(), 3);

        let due = set.pop_due(now, 10);
        assert_eq!(due, vec![(c, Channel::Sms), (b, Channel::Sms)]);
        assert_eq!(set.next_due(), Some(now + ChronoDuration::minutes(5)));
        assert!(set.remove(a));
        assert!(!set.remove(a));
    }
}
