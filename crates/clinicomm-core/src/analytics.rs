//! Analytics Aggregator
//!
//! Derived delivery statistics for a period, always recomputed from message
//! history. Each request reads one snapshot of the period and runs a pure
//! computation over it.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use clinicomm_common::{Channel, Error, Result};
use clinicomm_storage::models::{DeliveryStatus, Message};
use clinicomm_storage::repository::MessageRepository;
use serde::Serialize;
use std::collections::BTreeMap;

/// Longest period accepted for a daily series
const MAX_SERIES_DAYS: i64 = 366;

/// Counts and rates for one channel (or all channels)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelStats {
    pub total: u64,
    /// Accepted by the provider, whatever happened afterwards
    pub sent: u64,
    pub delivered: u64,
    /// Email opens
    pub opened: u64,
    /// Messaging-app read receipts
    pub read: u64,
    pub failed: u64,
    pub bounced: u64,
    pub pending: u64,
    pub cancelled: u64,
    pub clicks: u64,
    pub unsubscribes: u64,
    /// Sent messages that still await a delivery outcome
    pub awaiting_outcome: u64,
    pub delivery_rate: Option<f64>,
    pub open_rate: Option<f64>,
    pub bounce_rate: Option<f64>,
}

impl ChannelStats {
    fn add(&mut self, message: &Message) {
        use DeliveryStatus::*;

        self.total += 1;
        self.clicks += message.clicks.max(0) as u64;
        self.unsubscribes += message.unsubscribes.max(0) as u64;

        match message.status {
            Draft | Scheduled | Sending | FailedRetryable => self.pending += 1,
            Cancelled => self.cancelled += 1,
            FailedTerminal => self.failed += 1,
            Sent | Delivered | Read | Bounced => {}
        }
        if !message.status.was_sent() {
            return;
        }

        self.sent += 1;
        match message.status {
            Sent => self.awaiting_outcome += 1,
            Delivered | Read => self.delivered += 1,
            Bounced => self.bounced += 1,
            _ => {}
        }

        // Engagement only counts on messages counted as delivered
        if !matches!(message.status, Delivered | Read) {
            return;
        }
        match message.channel {
            Channel::Email if message.opens > 0 || message.status == Read => self.opened += 1,
            Channel::MessagingApp if message.read_at.is_some() => self.read += 1,
            _ => {}
        }
    }

    fn merge(&mut self, other: &ChannelStats) {
        self.total += other.total;
        self.sent += other.sent;
        self.delivered += other.delivered;
        self.opened += other.opened;
        self.read += other.read;
        self.failed += other.failed;
        self.bounced += other.bounced;
        self.pending += other.pending;
        self.cancelled += other.cancelled;
        self.clicks += other.clicks;
        self.unsubscribes += other.unsubscribes;
        self.awaiting_outcome += other.awaiting_outcome;
    }

    /// Fill in rates. `engaged_delivered` is the delivered count of the
    /// channels that report opens or reads.
    fn finish(&mut self, engaged_delivered: Option<u64>) {
        let resolved = self.sent - self.awaiting_outcome;
        self.delivery_rate = ratio(self.delivered, resolved);
        self.bounce_rate = ratio(self.bounced, resolved);
        self.open_rate = engaged_delivered.and_then(|d| ratio(self.opened + self.read, d));
    }
}

fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

/// Statistics for a period
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub channels: BTreeMap<Channel, ChannelStats>,
    pub totals: ChannelStats,
}

/// One day of a series
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyPoint {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub stats: ChannelStats,
}

/// Aggregate `messages` scheduled within `[start, end)`
pub fn compute(messages: &[Message], start: DateTime<Utc>, end: DateTime<Utc>) -> AnalyticsWindow {
    let mut channels: BTreeMap<Channel, ChannelStats> = Channel::ALL
        .iter()
        .map(|&channel| (channel, ChannelStats::default()))
        .collect();

    for message in in_period(messages, start, end) {
        if let Some(stats) = channels.get_mut(&message.channel) {
            stats.add(message);
        }
    }

    let mut totals = ChannelStats::default();
    let mut engaged_delivered = 0;
    for (channel, stats) in channels.iter_mut() {
        totals.merge(stats);
        let engaged = match channel {
            Channel::Email | Channel::MessagingApp => {
                engaged_delivered += stats.delivered;
                Some(stats.delivered)
            }
            Channel::Sms => None,
        };
        stats.finish(engaged);
    }
    totals.finish(Some(engaged_delivered));

    AnalyticsWindow {
        start,
        end,
        channels,
        totals,
    }
}

/// Daily totals (UTC days) for `[start, end)`
pub fn compute_series(
    messages: &[Message],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<DailyPoint> {
    let mut days: BTreeMap<NaiveDate, Vec<&Message>> = BTreeMap::new();
    let mut day = start.date_naive();
    let last = (end - Duration::nanoseconds(1)).date_naive();
    while day <= last {
        days.insert(day, Vec::new());
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }

    for message in in_period(messages, start, end) {
        if let Some(bucket) = days.get_mut(&message.scheduled_for.date_naive()) {
            bucket.push(message);
        }
    }

    days.into_iter()
        .map(|(date, bucket)| {
            let owned: Vec<Message> = bucket.into_iter().cloned().collect();
            DailyPoint {
                date,
                stats: compute(&owned, start, end).totals,
            }
        })
        .collect()
}

fn in_period(
    messages: &[Message],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> impl Iterator<Item = &Message> {
    messages
        .iter()
        .filter(move |m| m.scheduled_for >= start && m.scheduled_for < end)
}

fn check_period(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if end <= start {
        return Err(Error::Validation("end must be after start".to_string()));
    }
    Ok(())
}

/// Reads message history and aggregates it
#[derive(Clone)]
pub struct AnalyticsAggregator {
    messages: MessageRepository,
}

impl AnalyticsAggregator {
    pub fn new(messages: MessageRepository) -> Self {
        Self { messages }
    }

    async fn snapshot(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Message>> {
        self.messages
            .list_scheduled_between(start, end)
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<AnalyticsWindow> {
        check_period(start, end)?;
        let messages = self.snapshot(start, end).await?;
        Ok(compute(&messages, start, end))
    }

    pub async fn series(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<DailyPoint>> {
        check_period(start, end)?;
        if end - start > Duration::days(MAX_SERIES_DAYS) {
            return Err(Error::Validation(format!(
                "Series period cannot exceed {} days",
                MAX_SERIES_DAYS
            )));
        }
        let messages = self.snapshot(start, end).await?;
        Ok(compute_series(&messages, start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use clinicomm_storage::DatabasePool;
    use pretty_assertions::assert_eq;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()
    }

    fn message(channel: Channel, status: DeliveryStatus, when: DateTime<Utc>) -> Message {
        let address = match channel {
            Channel::Email => "ana@example.com",
            _ => "5511999990000",
        };
        let mut message = Message::draft(channel, "Ana", address, None, "Olá", when);
        message.status = status;
        message
    }

    #[test]
    fn test_rates_are_undefined_without_sends() {
        let messages = vec![
            message(Channel::Sms, DeliveryStatus::Scheduled, at(10, 9)),
            message(Channel::Sms, DeliveryStatus::Cancelled, at(10, 10)),
        ];

        let window = compute(&messages, at(10, 0), at(11, 0));
        let sms = &window.channels[&Channel::Sms];

        assert_eq!(sms.sent, 0);
        assert_eq!(sms.pending, 1);
        assert_eq!(sms.cancelled, 1);
        assert_eq!(sms.delivery_rate, None);
        assert_eq!(sms.bounce_rate, None);
        assert_eq!(sms.open_rate, None);
        assert_eq!(window.totals.delivery_rate, None);
    }

    #[test]
    fn test_awaiting_outcome_excluded_from_denominators() {
        let mut opened = message(Channel::Email, DeliveryStatus::Delivered, at(10, 9));
        opened.opens = 2;
        let messages = vec![
            opened,
            message(Channel::Email, DeliveryStatus::Read, at(10, 9)),
            message(Channel::Email, DeliveryStatus::Bounced, at(10, 9)),
            message(Channel::Email, DeliveryStatus::Sent, at(10, 9)),
            message(Channel::Email, DeliveryStatus::FailedTerminal, at(10, 9)),
        ];

        let window = compute(&messages, at(10, 0), at(11, 0));
        let email = &window.channels[&Channel::Email];

        assert_eq!(email.sent, 4);
        assert_eq!(email.delivered, 2);
        assert_eq!(email.opened, 2);
        assert_eq!(email.failed, 1);
        assert_eq!(email.delivery_rate, Some(2.0 / 3.0));
        assert_eq!(email.bounce_rate, Some(1.0 / 3.0));
        assert_eq!(email.open_rate, Some(1.0));
    }

    #[test]
    fn test_rates_never_exceed_one() {
        let mut read = message(Channel::MessagingApp, DeliveryStatus::Delivered, at(10, 9));
        read.read_at = Some(at(10, 10));
        let mut read_while_sent = message(Channel::MessagingApp, DeliveryStatus::Sent, at(10, 9));
        read_while_sent.read_at = Some(at(10, 10));
        let mut opened_after_bounce = message(Channel::Email, DeliveryStatus::Bounced, at(10, 9));
        opened_after_bounce.opens = 1;
        let messages = vec![
            read,
            read_while_sent,
            message(Channel::MessagingApp, DeliveryStatus::Delivered, at(10, 9)),
            message(Channel::Sms, DeliveryStatus::Delivered, at(10, 9)),
            message(Channel::Email, DeliveryStatus::Read, at(10, 9)),
            opened_after_bounce,
        ];

        let window = compute(&messages, at(10, 0), at(11, 0));
        for stats in window.channels.values().chain(std::iter::once(&window.totals)) {
            for rate in [stats.delivery_rate, stats.open_rate, stats.bounce_rate]
                .into_iter()
                .flatten()
            {
                assert!((0.0..=1.0).contains(&rate));
            }
        }
        let app = &window.channels[&Channel::MessagingApp];
        assert_eq!(app.read, 1);
        assert_eq!(app.delivered, 2);
        assert_eq!(app.open_rate, Some(0.5));
        let email = &window.channels[&Channel::Email];
        assert_eq!(email.opened, 1);
        assert_eq!(email.open_rate, Some(1.0));
        assert_eq!(window.channels[&Channel::Sms].open_rate, None);
        // Email read + one app read over three engaged deliveries
        assert_eq!(window.totals.open_rate, Some(2.0 / 3.0));
    }

    #[test]
    fn test_series_has_one_point_per_day() {
        let messages = vec![
            message(Channel::Email, DeliveryStatus::Delivered, at(10, 9)),
            message(Channel::Sms, DeliveryStatus::FailedTerminal, at(12, 23)),
            message(Channel::Sms, DeliveryStatus::Delivered, at(13, 0)),
        ];

        let series = compute_series(&messages, at(10, 0), at(13, 0));
        let dates: Vec<_> = series.iter().map(|p| p.date).collect();
        assert_eq!(
            dates,
            vec![
                at(10, 0).date_naive(),
                at(11, 0).date_naive(),
                at(12, 0).date_naive()
            ]
        );
        assert_eq!(series[0].stats.delivered, 1);
        assert_eq!(series[1].stats.total, 0);
        assert_eq!(series[2].stats.failed, 1);
    }

    #[tokio::test]
    async fn test_aggregator_reads_period() {
        let db = DatabasePool::in_memory().await.unwrap();
        let repo = MessageRepository::new(db.pool().clone());
        repo.insert(&message(Channel::Email, DeliveryStatus::Delivered, at(10, 9)))
            .await
            .unwrap();
        repo.insert(&message(Channel::Email, DeliveryStatus::Delivered, at(20, 9)))
            .await
            .unwrap();

        let aggregator = AnalyticsAggregator::new(repo);
        let window = aggregator.window(at(10, 0), at(11, 0)).await.unwrap();
        assert_eq!(window.totals.total, 1);
        assert_eq!(window.totals.delivery_rate, Some(1.0));

        assert!(matches!(
            aggregator.window(at(11, 0), at(10, 0)).await,
            Err(Error::Validation(_))
        ));
    }
}
