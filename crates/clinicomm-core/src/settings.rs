//! Delivery settings owner
//!
//! Holds the current [`DeliveryConfig`] and republishes it as an immutable
//! snapshot on every update. Readers never see a partially applied change.

use crate::channels::{AdapterRegistry, ChannelCheck};
use clinicomm_common::{Channel, DeliveryConfig, Error, Result};
use clinicomm_storage::repository::SettingsRepository;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::info;

/// Owner of the process-wide delivery settings
pub struct SettingsManager {
    repo: SettingsRepository,
    sender: watch::Sender<Arc<DeliveryConfig>>,
    /// Serializes store-then-publish so the stored row and the published
    /// snapshot always match
    writer: Mutex<()>,
}

impl SettingsManager {
    /// Load stored settings, seeding the store from `seed` when empty
    pub async fn load(repo: SettingsRepository, seed: DeliveryConfig) -> Result<Self> {
        let stored = repo.load().await.map_err(db_error)?;

        let config = match stored {
            Some(stored) => stored.settings.0,
            None => {
                seed.validate()?;
                repo.store(&seed).await.map_err(db_error)?;
                info!("Delivery settings seeded from configuration file");
                seed
            }
        };

        let (sender, _) = watch::channel(Arc::new(config));
        Ok(Self {
            repo,
            sender,
            writer: Mutex::new(()),
        })
    }

    /// Current settings
    pub fn snapshot(&self) -> Arc<DeliveryConfig> {
        self.sender.borrow().clone()
    }

    /// Receiver that observes every republished snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<DeliveryConfig>> {
        self.sender.subscribe()
    }

    /// Validate, persist, then publish new settings
    pub async fn update(&self, config: DeliveryConfig) -> Result<Arc<DeliveryConfig>> {
        config.validate()?;

        let _guard = self.writer.lock().await;
        self.repo.store(&config).await.map_err(db_error)?;

        let snapshot = Arc::new(config);
        self.sender.send_replace(Arc::clone(&snapshot));
        info!(
            retry_attempts = snapshot.retry_attempts,
            retry_delay_minutes = snapshot.retry_delay_minutes,
            "Delivery settings updated"
        );

        Ok(snapshot)
    }

    /// One verdict per channel. Disabled channels fail without a provider probe.
    pub async fn test_channels(&self, adapters: &AdapterRegistry) -> Vec<ChannelCheck> {
        let config = self.snapshot();
        let mut verdicts = Vec::with_capacity(Channel::ALL.len());

        for channel in Channel::ALL {
            let verdict = if !config.channel(channel).enabled {
                ChannelCheck::failed(channel, "Channel is disabled")
            } else {
                match adapters.get(channel) {
                    Some(adapter) => adapter.check().await,
                    None => ChannelCheck::failed(channel, "No adapter registered"),
                }
            };
            verdicts.push(verdict);
        }

        verdicts
    }
}

fn db_error(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}
