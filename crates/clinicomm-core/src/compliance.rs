//! Compliance Gate - Opt-out checks and unsubscribe links
//!
//! The gate is consulted when a message is scheduled and again right
//! before every provider call. Addresses are normalized exactly as the
//! channel adapters normalize them, so an opt-out recorded as
//! "+55 (11) 99999-0000" also matches "11 99999-0000".

use crate::channels::normalize_any;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use clinicomm_common::{Channel, Error, Result};
use clinicomm_storage::models::ComplianceEntry;
use clinicomm_storage::repository::ComplianceRepository;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, info};

type HmacSha256 = Hmac<Sha256>;

/// Gate verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComplianceDecision {
    Allow,
    Suppress(ComplianceEntry),
}

/// Opt-out gate
#[derive(Clone)]
pub struct ComplianceGate {
    repo: Arc<dyn ComplianceRepository>,
}

impl ComplianceGate {
    pub fn new(repo: Arc<dyn ComplianceRepository>) -> Self {
        Self { repo }
    }

    /// Check a normalized address
    pub async fn check(&self, channel: Channel, address: &str) -> Result<ComplianceDecision> {
        match self.repo.get(address).await? {
            Some(entry) => {
                debug!(%channel, address, "Recipient opted out");
                Ok(ComplianceDecision::Suppress(entry))
            }
            None => Ok(ComplianceDecision::Allow),
        }
    }

    /// Record an opt-out for a raw address
    pub async fn opt_out(
        &self,
        raw_address: &str,
        reason: Option<&str>,
        source: &str,
        default_country_code: &str,
    ) -> Result<ComplianceEntry> {
        let address = normalize_any(raw_address, default_country_code)?;
        let entry = self.repo.opt_out(&address, reason, source).await?;
        info!(address = %entry.address, source, "Opt-out recorded");
        Ok(entry)
    }

    /// Remove an opt-out (re-subscribe)
    pub async fn opt_in(&self, raw_address: &str, default_country_code: &str) -> Result<()> {
        let address = normalize_any(raw_address, default_country_code)?;
        if !self.repo.opt_in(&address).await? {
            return Err(Error::NotFound(format!("No opt-out for {}", address)));
        }
        info!(%address, "Opt-out removed");
        Ok(())
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<ComplianceEntry>> {
        self.repo.list(limit, offset).await
    }
}

/// Signed unsubscribe tokens embedded in outbound emails
#[derive(Clone)]
pub struct UnsubscribeLinks {
    secret: Vec<u8>,
    base_url: String,
}

impl UnsubscribeLinks {
    pub fn new(secret: impl Into<Vec<u8>>, public_url: &str) -> Self {
        Self {
            secret: secret.into(),
            base_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| Error::Internal(format!("Invalid unsubscribe secret: {}", e)))
    }

    /// `<address>.<signature>`, both base64url
    pub fn token(&self, address: &str) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(address.as_bytes());
        let signature = mac.finalize().into_bytes();

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(address.as_bytes()),
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// Public unsubscribe URL for an address
    pub fn url(&self, address: &str) -> Result<String> {
        Ok(format!("{}/api/v1/unsubscribe/{}", self.base_url, self.token(address)?))
    }

    /// Address carried by a token, if the signature matches
    pub fn verify(&self, token: &str) -> Option<String> {
        let (encoded, signature) = token.split_once('.')?;
        let address = String::from_utf8(URL_SAFE_NO_PAD.decode(encoded).ok()?).ok()?;
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;

        let mut mac = self.mac().ok()?;
        mac.update(address.as_bytes());
        mac.verify_slice(&signature).ok()?;

        Some(address)
    }
}
