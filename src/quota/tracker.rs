//! Shared per-credential quota bookkeeping
//!
//! The tracker is a cheap-to-clone handle over state behind a mutex. The lock
//! is held only for bookkeeping, never across an await, so a slow fetch on one
//! worker cannot stall quota decisions on another.

use crate::config::{resolve_token, Config};
use crate::quota::Credential;
use crate::state::{CredentialState, QuotaHint};
use crate::{ConfigError, HarvestError, Result};
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

struct TrackedCredential {
    credential: Credential,
    state: CredentialState,
    revoked: bool,
}

/// Selects credentials by remaining budget and records what they spend
#[derive(Clone)]
pub struct QuotaTracker {
    inner: Arc<Mutex<BTreeMap<String, TrackedCredential>>>,
    safety_margin: u32,
}

impl QuotaTracker {
    /// Creates a tracker over the given credentials
    ///
    /// # Arguments
    ///
    /// * `credentials` - Credentials paired with their starting budget state
    /// * `safety_margin` - Credentials at or below this budget are withheld
    pub fn new(credentials: Vec<(Credential, CredentialState)>, safety_margin: u32) -> Self {
        let inner = credentials
            .into_iter()
            .map(|(credential, state)| {
                (
                    credential.id.clone(),
                    TrackedCredential {
                        credential,
                        state,
                        revoked: false,
                    },
                )
            })
            .collect();

        Self {
            inner: Arc::new(Mutex::new(inner)),
            safety_margin,
        }
    }

    /// Builds a tracker from the `[[credentials]]` and `[quota]` sections
    pub fn from_config(config: &Config) -> std::result::Result<Self, ConfigError> {
        let mut credentials = Vec::with_capacity(config.credentials.len());
        for entry in &config.credentials {
            let token = resolve_token(entry)?;
            let interval = chrono::Duration::seconds(entry.reset_interval_secs as i64);
            credentials.push((
                Credential::new(entry.id.clone(), token),
                CredentialState::new(entry.max_budget, interval),
            ));
        }
        Ok(Self::new(credentials, config.quota.safety_margin))
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, TrackedCredential>> {
        // Budget counters stay meaningful even if a holder panicked
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn safety_margin(&self) -> u32 {
        self.safety_margin
    }

    /// Returns the best credential without waiting
    ///
    /// Picks the highest remaining budget above the safety margin. Ties go to
    /// the credential whose last reset lies furthest back (never reset first),
    /// then to the lowest id. Revoked credentials are never handed out.
    ///
    /// # Returns
    ///
    /// * `Ok(Credential)` - A credential with budget to spend
    /// * `Err(HarvestError::QuotaExhausted)` - Nothing is above the margin
    /// * `Err(HarvestError::CredentialsRevoked)` - Every credential was revoked
    pub fn try_acquire(&self, now: DateTime<Utc>) -> Result<Credential> {
        let mut credentials = self.lock();
        if credentials.values().all(|t| t.revoked) {
            return Err(HarvestError::CredentialsRevoked);
        }

        for (id, tracked) in credentials.iter_mut() {
            if tracked.state.refresh(now) {
                tracing::info!("Quota for credential {} reset to {}", id, tracked.state.max_budget);
            }
        }

        let best = credentials
            .values()
            .filter(|t| !t.revoked && t.state.is_available(self.safety_margin))
            .min_by_key(|t| {
                (
                    Reverse(t.state.remaining),
                    t.state.last_reset_at,
                    t.credential.id.as_str(),
                )
            });

        if let Some(tracked) = best {
            tracing::trace!(
                "Acquired credential {} ({} remaining)",
                tracked.credential.id,
                tracked.state.remaining
            );
            return Ok(tracked.credential.clone());
        }

        let next_reset = credentials
            .values()
            .filter(|t| !t.revoked)
            .filter_map(|t| t.state.reset_at)
            .min();
        Err(HarvestError::QuotaExhausted { next_reset })
    }

    /// Returns the best credential, waiting for a reset if one lands in time
    ///
    /// # Arguments
    ///
    /// * `timeout` - Longest acceptable wait for a credential to reset
    ///
    /// # Returns
    ///
    /// * `Ok(Credential)` - A credential with budget to spend
    /// * `Err(HarvestError::QuotaExhausted)` - No reset falls within `timeout`
    pub async fn acquire(&self, timeout: Duration) -> Result<Credential> {
        let window = chrono::Duration::from_std(timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let deadline = Utc::now() + window;

        loop {
            let now = Utc::now();
            match self.try_acquire(now) {
                Ok(credential) => return Ok(credential),
                Err(HarvestError::QuotaExhausted {
                    next_reset: Some(reset),
                }) if reset <= deadline => {
                    let wait = (reset - now).to_std().unwrap_or_default();
                    tracing::debug!("All credentials below margin, waiting {:?} for reset", wait);
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Records the spend of a completed request attempt
    ///
    /// If the API reported an authoritative remaining budget it replaces the
    /// local estimate; otherwise the estimate is decremented by `cost`.
    pub fn report(&self, credential_id: &str, cost: u32, hint: Option<QuotaHint>) {
        self.report_at(credential_id, cost, hint, Utc::now());
    }

    /// `report` with an explicit clock reading
    pub fn report_at(
        &self,
        credential_id: &str,
        cost: u32,
        hint: Option<QuotaHint>,
        now: DateTime<Utc>,
    ) {
        let mut credentials = self.lock();
        let Some(tracked) = credentials.get_mut(credential_id) else {
            tracing::warn!("Spend reported for unknown credential {}", credential_id);
            return;
        };

        tracked.state.refresh(now);
        match hint {
            Some(hint) => tracked.state.reconcile(hint, now),
            None => tracked.state.apply_spend(cost, now),
        }

        if !tracked.state.is_available(self.safety_margin) {
            tracing::info!(
                "Credential {} is at {} remaining, withheld until {:?}",
                credential_id,
                tracked.state.remaining,
                tracked.state.reset_at
            );
        }
    }

    /// Stops handing out a credential the API refused to authenticate
    pub fn revoke(&self, credential_id: &str) {
        let mut credentials = self.lock();
        if let Some(tracked) = credentials.get_mut(credential_id) {
            if !tracked.revoked {
                tracing::warn!("Credential {} was refused by the API, withdrawing it", credential_id);
            }
            tracked.revoked = true;
        }
    }

    pub fn is_revoked(&self, credential_id: &str) -> bool {
        self.lock().get(credential_id).is_some_and(|t| t.revoked)
    }

    /// Returns the soonest reset time across all credentials
    pub fn next_reset(&self) -> Option<DateTime<Utc>> {
        self.lock().values().filter_map(|t| t.state.reset_at).min()
    }

    /// Returns the remaining budget estimate for a credential
    pub fn remaining(&self, credential_id: &str) -> Option<u32> {
        self.lock().get(credential_id).map(|t| t.state.remaining)
    }

    /// Copies out every credential's state, ordered by id
    pub fn snapshot(&self) -> Vec<(String, CredentialState)> {
        self.lock()
            .iter()
            .map(|(id, t)| (id.clone(), t.state.clone()))
            .collect()
    }

    /// Sum of remaining budget across all credentials
    pub fn total_remaining(&self) -> u64 {
        self.lock().values().map(|t| t.state.remaining as u64).sum()
    }
}
