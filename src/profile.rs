//! Profile storage: the local persisted subscription snapshot per identity.
//!
//! Implement [`ProfileStore`] to persist profiles to your database. An
//! in-memory implementation is provided for testing. Subscription fields are
//! mutated only through the atomic operations on this trait, and only the
//! reconciliation engine and trial manager call them.

use crate::error::{PaygateError, Result};
use crate::time::unix_now;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Local access status for a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    /// No paid access.
    Free,
    /// Paid (or trial) access; `subscription_end` bounds it.
    Active,
    /// Cancelled by the user; access already lapsed.
    Cancelled,
    /// Subscription ended without renewal.
    Expired,
}

impl AccessStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for AccessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One user's identity plus cached subscription snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Local profile id.
    pub id: String,
    /// Auth-provider user id (unique).
    pub external_identity_id: String,
    pub email: String,
    /// Grants unconditional access; bypasses all reconciliation.
    pub is_admin: bool,
    pub status: AccessStatus,
    /// Current period start (Unix seconds).
    pub subscription_start: Option<u64>,
    /// Paid-through timestamp. None means no determinable end.
    pub subscription_end: Option<u64>,
    pub payment_customer_id: Option<String>,
    pub payment_subscription_id: Option<String>,
    pub payment_price_id: Option<String>,
    /// Actually-charged amount, minor currency units, post-discount.
    pub subscription_amount: Option<i64>,
    /// Pre-discount amount. `original_amount >= subscription_amount`.
    pub original_amount: Option<i64>,
    /// Active discount, 0-100.
    pub discount_percent: Option<u8>,
    pub discount_name: Option<String>,
    pub auto_renew: bool,
    pub cancelled_at: Option<u64>,
    /// When the last successful reconciliation wrote this snapshot.
    pub last_sync_at: Option<u64>,
    pub trial_used: bool,
    pub trial_end: Option<u64>,
    pub updated_at: u64,
}

impl Profile {
    /// Create a fresh free-tier profile for a newly authenticated identity.
    #[must_use]
    pub fn new(external_identity_id: impl Into<String>, email: impl Into<String>) -> Self {
        let now = unix_now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            external_identity_id: external_identity_id.into(),
            email: email.into(),
            is_admin: false,
            status: AccessStatus::Free,
            subscription_start: None,
            subscription_end: None,
            payment_customer_id: None,
            payment_subscription_id: None,
            payment_price_id: None,
            subscription_amount: None,
            original_amount: None,
            discount_percent: None,
            discount_name: None,
            auto_renew: false,
            cancelled_at: None,
            last_sync_at: None,
            trial_used: false,
            trial_end: None,
            updated_at: now,
        }
    }

    /// The pure access rule. Admins always pass; otherwise the status must be
    /// Active and the paid-through date (when known) must not have passed.
    #[must_use]
    pub fn has_access_at(&self, now: u64) -> bool {
        if self.is_admin {
            return true;
        }
        self.status == AccessStatus::Active
            && self.subscription_end.map_or(true, |end| now < end)
    }

    /// Whether the one-time trial can still be started.
    #[must_use]
    pub fn can_start_trial(&self) -> bool {
        !self.trial_used && self.status == AccessStatus::Free
    }

    /// The current snapshot fields as a value object, for change comparison.
    #[must_use]
    pub fn snapshot(&self) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            status: self.status,
            subscription_start: self.subscription_start,
            subscription_end: self.subscription_end,
            payment_subscription_id: self.payment_subscription_id.clone(),
            payment_price_id: self.payment_price_id.clone(),
            subscription_amount: self.subscription_amount,
            original_amount: self.original_amount,
            discount_percent: self.discount_percent,
            discount_name: self.discount_name.clone(),
            auto_renew: self.auto_renew,
            cancelled_at: self.cancelled_at,
        }
    }

    /// Overwrite snapshot fields in place. Used by store implementations
    /// inside their atomic update; returns whether anything changed.
    pub fn apply_snapshot(&mut self, snapshot: &SubscriptionSnapshot, synced_at: u64) -> bool {
        let changed = self.snapshot() != *snapshot;
        self.status = snapshot.status;
        self.subscription_start = snapshot.subscription_start;
        self.subscription_end = snapshot.subscription_end;
        self.payment_subscription_id = snapshot.payment_subscription_id.clone();
        self.payment_price_id = snapshot.payment_price_id.clone();
        self.subscription_amount = snapshot.subscription_amount;
        self.original_amount = snapshot.original_amount;
        self.discount_percent = snapshot.discount_percent;
        self.discount_name = snapshot.discount_name.clone();
        self.auto_renew = snapshot.auto_renew;
        self.cancelled_at = snapshot.cancelled_at;
        self.last_sync_at = Some(synced_at);
        if changed {
            self.updated_at = synced_at;
        }
        changed
    }
}

/// The canonical subscription state derived by one reconciliation pass.
///
/// Produced only by the reconciliation engine and written to the store in a
/// single atomic update; route handlers never assemble these ad hoc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub status: AccessStatus,
    pub subscription_start: Option<u64>,
    pub subscription_end: Option<u64>,
    pub payment_subscription_id: Option<String>,
    pub payment_price_id: Option<String>,
    pub subscription_amount: Option<i64>,
    pub original_amount: Option<i64>,
    pub discount_percent: Option<u8>,
    pub discount_name: Option<String>,
    pub auto_renew: bool,
    pub cancelled_at: Option<u64>,
}

impl SubscriptionSnapshot {
    /// A free-tier snapshot with all subscription fields cleared.
    #[must_use]
    pub fn free() -> Self {
        Self {
            status: AccessStatus::Free,
            subscription_start: None,
            subscription_end: None,
            payment_subscription_id: None,
            payment_price_id: None,
            subscription_amount: None,
            original_amount: None,
            discount_percent: None,
            discount_name: None,
            auto_renew: false,
            cancelled_at: None,
        }
    }

    /// Check the write-time invariants. Active requires a future paid-through
    /// date; charged amount never exceeds the undiscounted amount.
    pub fn validate(&self, now: u64) -> Result<()> {
        if self.status == AccessStatus::Active {
            match self.subscription_end {
                Some(end) if end > now => {}
                _ => {
                    return Err(PaygateError::internal(
                        "refusing to write Active snapshot without a future subscription_end",
                    ));
                }
            }
        }
        if let (Some(original), Some(charged)) = (self.original_amount, self.subscription_amount) {
            if charged > original {
                return Err(PaygateError::internal(
                    "refusing to write snapshot with charged amount above original amount",
                ));
            }
        }
        Ok(())
    }
}

/// Trait for persisting profiles and webhook dedup state.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, profile_id: &str) -> Result<Option<Profile>>;

    async fn find_by_identity(&self, external_identity_id: &str) -> Result<Option<Profile>>;

    async fn find_by_customer(&self, payment_customer_id: &str) -> Result<Option<Profile>>;

    /// All profiles with this email. Email resolution is a fallback only and
    /// may match zero or many rows.
    async fn find_by_email(&self, email: &str) -> Result<Vec<Profile>>;

    async fn insert(&self, profile: &Profile) -> Result<()>;

    /// Link a profile to its payment-provider customer.
    async fn set_payment_customer(&self, profile_id: &str, customer_id: &str) -> Result<()>;

    /// Write a full snapshot in one atomic update and stamp `last_sync_at`.
    ///
    /// Returns `true` only if some field's new value differs from the stored
    /// value. Implementations must never apply a snapshot partially.
    async fn apply_snapshot(
        &self,
        profile_id: &str,
        snapshot: &SubscriptionSnapshot,
        synced_at: u64,
    ) -> Result<bool>;

    /// Atomically check-and-set the one-time trial.
    ///
    /// Returns `false` without modifying anything if the trial was already
    /// used or the profile is not on the free tier. Production
    /// implementations must make this a single conditional update
    /// (`UPDATE ... WHERE trial_used = false AND status = 'free'`), not a
    /// read-then-write.
    async fn begin_trial(&self, profile_id: &str, trial_end: u64, now: u64) -> Result<bool>;

    /// Flip auto-renew, stamping or clearing `cancelled_at` alongside it.
    async fn set_auto_renew(
        &self,
        profile_id: &str,
        auto_renew: bool,
        cancelled_at: Option<u64>,
    ) -> Result<()>;

    // Webhook idempotency tracking.

    async fn is_event_processed(&self, event_id: &str) -> Result<bool>;

    /// Record a processed event id along with its customer and provider-side
    /// creation timestamp, for dedup and stale-event detection.
    async fn mark_event_processed(
        &self,
        event_id: &str,
        customer_id: &str,
        created: u64,
    ) -> Result<()>;

    /// The newest provider `created` timestamp processed for this customer.
    async fn latest_event_for_customer(&self, customer_id: &str) -> Result<Option<u64>>;

    /// Drop processed-event records older than the retention window.
    async fn cleanup_old_events(&self, _older_than_secs: u64) -> Result<usize> {
        Ok(0)
    }
}

/// In-memory profile store for testing and development.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, RwLock};

    /// In-memory [`ProfileStore`]. Wraps data in `Arc` for cheap cloning.
    #[derive(Default, Clone)]
    pub struct InMemoryProfileStore {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        profiles: RwLock<HashMap<String, Profile>>,
        events: RwLock<HashMap<String, EventRecord>>,
        latest_by_customer: RwLock<HashMap<String, u64>>,
    }

    struct EventRecord {
        #[allow(dead_code)]
        customer_id: String,
        processed_at: u64,
    }

    impl InMemoryProfileStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Count stored profiles (for tests).
        #[must_use]
        pub fn profile_count(&self) -> usize {
            self.inner.profiles.read().unwrap().len()
        }
    }

    #[async_trait]
    impl ProfileStore for InMemoryProfileStore {
        async fn get(&self, profile_id: &str) -> Result<Option<Profile>> {
            Ok(self.inner.profiles.read().unwrap().get(profile_id).cloned())
        }

        async fn find_by_identity(&self, external_identity_id: &str) -> Result<Option<Profile>> {
            let profiles = self.inner.profiles.read().unwrap();
            Ok(profiles
                .values()
                .find(|p| p.external_identity_id == external_identity_id)
                .cloned())
        }

        async fn find_by_customer(&self, payment_customer_id: &str) -> Result<Option<Profile>> {
            let profiles = self.inner.profiles.read().unwrap();
            Ok(profiles
                .values()
                .find(|p| p.payment_customer_id.as_deref() == Some(payment_customer_id))
                .cloned())
        }

        async fn find_by_email(&self, email: &str) -> Result<Vec<Profile>> {
            let profiles = self.inner.profiles.read().unwrap();
            Ok(profiles
                .values()
                .filter(|p| p.email == email)
                .cloned()
                .collect())
        }

        async fn insert(&self, profile: &Profile) -> Result<()> {
            self.inner
                .profiles
                .write()
                .unwrap()
                .insert(profile.id.clone(), profile.clone());
            Ok(())
        }

        async fn set_payment_customer(&self, profile_id: &str, customer_id: &str) -> Result<()> {
            let mut profiles = self.inner.profiles.write().unwrap();
            let profile = profiles
                .get_mut(profile_id)
                .ok_or_else(|| PaygateError::not_found(format!("profile {profile_id}")))?;
            profile.payment_customer_id = Some(customer_id.to_string());
            Ok(())
        }

        async fn apply_snapshot(
            &self,
            profile_id: &str,
            snapshot: &SubscriptionSnapshot,
            synced_at: u64,
        ) -> Result<bool> {
            snapshot.validate(synced_at)?;
            let mut profiles = self.inner.profiles.write().unwrap();
            let profile = profiles
                .get_mut(profile_id)
                .ok_or_else(|| PaygateError::not_found(format!("profile {profile_id}")))?;
            Ok(profile.apply_snapshot(snapshot, synced_at))
        }

        async fn begin_trial(&self, profile_id: &str, trial_end: u64, now: u64) -> Result<bool> {
            let mut profiles = self.inner.profiles.write().unwrap();
            let profile = profiles
                .get_mut(profile_id)
                .ok_or_else(|| PaygateError::not_found(format!("profile {profile_id}")))?;

            if profile.trial_used || profile.status != AccessStatus::Free {
                return Ok(false);
            }

            profile.trial_used = true;
            profile.trial_end = Some(trial_end);
            profile.status = AccessStatus::Active;
            profile.subscription_start = Some(now);
            profile.subscription_end = Some(trial_end);
            profile.updated_at = now;
            Ok(true)
        }

        async fn set_auto_renew(
            &self,
            profile_id: &str,
            auto_renew: bool,
            cancelled_at: Option<u64>,
        ) -> Result<()> {
            let mut profiles = self.inner.profiles.write().unwrap();
            let profile = profiles
                .get_mut(profile_id)
                .ok_or_else(|| PaygateError::not_found(format!("profile {profile_id}")))?;
            profile.auto_renew = auto_renew;
            profile.cancelled_at = cancelled_at;
            profile.updated_at = unix_now();
            Ok(())
        }

        async fn is_event_processed(&self, event_id: &str) -> Result<bool> {
            Ok(self.inner.events.read().unwrap().contains_key(event_id))
        }

        async fn mark_event_processed(
            &self,
            event_id: &str,
            customer_id: &str,
            created: u64,
        ) -> Result<()> {
            self.inner.events.write().unwrap().insert(
                event_id.to_string(),
                EventRecord {
                    customer_id: customer_id.to_string(),
                    processed_at: unix_now(),
                },
            );
            let mut latest = self.inner.latest_by_customer.write().unwrap();
            let entry = latest.entry(customer_id.to_string()).or_insert(0);
            if created > *entry {
                *entry = created;
            }
            Ok(())
        }

        async fn latest_event_for_customer(&self, customer_id: &str) -> Result<Option<u64>> {
            Ok(self
                .inner
                .latest_by_customer
                .read()
                .unwrap()
                .get(customer_id)
                .copied())
        }

        async fn cleanup_old_events(&self, older_than_secs: u64) -> Result<usize> {
            let cutoff = unix_now().saturating_sub(older_than_secs);
            let mut events = self.inner.events.write().unwrap();
            let before = events.len();
            events.retain(|_, record| record.processed_at >= cutoff);
            Ok(before - events.len())
        }
    }
}
