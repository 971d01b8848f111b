//! Time-boxed retention discount offers.
//!
//! When a user rejects a counter-offer during cancellation, the offer is
//! stored with a bounded acceptance window so they can come back and take it.
//! Acceptance returns structured data only; the caller applies the coupon
//! upstream and the reconciliation engine observes the result via webhook.

use crate::config::OfferConfig;
use crate::error::{PaygateError, Result};
use crate::time::{hours, unix_now};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A stored per-user retention offer. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscountOffer {
    pub id: String,
    pub profile_id: String,
    /// The subscription the offer negotiates on, when one exists.
    pub payment_subscription_id: Option<String>,
    /// Undiscounted price the negotiation started from, minor units.
    pub original_price: i64,
    /// What the user proposed to pay.
    pub user_input: i64,
    /// What was offered back.
    pub offer_price: i64,
    /// Discount relative to the original price, 0-100.
    pub discount_percent: u8,
    pub created_at: u64,
    /// Last instant the offer can be accepted.
    pub expires_at: u64,
    pub accepted_at: Option<u64>,
}

impl DiscountOffer {
    #[must_use]
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    #[must_use]
    pub fn is_acceptable_at(&self, now: u64) -> bool {
        self.accepted_at.is_none() && !self.is_expired_at(now)
    }
}

/// Why an offer operation failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OfferError {
    #[error("offer not found")]
    NotFound,
    #[error("offer already accepted")]
    AlreadyAccepted,
    #[error("offer expired")]
    Expired,
    #[error("invalid offer price: {0}")]
    InvalidPrice(String),
}

impl From<OfferError> for PaygateError {
    fn from(err: OfferError) -> Self {
        match err {
            OfferError::NotFound => PaygateError::not_found("offer"),
            OfferError::AlreadyAccepted => PaygateError::conflict("offer already accepted"),
            OfferError::Expired => PaygateError::conflict("offer expired"),
            OfferError::InvalidPrice(msg) => PaygateError::validation(msg),
        }
    }
}

/// Persistence for offers.
#[async_trait]
pub trait OfferStore: Send + Sync {
    async fn insert(&self, offer: &DiscountOffer) -> Result<()>;

    async fn get(&self, offer_id: &str) -> Result<Option<DiscountOffer>>;

    /// All offers for a profile, any state.
    async fn list_for_profile(&self, profile_id: &str) -> Result<Vec<DiscountOffer>>;

    /// Atomically mark accepted. Must re-check acceptance and expiry inside
    /// the same atomic step so concurrent accepts cannot both win.
    async fn mark_accepted(
        &self,
        offer_id: &str,
        now: u64,
    ) -> std::result::Result<DiscountOffer, OfferError>;
}

/// A rejected negotiation to record.
#[derive(Debug, Clone)]
pub struct RejectedNegotiation {
    pub profile_id: String,
    pub payment_subscription_id: Option<String>,
    pub original_price: i64,
    pub user_input: i64,
    pub offer_price: i64,
}

/// Offer lifecycle manager.
pub struct OfferManager<S> {
    store: S,
    config: OfferConfig,
}

impl<S: OfferStore> OfferManager<S> {
    pub fn new(store: S, config: OfferConfig) -> Self {
        Self { store, config }
    }

    /// Record a rejected negotiation as an open offer.
    ///
    /// Enforces `0 < offer_price < user_input < original_price`: the offered
    /// price undercuts what the user proposed, which undercuts the list
    /// price, or the negotiation is meaningless.
    pub async fn record_rejected(&self, negotiation: RejectedNegotiation) -> Result<DiscountOffer> {
        let RejectedNegotiation {
            profile_id,
            payment_subscription_id,
            original_price,
            user_input,
            offer_price,
        } = negotiation;

        if offer_price <= 0 {
            return Err(OfferError::InvalidPrice("offer price must be positive".to_string()).into());
        }
        if offer_price >= user_input {
            return Err(OfferError::InvalidPrice(
                "offer price must be below the user's proposed price".to_string(),
            )
            .into());
        }
        if user_input >= original_price {
            return Err(OfferError::InvalidPrice(
                "proposed price must be below the original price".to_string(),
            )
            .into());
        }

        let now = unix_now();
        let discount_percent =
            (((original_price - offer_price) * 100) / original_price).clamp(0, 100) as u8;
        let offer = DiscountOffer {
            id: uuid::Uuid::new_v4().to_string(),
            profile_id: profile_id.clone(),
            payment_subscription_id,
            original_price,
            user_input,
            offer_price,
            discount_percent,
            created_at: now,
            expires_at: now + hours(u64::from(self.config.window_hours)),
            accepted_at: None,
        };
        self.store.insert(&offer).await?;

        tracing::info!(
            target: "paygate::offer",
            profile_id = %profile_id,
            offer_id = %offer.id,
            offer_price,
            user_input,
            original_price,
            discount_percent,
            "Retention offer stored"
        );
        Ok(offer)
    }

    /// Look up an offer without consuming it.
    pub async fn get(&self, offer_id: &str) -> Result<Option<DiscountOffer>> {
        self.store.get(offer_id).await
    }

    /// The newest offer still open for acceptance, optionally narrowed to
    /// one subscription.
    pub async fn active_offer(
        &self,
        profile_id: &str,
        subscription_id: Option<&str>,
    ) -> Result<Option<DiscountOffer>> {
        let now = unix_now();
        let mut offers = self.store.list_for_profile(profile_id).await?;
        offers.retain(|o| o.is_acceptable_at(now));
        if let Some(subscription_id) = subscription_id {
            offers.retain(|o| o.payment_subscription_id.as_deref() == Some(subscription_id));
        }
        offers.sort_by_key(|o| o.created_at);
        Ok(offers.pop())
    }

    /// Accept an offer. Expiry and prior acceptance are re-checked at write
    /// time; a stale read never lets a dead offer through.
    pub async fn accept(&self, offer_id: &str) -> Result<DiscountOffer> {
        let now = unix_now();
        let offer = self.store.mark_accepted(offer_id, now).await?;
        tracing::info!(
            target: "paygate::offer",
            offer_id = %offer.id,
            profile_id = %offer.profile_id,
            offer_price = offer.offer_price,
            "Retention offer accepted"
        );
        Ok(offer)
    }
}

/// In-memory offer store for testing and development.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, RwLock};

    #[derive(Default, Clone)]
    pub struct InMemoryOfferStore {
        offers: Arc<RwLock<HashMap<String, DiscountOffer>>>,
    }

    impl InMemoryOfferStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl OfferStore for InMemoryOfferStore {
        async fn insert(&self, offer: &DiscountOffer) -> Result<()> {
            self.offers
                .write()
                .unwrap()
                .insert(offer.id.clone(), offer.clone());
            Ok(())
        }

        async fn get(&self, offer_id: &str) -> Result<Option<DiscountOffer>> {
            Ok(self.offers.read().unwrap().get(offer_id).cloned())
        }

        async fn list_for_profile(&self, profile_id: &str) -> Result<Vec<DiscountOffer>> {
            Ok(self
                .offers
                .read()
                .unwrap()
                .values()
                .filter(|o| o.profile_id == profile_id)
                .cloned()
                .collect())
        }

        async fn mark_accepted(
            &self,
            offer_id: &str,
            now: u64,
        ) -> std::result::Result<DiscountOffer, OfferError> {
            let mut offers = self.offers.write().unwrap();
            let offer = offers.get_mut(offer_id).ok_or(OfferError::NotFound)?;
            if offer.accepted_at.is_some() {
                return Err(OfferError::AlreadyAccepted);
            }
            if offer.is_expired_at(now) {
                return Err(OfferError::Expired);
            }
            offer.accepted_at = Some(now);
            Ok(offer.clone())
        }
    }
}
