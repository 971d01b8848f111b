//! Payment provider gateway trait and wire types.
//!
//! The gateway is stateless request/response: it never caches, never writes
//! to the profile store, and reports provider state exactly as received. All
//! interpretation lives in the reconciliation engine.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Subscription status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
}

impl ProviderStatus {
    /// Statuses that currently grant access. `past_due` keeps access because
    /// a failed invoice alone never revokes it.
    #[must_use]
    pub fn grants_access(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing | Self::PastDue)
    }
}

/// Discount attached to a provider subscription. Exactly one of `percent` or
/// `amount_off` is populated by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDiscount {
    pub percent: Option<u8>,
    /// Absolute reduction, minor currency units.
    pub amount_off: Option<i64>,
    pub name: Option<String>,
}

/// One subscription as the provider reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer_id: String,
    pub status: ProviderStatus,
    /// Provider-side creation timestamp, Unix seconds.
    pub created: u64,
    pub current_period_start: Option<u64>,
    pub current_period_end: Option<u64>,
    /// Some API versions surface the period end on the line item instead of
    /// the subscription record.
    pub item_period_end: Option<u64>,
    pub price_id: Option<String>,
    /// Undiscounted unit amount, minor currency units.
    pub unit_amount: Option<i64>,
    pub discount: Option<ProviderDiscount>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<u64>,
}

impl ProviderSubscription {
    /// The date access is paid through. Both provider fields must be
    /// consulted; either alone can be absent.
    #[must_use]
    pub fn paid_through(&self) -> Option<u64> {
        self.current_period_end.or(self.item_period_end)
    }

    /// The amount actually charged after the discount, never the list price.
    #[must_use]
    pub fn charged_amount(&self) -> Option<i64> {
        let unit = self.unit_amount?;
        match &self.discount {
            Some(d) => {
                if let Some(percent) = d.percent {
                    let pct = i64::from(percent.min(100));
                    Some(unit * (100 - pct) / 100)
                } else if let Some(off) = d.amount_off {
                    Some((unit - off).max(0))
                } else {
                    Some(unit)
                }
            }
            None => Some(unit),
        }
    }
}

/// A completed checkout session, used as a last-resort access source when no
/// subscription record exists yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRecord {
    pub id: String,
    pub customer_id: String,
    /// When the session completed, Unix seconds.
    pub completed_at: u64,
    pub amount_total: Option<i64>,
}

/// Discount to apply upstream when a retention offer is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscountRequest {
    pub percent: Option<u8>,
    pub amount_off: Option<i64>,
    pub name: String,
}

/// Typed interface to the external payments API.
///
/// Every method is a single remote call (plus bounded retries inside the
/// implementation). Implementations must include canceled subscriptions in
/// listings; the engine needs them for grace-period handling.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// All of a customer's subscriptions, any status, newest first.
    async fn list_subscriptions(&self, customer_id: &str) -> Result<Vec<ProviderSubscription>>;

    /// Flip cancel-at-period-end. `true` schedules cancellation at the period
    /// boundary; `false` re-enables auto-renew before the boundary passes.
    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> Result<ProviderSubscription>;

    /// Apply a discount to a live subscription.
    async fn apply_discount(
        &self,
        subscription_id: &str,
        discount: DiscountRequest,
    ) -> Result<ProviderSubscription>;

    /// The customer's most recently completed checkout session, if any.
    async fn latest_completed_checkout(&self, customer_id: &str) -> Result<Option<CheckoutRecord>>;
}

/// Exponential backoff delay with jitter for attempt `attempt` (0-based).
#[must_use]
#[cfg_attr(not(feature = "live-stripe"), allow(dead_code))]
pub(crate) fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> std::time::Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(max_ms);
    let jitter = fastrand::u64(0..=capped / 4);
    std::time::Duration::from_millis(capped + jitter)
}
