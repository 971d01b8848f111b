//! Reconciliation engine.
//!
//! Pulls the customer's subscription truth from the payment provider,
//! derives the canonical local snapshot, and commits it atomically. This is
//! the only writer of profile subscription fields.
//!
//! Precedence when deriving the snapshot:
//! 1. an access-granting subscription (active, trialing, or past-due) with a
//!    future paid-through date,
//! 2. the most recently created canceled subscription whose paid-through
//!    date is still in the future (grace period),
//! 3. a recently completed checkout session with no subscription record yet,
//! 4. a still-running local trial,
//! 5. terminal: cancelled, expired, or free.

use super::single_flight::{FlightError, FlightRole, SingleFlight};
use crate::config::TrialConfig;
use crate::error::{PaygateError, Result};
use crate::gateway::client::{CheckoutRecord, PaymentGateway, ProviderStatus, ProviderSubscription};
use crate::notify::{self, Notification, NotificationSink};
use crate::profile::{AccessStatus, Profile, ProfileStore, SubscriptionSnapshot};
use crate::time::{days, hours, unix_now};
use std::sync::Arc;

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub profile_id: String,
    pub snapshot: SubscriptionSnapshot,
    /// True only if some stored field actually changed.
    pub changed: bool,
}

/// The engine. Cheap to clone; all state is shared.
pub struct ReconcileEngine<S, G, N> {
    store: Arc<S>,
    gateway: Arc<G>,
    sink: Arc<N>,
    trial_config: TrialConfig,
    flights: SingleFlight<ReconcileOutcome>,
}

impl<S, G, N> ReconcileEngine<S, G, N>
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
{
    pub fn new(store: Arc<S>, gateway: Arc<G>, sink: Arc<N>, trial_config: TrialConfig) -> Self {
        Self {
            store,
            gateway,
            sink,
            trial_config,
            flights: SingleFlight::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    /// Reconcile one profile against provider truth.
    ///
    /// Concurrent calls for the same profile collapse into a single flight;
    /// every caller receives the same outcome. The commit runs on a detached
    /// task and survives caller disconnects.
    pub async fn reconcile_profile(&self, profile_id: &str) -> Result<ReconcileOutcome> {
        let store = Arc::clone(&self.store);
        let gateway = Arc::clone(&self.gateway);
        let sink = Arc::clone(&self.sink);
        let trial_config = self.trial_config.clone();
        let id = profile_id.to_string();

        let (result, role) = self
            .flights
            .run(profile_id, async move {
                Self::execute(store, gateway, sink, trial_config, id)
                    .await
                    .map_err(|err| FlightError::from(&err))
            })
            .await;

        if role == FlightRole::Follower {
            tracing::debug!(
                target: "paygate::reconcile",
                profile_id = %profile_id,
                "Joined in-flight reconciliation"
            );
        }

        result.map_err(PaygateError::from)
    }

    /// Reconcile the profile linked to a provider customer. Unknown customers
    /// are a logged no-op, not an error; deletion webhooks routinely arrive
    /// for customers this system never saw.
    pub async fn reconcile_by_customer(
        &self,
        customer_id: &str,
    ) -> Result<Option<ReconcileOutcome>> {
        match self.store.find_by_customer(customer_id).await? {
            Some(profile) => Ok(Some(self.reconcile_profile(&profile.id).await?)),
            None => {
                tracing::info!(
                    target: "paygate::reconcile",
                    customer_id = %customer_id,
                    "Event for unknown customer ignored"
                );
                Ok(None)
            }
        }
    }

    async fn execute(
        store: Arc<S>,
        gateway: Arc<G>,
        sink: Arc<N>,
        trial_config: TrialConfig,
        profile_id: String,
    ) -> Result<ReconcileOutcome> {
        let now = unix_now();
        let profile = store
            .get(&profile_id)
            .await?
            .ok_or_else(|| PaygateError::not_found(format!("profile {profile_id}")))?;

        // Admins are outside the subscription lifecycle entirely; no
        // provider call, no write.
        if profile.is_admin {
            return Ok(ReconcileOutcome {
                snapshot: profile.snapshot(),
                profile_id: profile.id,
                changed: false,
            });
        }

        // Fetch provider state. Any gateway failure aborts here; the store
        // keeps its previous snapshot untouched.
        let (subscriptions, checkout) = match &profile.payment_customer_id {
            Some(customer_id) => {
                let subs = gateway.list_subscriptions(customer_id).await?;
                let has_live_candidate = subs
                    .iter()
                    .any(|s| s.paid_through().is_some_and(|end| end > now));
                let checkout = if has_live_candidate {
                    None
                } else {
                    gateway.latest_completed_checkout(customer_id).await?
                };
                (subs, checkout)
            }
            None => (Vec::new(), None),
        };

        let snapshot =
            derive_snapshot(&profile, &subscriptions, checkout.as_ref(), now, &trial_config);
        let changed = store.apply_snapshot(&profile.id, &snapshot, now).await?;

        tracing::info!(
            target: "paygate::reconcile",
            profile_id = %profile.id,
            old_status = %profile.status,
            new_status = %snapshot.status,
            changed,
            "Reconciliation committed"
        );

        if changed {
            if let Some(notification) = transition_notification(&profile, &snapshot) {
                notify::dispatch(sink.as_ref(), notification).await;
            }
        }

        Ok(ReconcileOutcome {
            profile_id: profile.id,
            snapshot,
            changed,
        })
    }
}

/// Derive the canonical snapshot from provider state. Pure.
pub fn derive_snapshot(
    profile: &Profile,
    subscriptions: &[ProviderSubscription],
    checkout: Option<&CheckoutRecord>,
    now: u64,
    config: &TrialConfig,
) -> SubscriptionSnapshot {
    // 1. Access-granting subscription with a future paid-through date. Among
    // several, the one paid furthest out wins.
    let live = subscriptions
        .iter()
        .filter(|s| s.status.grants_access())
        .filter(|s| s.paid_through().is_some_and(|end| end > now))
        .max_by_key(|s| (s.paid_through(), s.created));
    if let Some(sub) = live {
        return snapshot_from_subscription(sub, profile);
    }

    // 2. Grace period: canceled upstream but paid through a future date. The
    // most recently created one reflects the user's latest transaction.
    let grace = subscriptions
        .iter()
        .filter(|s| !s.status.grants_access())
        .filter(|s| s.paid_through().is_some_and(|end| end > now))
        .max_by_key(|s| s.created);
    if let Some(sub) = grace {
        let mut snapshot = snapshot_from_subscription(sub, profile);
        snapshot.auto_renew = false;
        if snapshot.cancelled_at.is_none() {
            snapshot.cancelled_at = profile.cancelled_at.or(Some(now));
        }
        return snapshot;
    }

    // 3. Completed checkout with no subscription record yet. Only sessions
    // completed recently qualify; an old session id replayed months later
    // must not mint access.
    if let Some(record) = checkout {
        let fresh = now.saturating_sub(record.completed_at)
            <= hours(u64::from(config.checkout_recency_hours));
        let window_end = record.completed_at + days(u64::from(config.checkout_fallback_days));
        if fresh && window_end > now {
            return SubscriptionSnapshot {
                status: AccessStatus::Active,
                subscription_start: Some(record.completed_at),
                subscription_end: Some(window_end),
                payment_subscription_id: None,
                payment_price_id: None,
                subscription_amount: record.amount_total,
                original_amount: record.amount_total,
                discount_percent: None,
                discount_name: None,
                auto_renew: false,
                cancelled_at: None,
            };
        }
    }

    // 4. A running local trial has no provider record; reconciliation must
    // not wipe it.
    if profile.trial_used {
        if let Some(trial_end) = profile.trial_end {
            if trial_end > now {
                let mut snapshot = SubscriptionSnapshot::free();
                snapshot.status = AccessStatus::Active;
                snapshot.subscription_start = profile.subscription_start;
                snapshot.subscription_end = Some(trial_end);
                return snapshot;
            }
        }
    }

    // 5. Terminal. Cancelled is reserved for subscriptions the provider
    // actually reports as canceled; a dead subscription in any other state
    // (unpaid, paused, incomplete) lapses to Expired without a cancel stamp.
    let latest_dead = subscriptions
        .iter()
        .filter(|s| !s.status.grants_access())
        .max_by_key(|s| s.created);
    let was_cancelled = latest_dead
        .is_some_and(|s| s.status == ProviderStatus::Canceled || s.canceled_at.is_some());
    let mut snapshot = SubscriptionSnapshot::free();
    if was_cancelled || profile.cancelled_at.is_some() {
        snapshot.status = AccessStatus::Cancelled;
        snapshot.cancelled_at = latest_dead
            .and_then(|s| s.canceled_at)
            .or(profile.cancelled_at)
            .or(Some(now));
    } else if !subscriptions.is_empty()
        || profile.payment_subscription_id.is_some()
        || profile.trial_used
    {
        snapshot.status = AccessStatus::Expired;
    }
    snapshot
}

fn snapshot_from_subscription(
    sub: &ProviderSubscription,
    profile: &Profile,
) -> SubscriptionSnapshot {
    let cancelling = sub.cancel_at_period_end || !sub.status.grants_access();
    SubscriptionSnapshot {
        status: AccessStatus::Active,
        subscription_start: sub.current_period_start,
        subscription_end: sub.paid_through(),
        payment_subscription_id: Some(sub.id.clone()),
        payment_price_id: sub.price_id.clone(),
        subscription_amount: sub.charged_amount(),
        original_amount: sub.unit_amount,
        discount_percent: sub.discount.as_ref().and_then(|d| d.percent),
        discount_name: sub.discount.as_ref().and_then(|d| d.name.clone()),
        auto_renew: !cancelling,
        cancelled_at: if cancelling {
            sub.canceled_at.or(profile.cancelled_at)
        } else {
            None
        },
    }
}

fn transition_notification(
    before: &Profile,
    after: &SubscriptionSnapshot,
) -> Option<Notification> {
    match (before.status, after.status) {
        (old, AccessStatus::Active) if old != AccessStatus::Active => {
            Some(Notification::SubscriptionActivated {
                profile_id: before.id.clone(),
                subscription_end: after.subscription_end,
            })
        }
        (AccessStatus::Active, AccessStatus::Cancelled) => {
            Some(Notification::SubscriptionCancelled {
                profile_id: before.id.clone(),
                access_until: after.subscription_end,
            })
        }
        (AccessStatus::Active, AccessStatus::Expired) => Some(Notification::SubscriptionExpired {
            profile_id: before.id.clone(),
        }),
        _ => None,
    }
}
