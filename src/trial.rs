//! Trial and grace-period management.
//!
//! The trial is a one-time, locally granted access window with no provider
//! record. Cancellation is always cancel-at-period-end: access runs to the
//! paid-through date and the user can change their mind until it passes.

use crate::config::TrialConfig;
use crate::error::{PaygateError, Result};
use crate::gateway::client::PaymentGateway;
use crate::notify::{self, Notification, NotificationSink};
use crate::profile::{AccessStatus, Profile, ProfileStore};
use crate::time::{days, unix_now};
use std::sync::Arc;

pub struct TrialManager<S, G, N> {
    store: Arc<S>,
    gateway: Arc<G>,
    sink: Arc<N>,
    config: TrialConfig,
}

impl<S, G, N> TrialManager<S, G, N>
where
    S: ProfileStore,
    G: PaymentGateway,
    N: NotificationSink,
{
    pub fn new(store: Arc<S>, gateway: Arc<G>, sink: Arc<N>, config: TrialConfig) -> Self {
        Self {
            store,
            gateway,
            sink,
            config,
        }
    }

    /// Start the one-time trial.
    ///
    /// The check-and-set is a single atomic store operation; when two calls
    /// race, exactly one wins and the loser gets `Conflict`.
    pub async fn start_trial(&self, profile_id: &str) -> Result<Profile> {
        let now = unix_now();
        let trial_end = now + days(u64::from(self.config.trial_days));

        let won = self.store.begin_trial(profile_id, trial_end, now).await?;
        if !won {
            return Err(PaygateError::conflict("trial already used"));
        }

        tracing::info!(
            target: "paygate::trial",
            profile_id = %profile_id,
            trial_end,
            "Trial started"
        );
        notify::dispatch(
            self.sink.as_ref(),
            Notification::TrialStarted {
                profile_id: profile_id.to_string(),
                trial_end,
            },
        )
        .await;

        self.store
            .get(profile_id)
            .await?
            .ok_or_else(|| PaygateError::not_found(format!("profile {profile_id}")))
    }

    /// Cancel with grace: schedule the upstream cancellation at the period
    /// boundary and flip auto-renew off locally. Status stays Active and the
    /// paid-through date is never touched.
    pub async fn cancel_with_grace(&self, profile_id: &str) -> Result<Profile> {
        let profile = self.load(profile_id).await?;
        if profile.status != AccessStatus::Active {
            return Err(PaygateError::conflict("no active subscription to cancel"));
        }
        let Some(subscription_id) = profile.payment_subscription_id.as_deref() else {
            return Err(PaygateError::conflict(
                "subscription is not managed by the payment provider",
            ));
        };

        // Upstream first. If this fails nothing local changes and the caller
        // can retry.
        self.gateway
            .set_cancel_at_period_end(subscription_id, true)
            .await?;

        let now = unix_now();
        self.store
            .set_auto_renew(profile_id, false, Some(now))
            .await?;

        tracing::info!(
            target: "paygate::trial",
            profile_id = %profile_id,
            subscription_id = %subscription_id,
            access_until = ?profile.subscription_end,
            "Cancellation scheduled at period end"
        );
        notify::dispatch(
            self.sink.as_ref(),
            Notification::SubscriptionCancelled {
                profile_id: profile_id.to_string(),
                access_until: profile.subscription_end,
            },
        )
        .await;

        self.load(profile_id).await
    }

    /// Undo a scheduled cancellation before the period end passes.
    pub async fn reenable_auto_renew(&self, profile_id: &str) -> Result<Profile> {
        let profile = self.load(profile_id).await?;
        if profile.status != AccessStatus::Active {
            return Err(PaygateError::conflict("subscription is no longer active"));
        }
        if profile.auto_renew {
            return Err(PaygateError::conflict("auto-renew is already on"));
        }
        let Some(subscription_id) = profile.payment_subscription_id.as_deref() else {
            return Err(PaygateError::conflict(
                "subscription is not managed by the payment provider",
            ));
        };
        if let Some(end) = profile.subscription_end {
            if unix_now() >= end {
                return Err(PaygateError::conflict(
                    "period already ended; a new subscription is required",
                ));
            }
        }

        self.gateway
            .set_cancel_at_period_end(subscription_id, false)
            .await?;
        self.store.set_auto_renew(profile_id, true, None).await?;

        tracing::info!(
            target: "paygate::trial",
            profile_id = %profile_id,
            subscription_id = %subscription_id,
            "Auto-renew re-enabled"
        );
        self.load(profile_id).await
    }

    async fn load(&self, profile_id: &str) -> Result<Profile> {
        self.store
            .get(profile_id)
            .await?
            .ok_or_else(|| PaygateError::not_found(format!("profile {profile_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::client::{ProviderStatus, ProviderSubscription};
    use crate::gateway::mock::MockGateway;
    use crate::notify::test::RecordingSink;
    use crate::profile::memory::InMemoryProfileStore;

    struct Fixture {
        manager: TrialManager<InMemoryProfileStore, MockGateway, RecordingSink>,
        store: InMemoryProfileStore,
        gateway: MockGateway,
        profile_id: String,
    }

    async fn fixture() -> Fixture {
        let store = InMemoryProfileStore::new();
        let gateway = MockGateway::new();
        let sink = RecordingSink::new();

        let profile = Profile::new("auth0|u1", "u1@example.com");
        let profile_id = profile.id.clone();
        store.insert(&profile).await.unwrap();

        let manager = TrialManager::new(
            Arc::new(store.clone()),
            Arc::new(gateway.clone()),
            Arc::new(sink),
            TrialConfig::default(),
        );
        Fixture {
            manager,
            store,
            gateway,
            profile_id,
        }
    }

    async fn make_subscribed(f: &Fixture) {
        let now = unix_now();
        f.gateway.add_subscription(ProviderSubscription {
            id: "sub_1".to_string(),
            customer_id: "cus_1".to_string(),
            status: ProviderStatus::Active,
            created: now - 100,
            current_period_start: Some(now - 100),
            current_period_end: Some(now + days(20)),
            item_period_end: None,
            price_id: Some("price_1".to_string()),
            unit_amount: Some(15_000),
            discount: None,
            cancel_at_period_end: false,
            canceled_at: None,
        });

        let mut profile = f.store.get(&f.profile_id).await.unwrap().unwrap();
        profile.status = AccessStatus::Active;
        profile.payment_customer_id = Some("cus_1".to_string());
        profile.payment_subscription_id = Some("sub_1".to_string());
        profile.subscription_end = Some(now + days(20));
        profile.auto_renew = true;
        f.store.insert(&profile).await.unwrap();
    }

    #[tokio::test]
    async fn test_trial_grants_active_window() {
        let f = fixture().await;
        let profile = f.manager.start_trial(&f.profile_id).await.unwrap();
        assert_eq!(profile.status, AccessStatus::Active);
        assert!(profile.trial_used);
        let end = profile.trial_end.unwrap();
        assert!(end > unix_now() + days(13));
    }

    #[tokio::test]
    async fn test_second_trial_is_conflict() {
        let f = fixture().await;
        f.manager.start_trial(&f.profile_id).await.unwrap();
        let err = f.manager.start_trial(&f.profile_id).await.unwrap_err();
        assert!(matches!(err, PaygateError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_concurrent_trial_starts_have_one_winner() {
        let f = fixture().await;
        let manager = Arc::new(f.manager);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let manager = Arc::clone(&manager);
            let id = f.profile_id.clone();
            handles.push(tokio::spawn(async move { manager.start_trial(&id).await }));
        }

        let mut winners = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(PaygateError::Conflict(_)) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(conflicts, 5);
    }

    #[tokio::test]
    async fn test_cancel_with_grace_keeps_access_window() {
        let f = fixture().await;
        make_subscribed(&f).await;
        let before = f.store.get(&f.profile_id).await.unwrap().unwrap();

        let after = f.manager.cancel_with_grace(&f.profile_id).await.unwrap();
        assert_eq!(after.status, AccessStatus::Active);
        assert!(!after.auto_renew);
        assert!(after.cancelled_at.is_some());
        // The paid-through date is untouched.
        assert_eq!(after.subscription_end, before.subscription_end);
        assert!(after.has_access_at(unix_now()));
    }

    #[tokio::test]
    async fn test_cancel_upstream_failure_changes_nothing() {
        let f = fixture().await;
        make_subscribed(&f).await;
        f.gateway.set_failing(true);

        let err = f.manager.cancel_with_grace(&f.profile_id).await.unwrap_err();
        assert!(err.is_retryable());

        let profile = f.store.get(&f.profile_id).await.unwrap().unwrap();
        assert!(profile.auto_renew);
        assert!(profile.cancelled_at.is_none());
    }

    #[tokio::test]
    async fn test_reenable_before_period_end() {
        let f = fixture().await;
        make_subscribed(&f).await;
        f.manager.cancel_with_grace(&f.profile_id).await.unwrap();

        let profile = f.manager.reenable_auto_renew(&f.profile_id).await.unwrap();
        assert!(profile.auto_renew);
        assert!(profile.cancelled_at.is_none());
    }

    #[tokio::test]
    async fn test_reenable_without_pending_cancel_is_conflict() {
        let f = fixture().await;
        make_subscribed(&f).await;
        let err = f.manager.reenable_auto_renew(&f.profile_id).await.unwrap_err();
        assert!(matches!(err, PaygateError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cancel_without_subscription_is_conflict() {
        let f = fixture().await;
        let err = f.manager.cancel_with_grace(&f.profile_id).await.unwrap_err();
        assert!(matches!(err, PaygateError::Conflict(_)));
    }
}
