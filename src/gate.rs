//! Request-time access gate.
//!
//! The gate answers "does this profile have access right now" from local
//! state, never from the payment provider: cache first, then the store.
//! Concurrent misses for the same profile coalesce into one store read.
//! Abusive polling is absorbed per identity by serving the last computed
//! decision, and a global circuit breaker sheds load during traffic spikes.
//! On any error or ambiguity the gate denies.

use crate::config::GateConfig;
use crate::error::{PaygateError, Result};
use crate::gateway::client::PaymentGateway;
use crate::notify::NotificationSink;
use crate::profile::{AccessStatus, Profile, ProfileStore};
use crate::reconcile::ReconcileEngine;
use crate::time::unix_now;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};
use moka::future::Cache;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

type KeyedLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock, NoOpMiddleware>;

/// One access decision.
///
/// Carries the full subscription snapshot a status response needs, so
/// callers serving cached decisions never have to re-read the profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDecision {
    pub allowed: bool,
    pub status: AccessStatus,
    pub subscription_end: Option<u64>,
    /// Whether this profile is still eligible for the one-shot trial.
    pub can_start_trial: bool,
    pub is_admin: bool,
    pub auto_renew: bool,
    pub cancelled_at: Option<u64>,
    pub trial_used: bool,
    pub trial_end: Option<u64>,
    pub subscription_amount: Option<i64>,
    pub original_amount: Option<i64>,
    pub discount_percent: Option<u8>,
    pub discount_name: Option<String>,
    pub source: DecisionSource,
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// Served from the decision cache.
    Cache,
    /// Computed from the profile store.
    Store,
    /// Computed after a synchronous reconciliation.
    Refreshed,
    /// Served stale because the identity is over its check cap or the
    /// provider was unreachable during a forced refresh.
    LastKnown,
    /// Error or missing profile; access denied.
    DefaultDeny,
}

impl AccessDecision {
    fn from_profile(profile: &Profile, now: u64, source: DecisionSource) -> Self {
        Self {
            allowed: profile.has_access_at(now),
            status: profile.status,
            subscription_end: profile.subscription_end,
            can_start_trial: profile.can_start_trial(),
            is_admin: profile.is_admin,
            auto_renew: profile.auto_renew,
            cancelled_at: profile.cancelled_at,
            trial_used: profile.trial_used,
            trial_end: profile.trial_end,
            subscription_amount: profile.subscription_amount,
            original_amount: profile.original_amount,
            discount_percent: profile.discount_percent,
            discount_name: profile.discount_name.clone(),
            source,
        }
    }

    fn deny() -> Self {
        Self {
            allowed: false,
            status: AccessStatus::Free,
            subscription_end: None,
            can_start_trial: false,
            is_admin: false,
            auto_renew: false,
            cancelled_at: None,
            trial_used: false,
            trial_end: None,
            subscription_amount: None,
            original_amount: None,
            discount_percent: None,
            discount_name: None,
            source: DecisionSource::DefaultDeny,
        }
    }
}

/// Fixed-window global breaker. When total check volume in the current
/// minute exceeds the threshold, the gate goes unavailable for a cool-down.
struct CircuitBreaker {
    threshold: u64,
    cooldown_seconds: u64,
    window_start: AtomicU64,
    count: AtomicU64,
    open_until: AtomicU64,
}

impl CircuitBreaker {
    fn new(threshold: u64, cooldown_seconds: u64) -> Self {
        Self {
            threshold,
            cooldown_seconds,
            window_start: AtomicU64::new(unix_now()),
            count: AtomicU64::new(0),
            open_until: AtomicU64::new(0),
        }
    }

    /// Record one check. `Err(())` while open or newly tripped.
    fn admit(&self, now: u64) -> std::result::Result<(), ()> {
        if now < self.open_until.load(Ordering::Acquire) {
            return Err(());
        }

        let start = self.window_start.load(Ordering::Acquire);
        if now.saturating_sub(start) >= 60 {
            // New minute window. A racing reset is harmless; counts blur
            // across the boundary by at most one window.
            if self
                .window_start
                .compare_exchange(start, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.count.store(0, Ordering::Release);
            }
        }

        let seen = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if seen > self.threshold {
            self.open_until
                .store(now + self.cooldown_seconds, Ordering::Release);
            tracing::error!(
                target: "paygate::gate",
                checks_in_window = seen,
                threshold = self.threshold,
                cooldown_seconds = self.cooldown_seconds,
                "Access-check circuit opened"
            );
            return Err(());
        }
        Ok(())
    }
}

/// The gate. Construct once and share.
pub struct AccessGate<S, G, N> {
    engine: Arc<ReconcileEngine<S, G, N>>,
    store: Arc<S>,
    decisions: Cache<String, AccessDecision>,
    /// Long-lived copy of each profile's most recent decision, served when
    /// the identity is over its check cap.
    last_known: Cache<String, AccessDecision>,
    limiter: KeyedLimiter,
    breaker: CircuitBreaker,
}

impl<S, G, N> AccessGate<S, G, N>
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
{
    pub fn new(engine: Arc<ReconcileEngine<S, G, N>>, store: Arc<S>, config: &GateConfig) -> Self {
        let per_minute = NonZeroU32::new(config.checks_per_minute.max(1))
            .expect("max(1) keeps the quota non-zero");
        Self {
            engine,
            store,
            decisions: Cache::builder()
                .max_capacity(config.decision_cache_entries)
                .time_to_live(Duration::from_secs(config.decision_ttl_seconds))
                .build(),
            last_known: Cache::builder()
                .max_capacity(config.decision_cache_entries)
                .time_to_live(Duration::from_secs(86_400))
                .build(),
            limiter: RateLimiter::keyed(Quota::per_minute(per_minute)),
            breaker: CircuitBreaker::new(
                config.global_checks_per_minute,
                config.circuit_cooldown_seconds,
            ),
        }
    }

    /// Decide whether `profile_id` has access.
    ///
    /// `force_refresh` bypasses the cache and pulls provider truth through
    /// the reconciliation engine before deciding.
    pub async fn check_access(
        &self,
        profile_id: &str,
        force_refresh: bool,
    ) -> Result<AccessDecision> {
        let now = unix_now();

        if self.breaker.admit(now).is_err() {
            return Err(PaygateError::ServiceUnavailable(
                "access checks are shedding load".to_string(),
            ));
        }

        if self.limiter.check_key(&profile_id.to_string()).is_err() {
            // Over the per-identity cap: absorb the polling by replaying the
            // newest decision instead of erroring a legitimate client.
            if let Some(mut decision) = self.last_known.get(profile_id).await {
                decision.source = DecisionSource::LastKnown;
                return Ok(decision);
            }
            return Err(PaygateError::rate_limited("access checks exceeded"));
        }

        if force_refresh {
            return self.refreshed_decision(profile_id, now).await;
        }

        if let Some(mut decision) = self.decisions.get(profile_id).await {
            decision.source = DecisionSource::Cache;
            return Ok(decision);
        }

        let store = Arc::clone(&self.store);
        let key = profile_id.to_string();
        let lookup = self
            .decisions
            .try_get_with(key.clone(), async move {
                match store.get(&key).await? {
                    Some(profile) => {
                        Ok(AccessDecision::from_profile(&profile, now, DecisionSource::Store))
                    }
                    None => Err(PaygateError::not_found(format!("profile {key}"))),
                }
            })
            .await;

        let decision = match lookup {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(
                    target: "paygate::gate",
                    profile_id = %profile_id,
                    error = %err,
                    "Access check failed; denying"
                );
                AccessDecision::deny()
            }
        };

        self.record(profile_id, &decision).await;
        Ok(decision)
    }

    /// Throw away any cached decision for this profile. Called after writes
    /// that change subscription state.
    pub async fn invalidate(&self, profile_id: &str) {
        self.decisions.invalidate(profile_id).await;
    }

    /// Periodic housekeeping for the keyed limiter.
    pub fn maintain(&self) {
        self.limiter.retain_recent();
    }

    async fn refreshed_decision(&self, profile_id: &str, now: u64) -> Result<AccessDecision> {
        self.decisions.invalidate(profile_id).await;

        match self.engine.reconcile_profile(profile_id).await {
            Ok(_) => {}
            Err(err) if err.is_retryable() => {
                // Provider down. Availability beats freshness on reads: fall
                // back to what the store already says.
                tracing::warn!(
                    target: "paygate::gate",
                    profile_id = %profile_id,
                    error = %err,
                    "Refresh failed; deciding from last-known state"
                );
                let decision = match self.store.get(profile_id).await? {
                    Some(profile) => {
                        AccessDecision::from_profile(&profile, now, DecisionSource::LastKnown)
                    }
                    None => AccessDecision::deny(),
                };
                self.record(profile_id, &decision).await;
                return Ok(decision);
            }
            Err(err) => return Err(err),
        }

        let decision = match self.store.get(profile_id).await? {
            Some(profile) => {
                AccessDecision::from_profile(&profile, now, DecisionSource::Refreshed)
            }
            None => AccessDecision::deny(),
        };
        self.record(profile_id, &decision).await;
        Ok(decision)
    }

    /// Positive decisions stay cached for the TTL. Negative ones are evicted
    /// at once so an upgrade is visible on the next check.
    async fn record(&self, profile_id: &str, decision: &AccessDecision) {
        if decision.allowed {
            self.decisions
                .insert(profile_id.to_string(), decision.clone())
                .await;
        } else {
            self.decisions.invalidate(profile_id).await;
        }
        if decision.source != DecisionSource::DefaultDeny {
            self.last_known
                .insert(profile_id.to_string(), decision.clone())
                .await;
        }
    }
}
