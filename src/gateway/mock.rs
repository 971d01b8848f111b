//! Mock payment gateway for testing and development.

use super::client::{
    CheckoutRecord, DiscountRequest, PaymentGateway, ProviderDiscount, ProviderSubscription,
};
use crate::error::{PaygateError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory gateway with scriptable state and failure injection.
#[derive(Default, Clone)]
pub struct MockGateway {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    subscriptions: Mutex<HashMap<String, Vec<ProviderSubscription>>>,
    checkouts: Mutex<HashMap<String, CheckoutRecord>>,
    fail: AtomicBool,
    list_calls: AtomicUsize,
    list_delay_ms: AtomicUsize,
}

impl MockGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_subscription(&self, sub: ProviderSubscription) {
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .entry(sub.customer_id.clone())
            .or_default()
            .push(sub);
    }

    pub fn clear_subscriptions(&self, customer_id: &str) {
        self.inner.subscriptions.lock().unwrap().remove(customer_id);
    }

    pub fn set_checkout(&self, checkout: CheckoutRecord) {
        self.inner
            .checkouts
            .lock()
            .unwrap()
            .insert(checkout.customer_id.clone(), checkout);
    }

    /// Make every call fail with `UpstreamUnavailable`.
    pub fn set_failing(&self, fail: bool) {
        self.inner.fail.store(fail, Ordering::SeqCst);
    }

    /// How many times `list_subscriptions` was called.
    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    /// Hold each `list_subscriptions` call for this long, to force overlap
    /// in concurrency tests.
    pub fn set_list_delay_ms(&self, ms: usize) {
        self.inner.list_delay_ms.store(ms, Ordering::SeqCst);
    }

    fn check_failure(&self) -> Result<()> {
        if self.inner.fail.load(Ordering::SeqCst) {
            return Err(PaygateError::upstream_unavailable("mock gateway failure"));
        }
        Ok(())
    }

    fn update_subscription<F>(&self, subscription_id: &str, f: F) -> Result<ProviderSubscription>
    where
        F: FnOnce(&mut ProviderSubscription),
    {
        let mut subs = self.inner.subscriptions.lock().unwrap();
        for list in subs.values_mut() {
            if let Some(sub) = list.iter_mut().find(|s| s.id == subscription_id) {
                f(sub);
                return Ok(sub.clone());
            }
        }
        Err(PaygateError::not_found(format!(
            "subscription {subscription_id}"
        )))
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn list_subscriptions(&self, customer_id: &str) -> Result<Vec<ProviderSubscription>> {
        self.inner.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.inner.list_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay as u64)).await;
        }
        self.check_failure()?;
        let mut subs = self
            .inner
            .subscriptions
            .lock()
            .unwrap()
            .get(customer_id)
            .cloned()
            .unwrap_or_default();
        subs.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(subs)
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> Result<ProviderSubscription> {
        self.check_failure()?;
        self.update_subscription(subscription_id, |sub| {
            sub.cancel_at_period_end = cancel;
        })
    }

    async fn apply_discount(
        &self,
        subscription_id: &str,
        discount: DiscountRequest,
    ) -> Result<ProviderSubscription> {
        self.check_failure()?;
        self.update_subscription(subscription_id, |sub| {
            sub.discount = Some(ProviderDiscount {
                percent: discount.percent,
                amount_off: discount.amount_off,
                name: Some(discount.name),
            });
        })
    }

    async fn latest_completed_checkout(&self, customer_id: &str) -> Result<Option<CheckoutRecord>> {
        self.check_failure()?;
        Ok(self.inner.checkouts.lock().unwrap().get(customer_id).cloned())
    }
}
