//! Webhook event ingress.
//!
//! The HTTP-facing side does only the cheap work: verify the signature,
//! parse, drop duplicates, and hand the event to a per-customer lane. The
//! ack never waits on the payment provider. Each lane is a queue drained by
//! one task, so events for the same customer are processed strictly in the
//! order they were accepted; the lane deduplicates again, checks the
//! per-customer high-water mark so redelivered stale events cannot regress
//! state, then folds the event into a reconciliation pull. Handlers never
//! trust event payloads as state; the event only says whose truth to
//! re-fetch.

use super::verify::SignatureVerifier;
use crate::error::{PaygateError, Result};
use crate::gateway::client::PaymentGateway;
use crate::notify::{self, Notification, NotificationSink};
use crate::profile::{Profile, ProfileStore};
use crate::reconcile::ReconcileEngine;
use crate::time::unix_now;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

/// Raw provider event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Provider-side creation timestamp, Unix seconds.
    pub created: u64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

impl WebhookEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self.event_type.as_str() {
            "customer.subscription.created" => EventKind::SubscriptionCreated,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionDeleted,
            "checkout.session.completed" => EventKind::CheckoutCompleted,
            "invoice.paid" => EventKind::InvoicePaid,
            "invoice.payment_failed" => EventKind::InvoiceFailed,
            _ => EventKind::Unrecognized,
        }
    }

    #[must_use]
    pub fn customer_id(&self) -> Option<&str> {
        self.data.object.get("customer").and_then(|v| v.as_str())
    }

    /// Customer email, where the event carries one (checkout sessions do).
    #[must_use]
    pub fn customer_email(&self) -> Option<&str> {
        self.data
            .object
            .get("customer_details")
            .and_then(|d| d.get("email"))
            .and_then(|v| v.as_str())
            .or_else(|| self.data.object.get("customer_email").and_then(|v| v.as_str()))
    }
}

/// Normalized event types this system reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    CheckoutCompleted,
    InvoicePaid,
    InvoiceFailed,
    Unrecognized,
}

/// What accepting or processing an event amounted to. Every variant maps to
/// HTTP 200; the provider only needs to know the delivery landed.
/// [`Enqueued`](IngressOutcome::Enqueued) is what the HTTP side returns; the
/// others are produced when an event is actually worked, which the lane task
/// does after the ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressOutcome {
    /// Accepted and queued on the customer's lane.
    Enqueued,
    /// Reconciliation ran; `changed` reports whether the store moved.
    Reconciled { changed: bool },
    /// Event id seen before; redelivery acknowledged without effect.
    AlreadyProcessed,
    /// Older than an event already processed for this customer; skipped.
    Stale,
    /// Recognized event type but no action required.
    Acknowledged,
    /// Event type or payload this system does not handle.
    Ignored,
    /// Customer not linked to any profile.
    UnknownCustomer,
}

/// Called with the profile id after a deferred reconciliation changed state.
pub type ChangeListener =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Retry budget for deferred reconciliations; the delivery was already
/// acked, so transient provider failures must be absorbed here.
const LANE_ATTEMPTS: u32 = 3;
const LANE_RETRY_DELAY_MS: u64 = 500;

struct Queue {
    depth: AtomicUsize,
}

/// Webhook ingress pipeline: verify, dedup, enqueue; lanes order and
/// dispatch.
pub struct WebhookIngress<S, G, N> {
    verifier: SignatureVerifier,
    engine: Arc<ReconcileEngine<S, G, N>>,
    store: Arc<S>,
    sink: Arc<N>,
    lanes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<WebhookEvent>>>>,
    queue: Arc<Queue>,
    listener: Arc<RwLock<Option<ChangeListener>>>,
}

impl<S, G, N> Clone for WebhookIngress<S, G, N> {
    fn clone(&self) -> Self {
        Self {
            verifier: self.verifier.clone(),
            engine: Arc::clone(&self.engine),
            store: Arc::clone(&self.store),
            sink: Arc::clone(&self.sink),
            lanes: Arc::clone(&self.lanes),
            queue: Arc::clone(&self.queue),
            listener: Arc::clone(&self.listener),
        }
    }
}

impl<S, G, N> WebhookIngress<S, G, N>
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
{
    pub fn new(
        verifier: SignatureVerifier,
        engine: Arc<ReconcileEngine<S, G, N>>,
        store: Arc<S>,
        sink: Arc<N>,
    ) -> Self {
        Self {
            verifier,
            engine,
            store,
            sink,
            lanes: Arc::new(Mutex::new(HashMap::new())),
            queue: Arc::new(Queue {
                depth: AtomicUsize::new(0),
            }),
            listener: Arc::new(RwLock::new(None)),
        }
    }

    /// Register a callback fired with the profile id whenever a deferred
    /// reconciliation changed stored state. Used to drop cached access
    /// decisions that the event just invalidated.
    pub fn set_change_listener<F>(&self, listener: F)
    where
        F: Fn(String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    {
        *self.listener.write().unwrap() = Some(Arc::new(listener));
    }

    /// Verify a raw delivery and accept it for processing.
    ///
    /// Returns as soon as the event is queued; the reconciliation pull runs
    /// on the customer's lane afterwards. Only signature, parse, and
    /// duplicate checks happen inline, so the provider gets its ack in
    /// store-read time regardless of provider-API latency.
    pub async fn process(&self, payload: &[u8], signature_header: &str) -> Result<IngressOutcome> {
        self.verifier
            .verify(payload, signature_header, unix_now() as i64)?;

        let event: WebhookEvent = serde_json::from_slice(payload).map_err(|err| {
            tracing::warn!(
                target: "paygate::webhook",
                error = %err,
                "Unparseable webhook payload"
            );
            PaygateError::validation("malformed webhook payload")
        })?;

        if event.kind() == EventKind::Unrecognized {
            return Ok(IngressOutcome::Ignored);
        }
        if self.store.is_event_processed(&event.id).await? {
            tracing::debug!(
                target: "paygate::webhook",
                event_id = %event.id,
                "Duplicate delivery acknowledged"
            );
            return Ok(IngressOutcome::AlreadyProcessed);
        }
        let Some(customer_id) = event.customer_id().map(str::to_string) else {
            return Ok(IngressOutcome::Ignored);
        };

        self.enqueue(customer_id, event);
        Ok(IngressOutcome::Enqueued)
    }

    /// Resolve once every accepted event has been worked. For shutdown
    /// draining and tests.
    pub async fn wait_idle(&self) {
        while self.queue.depth.load(Ordering::Acquire) != 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    fn enqueue(&self, customer_id: String, event: WebhookEvent) {
        self.queue.depth.fetch_add(1, Ordering::AcqRel);
        let mut lanes = self.lanes.lock().unwrap();
        let sender = lanes
            .entry(customer_id.clone())
            .or_insert_with(|| self.spawn_lane(&customer_id));
        if let Err(returned) = sender.send(event) {
            // Lane task died (panicked mid-event); start a fresh one.
            let replacement = self.spawn_lane(&customer_id);
            let _ = replacement.send(returned.0);
            lanes.insert(customer_id, replacement);
        }
    }

    fn spawn_lane(&self, customer_id: &str) -> mpsc::UnboundedSender<WebhookEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel::<WebhookEvent>();
        let worker = self.clone();
        let customer_id = customer_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                worker.work(&customer_id, event).await;
                worker.queue.depth.fetch_sub(1, Ordering::AcqRel);
            }
        });
        tx
    }

    /// Drain one queued event: process it, retrying transient provider
    /// failures within the lane's budget. The delivery was already acked, so
    /// errors end here in the log, never at the provider.
    async fn work(&self, customer_id: &str, event: WebhookEvent) {
        let event_id = event.id.clone();
        let mut attempt = 0u32;
        let outcome = loop {
            match self.handle_event(event.clone()).await {
                Ok(outcome) => break Some(outcome),
                Err(err) if err.is_retryable() && attempt + 1 < LANE_ATTEMPTS => {
                    attempt += 1;
                    tracing::warn!(
                        target: "paygate::webhook",
                        event_id = %event_id,
                        customer_id = %customer_id,
                        attempt,
                        error = %err,
                        "Deferred event processing failed; retrying"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(
                        LANE_RETRY_DELAY_MS * u64::from(attempt),
                    ))
                    .await;
                }
                Err(err) => {
                    // Left unmarked; a later event or force-sync re-pulls
                    // this customer's truth.
                    tracing::error!(
                        target: "paygate::webhook",
                        event_id = %event_id,
                        customer_id = %customer_id,
                        error = %err,
                        "Deferred event processing abandoned"
                    );
                    break None;
                }
            }
        };

        if matches!(outcome, Some(IngressOutcome::Reconciled { changed: true })) {
            let listener = self.listener.read().unwrap().clone();
            if let Some(listener) = listener {
                if let Ok(Some(profile)) = self.store.find_by_customer(customer_id).await {
                    listener(profile.id).await;
                }
            }
        }
    }

    /// Process an already-verified event to completion. The lane tasks call
    /// this; it is also the synchronous path for callers that feed events
    /// directly rather than over HTTP.
    pub async fn handle_event(&self, event: WebhookEvent) -> Result<IngressOutcome> {
        let kind = event.kind();
        if kind == EventKind::Unrecognized {
            return Ok(IngressOutcome::Ignored);
        }

        // Re-checked here: the same event can be accepted twice when a
        // redelivery lands before the first copy reaches the front of the
        // lane.
        if self.store.is_event_processed(&event.id).await? {
            tracing::debug!(
                target: "paygate::webhook",
                event_id = %event.id,
                "Duplicate delivery acknowledged"
            );
            return Ok(IngressOutcome::AlreadyProcessed);
        }

        let Some(customer_id) = event.customer_id().map(str::to_string) else {
            return Ok(IngressOutcome::Ignored);
        };

        // Deliveries can arrive out of order. An event older than the newest
        // one already processed for this customer must not trigger a pull
        // that could be interleaved against fresher state.
        if let Some(latest) = self.store.latest_event_for_customer(&customer_id).await? {
            if event.created < latest {
                tracing::info!(
                    target: "paygate::webhook",
                    event_id = %event.id,
                    event_created = event.created,
                    latest_processed = latest,
                    "Stale event skipped"
                );
                self.mark_processed(&event, &customer_id).await?;
                return Ok(IngressOutcome::Stale);
            }
        }

        let outcome = match kind {
            EventKind::InvoiceFailed => {
                // A failed invoice never revokes access by itself; the
                // provider's dunning flow decides what happens next and a
                // later event reports it.
                if let Some(profile) = self.store.find_by_customer(&customer_id).await? {
                    tracing::warn!(
                        target: "paygate::webhook",
                        profile_id = %profile.id,
                        customer_id = %customer_id,
                        "Invoice payment failed"
                    );
                    notify::dispatch(
                        self.sink.as_ref(),
                        Notification::PaymentFailed {
                            profile_id: profile.id,
                        },
                    )
                    .await;
                }
                IngressOutcome::Acknowledged
            }
            EventKind::CheckoutCompleted => {
                self.link_profile(&event, &customer_id).await?;
                self.reconcile(&customer_id).await?
            }
            _ => self.reconcile(&customer_id).await?,
        };

        self.mark_processed(&event, &customer_id).await?;
        Ok(outcome)
    }

    async fn reconcile(&self, customer_id: &str) -> Result<IngressOutcome> {
        match self.engine.reconcile_by_customer(customer_id).await? {
            Some(outcome) => Ok(IngressOutcome::Reconciled {
                changed: outcome.changed,
            }),
            None => Ok(IngressOutcome::UnknownCustomer),
        }
    }

    /// Attach the provider customer to a profile the first time a checkout
    /// completes, falling back to email when no link exists yet.
    async fn link_profile(&self, event: &WebhookEvent, customer_id: &str) -> Result<()> {
        if self.store.find_by_customer(customer_id).await?.is_some() {
            return Ok(());
        }
        let Some(email) = event.customer_email() else {
            return Ok(());
        };

        let mut matches = self.store.find_by_email(email).await?;
        if matches.is_empty() {
            tracing::warn!(
                target: "paygate::webhook",
                customer_id = %customer_id,
                "Checkout completed for email with no profile"
            );
            return Ok(());
        }
        if matches.len() > 1 {
            tracing::warn!(
                target: "paygate::webhook",
                customer_id = %customer_id,
                candidates = matches.len(),
                "Multiple profiles share the checkout email; linking the most recent"
            );
        }
        matches.sort_by_key(|p: &Profile| p.updated_at);
        let profile = matches.pop().expect("non-empty after check");

        self.store
            .set_payment_customer(&profile.id, customer_id)
            .await?;
        tracing::info!(
            target: "paygate::webhook",
            profile_id = %profile.id,
            customer_id = %customer_id,
            "Profile linked to payment customer"
        );
        Ok(())
    }

    async fn mark_processed(&self, event: &WebhookEvent, customer_id: &str) -> Result<()> {
        self.store
            .mark_event_processed(&event.id, customer_id, event.created)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrialConfig;
    use crate::gateway::client::{ProviderStatus, ProviderSubscription};
    use crate::gateway::mock::MockGateway;
    use crate::notify::test::RecordingSink;
    use crate::profile::memory::InMemoryProfileStore;
    use crate::profile::AccessStatus;
    use crate::time::days;
    use crate::webhook::sign_payload;

    const SECRET: &str = "whsec_test";

    struct Fixture {
        ingress: WebhookIngress<InMemoryProfileStore, MockGateway, RecordingSink>,
        store: InMemoryProfileStore,
        gateway: MockGateway,
        sink: RecordingSink,
        profile_id: String,
    }

    async fn fixture() -> Fixture {
        let store = InMemoryProfileStore::new();
        let gateway = MockGateway::new();
        let sink = RecordingSink::new();

        let mut profile = Profile::new("auth0|u1", "u1@example.com");
        profile.payment_customer_id = Some("cus_1".to_string());
        let profile_id = profile.id.clone();
        store.insert(&profile).await.unwrap();

        let engine = Arc::new(ReconcileEngine::new(
            Arc::new(store.clone()),
            Arc::new(gateway.clone()),
            Arc::new(sink.clone()),
            TrialConfig::default(),
        ));
        let ingress = WebhookIngress::new(
            SignatureVerifier::new(SECRET.to_string(), 300),
            engine,
            Arc::new(store.clone()),
            Arc::new(sink.clone()),
        );
        Fixture {
            ingress,
            store,
            gateway,
            sink,
            profile_id,
        }
    }

    fn event(id: &str, event_type: &str, created: u64, object: serde_json::Value) -> WebhookEvent {
        WebhookEvent {
            id: id.to_string(),
            event_type: event_type.to_string(),
            created,
            data: WebhookEventData { object },
        }
    }

    fn sub_event(id: &str, event_type: &str, created: u64) -> WebhookEvent {
        event(
            id,
            event_type,
            created,
            serde_json::json!({ "customer": "cus_1" }),
        )
    }

    fn signed(event: &WebhookEvent) -> (Vec<u8>, String) {
        let body = serde_json::json!({
            "id": event.id,
            "type": event.event_type,
            "created": event.created,
            "data": { "object": event.data.object },
        })
        .to_string()
        .into_bytes();
        let header = sign_payload(SECRET, &body, unix_now() as i64);
        (body, header)
    }

    fn active_sub(now: u64) -> ProviderSubscription {
        ProviderSubscription {
            id: "sub_1".to_string(),
            customer_id: "cus_1".to_string(),
            status: ProviderStatus::Active,
            created: now - 100,
            current_period_start: Some(now - 100),
            current_period_end: Some(now + days(30)),
            item_period_end: None,
            price_id: Some("price_1".to_string()),
            unit_amount: Some(15_000),
            discount: None,
            cancel_at_period_end: false,
            canceled_at: None,
        }
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let f = fixture().await;
        let now = unix_now();
        f.gateway.add_subscription(active_sub(now));

        let e = sub_event("evt_1", "customer.subscription.created", now);
        let first = f.ingress.handle_event(e.clone()).await.unwrap();
        assert!(matches!(first, IngressOutcome::Reconciled { changed: true }));

        let second = f.ingress.handle_event(e).await.unwrap();
        assert_eq!(second, IngressOutcome::AlreadyProcessed);
        // Only the first delivery pulled provider state.
        assert_eq!(f.gateway.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_updated_after_deleted_keeps_deleted_state() {
        let f = fixture().await;
        let now = unix_now();

        // Subscribe, then the provider deletes the subscription.
        f.gateway.add_subscription(active_sub(now));
        f.ingress
            .handle_event(sub_event("evt_1", "customer.subscription.created", now - 50))
            .await
            .unwrap();

        f.gateway.clear_subscriptions("cus_1");
        let mut deleted = active_sub(now);
        deleted.status = ProviderStatus::Canceled;
        deleted.current_period_end = Some(now - 10);
        deleted.canceled_at = Some(now - 10);
        f.gateway.add_subscription(deleted);

        f.ingress
            .handle_event(sub_event("evt_2", "customer.subscription.deleted", now - 5))
            .await
            .unwrap();
        let after_delete = f.store.get(&f.profile_id).await.unwrap().unwrap();
        assert_eq!(after_delete.status, AccessStatus::Cancelled);

        // A stale Updated event from before the deletion arrives late.
        let outcome = f
            .ingress
            .handle_event(sub_event("evt_3", "customer.subscription.updated", now - 40))
            .await
            .unwrap();
        assert_eq!(outcome, IngressOutcome::Stale);

        let final_state = f.store.get(&f.profile_id).await.unwrap().unwrap();
        assert_eq!(final_state.status, AccessStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_deleted_for_unknown_customer_is_noop() {
        let f = fixture().await;
        let now = unix_now();
        let e = event(
            "evt_1",
            "customer.subscription.deleted",
            now,
            serde_json::json!({ "customer": "cus_nobody" }),
        );
        let outcome = f.ingress.handle_event(e).await.unwrap();
        assert_eq!(outcome, IngressOutcome::UnknownCustomer);
    }

    #[tokio::test]
    async fn test_invoice_failed_never_revokes_access() {
        let f = fixture().await;
        let now = unix_now();
        f.gateway.add_subscription(active_sub(now));
        f.ingress
            .handle_event(sub_event("evt_1", "customer.subscription.created", now - 10))
            .await
            .unwrap();

        let outcome = f
            .ingress
            .handle_event(sub_event("evt_2", "invoice.payment_failed", now))
            .await
            .unwrap();
        assert_eq!(outcome, IngressOutcome::Acknowledged);

        let profile = f.store.get(&f.profile_id).await.unwrap().unwrap();
        assert_eq!(profile.status, AccessStatus::Active);
        assert!(f
            .sink
            .sent()
            .iter()
            .any(|n| matches!(n, Notification::PaymentFailed { .. })));
    }

    #[tokio::test]
    async fn test_checkout_links_profile_by_email() {
        let f = fixture().await;
        let now = unix_now();

        // A second profile with no customer link yet.
        let unlinked = Profile::new("auth0|u2", "u2@example.com");
        let unlinked_id = unlinked.id.clone();
        f.store.insert(&unlinked).await.unwrap();

        f.gateway.add_subscription(ProviderSubscription {
            customer_id: "cus_2".to_string(),
            ..active_sub(now)
        });

        let e = event(
            "evt_1",
            "checkout.session.completed",
            now,
            serde_json::json!({
                "customer": "cus_2",
                "customer_details": { "email": "u2@example.com" },
            }),
        );
        let outcome = f.ingress.handle_event(e).await.unwrap();
        assert!(matches!(outcome, IngressOutcome::Reconciled { changed: true }));

        let linked = f.store.get(&unlinked_id).await.unwrap().unwrap();
        assert_eq!(linked.payment_customer_id.as_deref(), Some("cus_2"));
        assert_eq!(linked.status, AccessStatus::Active);
    }

    #[tokio::test]
    async fn test_unrecognized_event_is_ignored_and_not_marked() {
        let f = fixture().await;
        let e = event(
            "evt_1",
            "customer.updated",
            unix_now(),
            serde_json::json!({ "customer": "cus_1" }),
        );
        assert_eq!(f.ingress.handle_event(e).await.unwrap(), IngressOutcome::Ignored);
        assert!(!f.store.is_event_processed("evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn test_process_rejects_bad_signature() {
        let f = fixture().await;
        let body = br#"{"id":"evt_1","type":"invoice.paid","created":1,"data":{"object":{}}}"#;
        let err = f.ingress.process(body, "t=1,v1=deadbeef").await.unwrap_err();
        assert!(matches!(err, PaygateError::Validation(_)));
    }

    #[tokio::test]
    async fn test_ack_does_not_wait_on_provider() {
        let f = fixture().await;
        let now = unix_now();
        f.gateway.add_subscription(active_sub(now));
        f.gateway.set_list_delay_ms(1_500);

        let (body, header) = signed(&sub_event("evt_1", "customer.subscription.created", now));
        let started = std::time::Instant::now();
        let outcome = f.ingress.process(&body, &header).await.unwrap();
        assert_eq!(outcome, IngressOutcome::Enqueued);
        assert!(
            started.elapsed() < std::time::Duration::from_millis(500),
            "ack blocked on the provider pull: {:?}",
            started.elapsed()
        );

        // The deferred pull still lands.
        f.ingress.wait_idle().await;
        let profile = f.store.get(&f.profile_id).await.unwrap().unwrap();
        assert_eq!(profile.status, AccessStatus::Active);
    }

    #[tokio::test]
    async fn test_lane_preserves_per_customer_order() {
        let f = fixture().await;
        let now = unix_now();
        f.gateway.add_subscription(active_sub(now));
        f.gateway.set_list_delay_ms(50);

        // Accept a fresh event, then an older redelivery, before the lane
        // has worked either. The lane must process them in acceptance order
        // so the older one is skipped as stale instead of re-pulled.
        let (body, header) = signed(&sub_event("evt_new", "customer.subscription.updated", now));
        f.ingress.process(&body, &header).await.unwrap();
        let (body, header) =
            signed(&sub_event("evt_old", "customer.subscription.updated", now - 40));
        f.ingress.process(&body, &header).await.unwrap();

        f.ingress.wait_idle().await;
        assert_eq!(f.gateway.list_calls(), 1);
        assert!(f.store.is_event_processed("evt_old").await.unwrap());
    }

    #[tokio::test]
    async fn test_lane_retries_transient_provider_failure() {
        let f = fixture().await;
        let now = unix_now();
        f.gateway.add_subscription(active_sub(now));
        f.gateway.set_failing(true);

        let (body, header) = signed(&sub_event("evt_1", "customer.subscription.created", now));
        assert_eq!(
            f.ingress.process(&body, &header).await.unwrap(),
            IngressOutcome::Enqueued
        );

        // Provider recovers before the lane's first retry fires.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        f.gateway.set_failing(false);

        f.ingress.wait_idle().await;
        let profile = f.store.get(&f.profile_id).await.unwrap().unwrap();
        assert_eq!(profile.status, AccessStatus::Active);
    }

    #[tokio::test]
    async fn test_duplicate_accepted_before_processing_is_worked_once() {
        let f = fixture().await;
        let now = unix_now();
        f.gateway.add_subscription(active_sub(now));
        f.gateway.set_list_delay_ms(50);

        // Redelivery lands while the first copy is still queued; the ack-time
        // dedup cannot see it yet, so the lane-side dedup must.
        let (body, header) = signed(&sub_event("evt_1", "customer.subscription.created", now));
        f.ingress.process(&body, &header).await.unwrap();
        f.ingress.process(&body, &header).await.unwrap();

        f.ingress.wait_idle().await;
        assert_eq!(f.gateway.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_change_listener_fires_on_state_change() {
        let f = fixture().await;
        let now = unix_now();
        f.gateway.add_subscription(active_sub(now));

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        f.ingress.set_change_listener(move |profile_id| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.lock().unwrap().push(profile_id);
            })
        });

        let (body, header) = signed(&sub_event("evt_1", "customer.subscription.created", now));
        f.ingress.process(&body, &header).await.unwrap();
        f.ingress.wait_idle().await;
        assert_eq!(seen.lock().unwrap().as_slice(), [f.profile_id.clone()]);

        // A no-change pass stays silent.
        let (body, header) = signed(&sub_event("evt_2", "customer.subscription.updated", now + 1));
        f.ingress.process(&body, &header).await.unwrap();
        f.ingress.wait_idle().await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
