//! End-to-end tests through the HTTP surface: webhook deliveries move
//! subscription state, the status endpoint reflects it, and the write routes
//! enforce their preconditions.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use paygate::gateway::{MockGateway, ProviderStatus, ProviderSubscription};
use paygate::notify::TracingSink;
use paygate::offer::memory::InMemoryOfferStore;
use paygate::profile::memory::InMemoryProfileStore;
use paygate::profile::{Profile, ProfileStore};
use paygate::time::{days, unix_now};
use paygate::webhook::sign_payload;
use paygate::{ConfigBuilder, Identity, Paygate, ReauthProof};
use secrecy::SecretString;
use std::sync::Arc;
use tower::ServiceExt;

const WEBHOOK_SECRET: &str = "whsec_test_secret";

type App = Paygate<InMemoryProfileStore, MockGateway, TracingSink, InMemoryOfferStore>;

struct Harness {
    router: Router,
    app: Arc<App>,
    store: InMemoryProfileStore,
    gateway: MockGateway,
    profile_id: String,
    admin_id: String,
}

async fn harness() -> Harness {
    let store = InMemoryProfileStore::new();
    let gateway = MockGateway::new();

    let mut profile = Profile::new("auth0|user", "user@example.com");
    profile.payment_customer_id = Some("cus_1".to_string());
    let profile_id = profile.id.clone();
    store.insert(&profile).await.unwrap();

    let mut admin = Profile::new("auth0|admin", "admin@example.com");
    admin.is_admin = true;
    let admin_id = admin.id.clone();
    store.insert(&admin).await.unwrap();

    let config = ConfigBuilder::new().build();
    let app = Arc::new(Paygate::new(
        config,
        Arc::new(store.clone()),
        Arc::new(gateway.clone()),
        Arc::new(TracingSink),
        InMemoryOfferStore::new(),
        SecretString::new(WEBHOOK_SECRET.into()),
    ));

    Harness {
        router: paygate::router(Arc::clone(&app)),
        app,
        store,
        gateway,
        profile_id,
        admin_id,
    }
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

fn webhook_body(event_id: &str, event_type: &str, created: u64) -> Vec<u8> {
    serde_json::json!({
        "id": event_id,
        "type": event_type,
        "created": created,
        "data": { "object": { "customer": "cus_1" } },
    })
    .to_string()
    .into_bytes()
}

// Delivers the event and drains the ingress queue so assertions see the
// deferred reconciliation's effect.
async fn deliver_webhook(h: &Harness, body: Vec<u8>) -> StatusCode {
    let signature = sign_payload(WEBHOOK_SECRET, &body, unix_now() as i64);
    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/payments")
                .header("stripe-signature", signature)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    h.app.ingress.wait_idle().await;
    response.status()
}

async fn get_status(router: &Router, profile_id: &str) -> serde_json::Value {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/subscription/status")
                .extension(Identity {
                    profile_id: profile_id.to_string(),
                })
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn post_authed(
    router: &Router,
    uri: &str,
    profile_id: &str,
    body: Option<serde_json::Value>,
    reauth: bool,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .extension(Identity {
            profile_id: profile_id.to_string(),
        });
    if reauth {
        builder = builder.extension(ReauthProof);
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn status_requires_identity() {
    let h = harness().await;
    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/subscription/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn webhook_activates_access() {
    let h = harness().await;
    let now = unix_now();

    let before = get_status(&h.router, &h.profile_id).await;
    assert_eq!(before["has_access"], false);
    assert_eq!(before["can_start_trial"], true);
    assert_eq!(before["reason"], "no active subscription");

    h.gateway.add_subscription(active_sub(now));
    let status = deliver_webhook(
        &h,
        webhook_body("evt_1", "customer.subscription.created", now),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let after = get_status(&h.router, &h.profile_id).await;
    assert_eq!(after["has_access"], true);
    assert_eq!(after["status"], "active");
    assert_eq!(after["can_start_trial"], false);
    assert_eq!(after["reason"], "active subscription");
    assert_eq!(after["subscription_amount"], 15_000);
}

#[tokio::test]
async fn webhook_redelivery_is_acknowledged() {
    let h = harness().await;
    let now = unix_now();
    h.gateway.add_subscription(active_sub(now));

    let body = webhook_body("evt_1", "customer.subscription.created", now);
    assert_eq!(deliver_webhook(&h, body.clone()).await, StatusCode::OK);
    assert_eq!(deliver_webhook(&h, body).await, StatusCode::OK);
    assert_eq!(h.gateway.list_calls(), 1);
}

#[tokio::test]
async fn webhook_rejects_bad_signature() {
    let h = harness().await;
    let body = webhook_body("evt_1", "invoice.paid", unix_now());
    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/payments")
                .header("stripe-signature", "t=1,v1=deadbeef")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn trial_starts_once() {
    let h = harness().await;

    let (status, body) =
        post_authed(&h.router, "/subscription/start-trial", &h.profile_id, None, false).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["has_access"], true);
    assert_eq!(body["trial_used"], true);

    let (status, _) =
        post_authed(&h.router, "/subscription/start-trial", &h.profile_id, None, false).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn cancel_requires_reauth_and_keeps_access() {
    let h = harness().await;
    let now = unix_now();
    h.gateway.add_subscription(active_sub(now));
    deliver_webhook(
        &h,
        webhook_body("evt_1", "customer.subscription.created", now),
    )
    .await;

    // Without re-authentication evidence.
    let (status, _) =
        post_authed(&h.router, "/subscription/cancel", &h.profile_id, None, false).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // With it: scheduled at period end, access retained.
    let (status, body) =
        post_authed(&h.router, "/subscription/cancel", &h.profile_id, None, true).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["has_access"], true);
    assert_eq!(body["auto_renew"], false);
    assert!(body["cancelled_at"].is_u64());

    // Change of heart before the period ends.
    let (status, body) = post_authed(
        &h.router,
        "/subscription/toggle-autorenew",
        &h.profile_id,
        Some(serde_json::json!({ "autoRenew": true })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["auto_renew"], true);

    // Repeating the request is a no-op, not an error.
    let (status, body) = post_authed(
        &h.router,
        "/subscription/toggle-autorenew",
        &h.profile_id,
        Some(serde_json::json!({ "autoRenew": true })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["auto_renew"], true);
}

#[tokio::test]
async fn force_sync_reflects_provider_change() {
    let h = harness().await;
    let now = unix_now();
    h.gateway.add_subscription(active_sub(now));

    let (status, body) =
        post_authed(&h.router, "/subscription/force-sync", &h.profile_id, None, false).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["changed"], true);
    assert_eq!(body["profile"]["has_access"], true);

    // Nothing moved upstream; a second sync is a no-op.
    let (_, body) =
        post_authed(&h.router, "/subscription/force-sync", &h.profile_id, None, false).await;
    assert_eq!(body["changed"], false);
}

#[tokio::test]
async fn offer_flow_store_accept_conflict() {
    let h = harness().await;
    let now = unix_now();
    h.gateway.add_subscription(active_sub(now));
    post_authed(&h.router, "/subscription/force-sync", &h.profile_id, None, false).await;

    let (status, offer) = post_authed(
        &h.router,
        "/subscription/custom-offer/reject",
        &h.profile_id,
        Some(serde_json::json!({
            "offerPrice": 10_500,
            "userInput": 12_000,
            "originalPrice": 15_000,
        })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(offer["discount_percent"], 30);
    assert_eq!(offer["payment_subscription_id"], "sub_1");
    let offer_id = offer["id"].as_str().unwrap().to_string();

    // The stored offer is retrievable, also when narrowed by subscription.
    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/subscription/custom-offer?subscriptionId=sub_1")
                .extension(Identity {
                    profile_id: h.profile_id.clone(),
                })
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let active: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(active["offer"]["id"], offer_id.as_str());

    let (status, accepted) = post_authed(
        &h.router,
        "/subscription/custom-offer/accept",
        &h.profile_id,
        Some(serde_json::json!({ "offerId": offer_id })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(accepted["accepted_at"].is_u64());

    let (status, _) = post_authed(
        &h.router,
        "/subscription/custom-offer/accept",
        &h.profile_id,
        Some(serde_json::json!({ "offerId": offer_id })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn invalid_offer_price_is_rejected() {
    let h = harness().await;
    // The offered price must undercut what the user proposed, which must
    // undercut the list price.
    let (status, _) = post_authed(
        &h.router,
        "/subscription/custom-offer/reject",
        &h.profile_id,
        Some(serde_json::json!({
            "offerPrice": 20_000,
            "userInput": 12_000,
            "originalPrice": 15_000,
        })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_authed(
        &h.router,
        "/subscription/custom-offer/reject",
        &h.profile_id,
        Some(serde_json::json!({
            "offerPrice": 10_000,
            "userInput": 16_000,
            "originalPrice": 15_000,
        })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn failed_discount_push_leaves_offer_open() {
    let h = harness().await;
    let now = unix_now();
    h.gateway.add_subscription(active_sub(now));
    post_authed(&h.router, "/subscription/force-sync", &h.profile_id, None, false).await;

    let (_, offer) = post_authed(
        &h.router,
        "/subscription/custom-offer/reject",
        &h.profile_id,
        Some(serde_json::json!({
            "offerPrice": 10_500,
            "userInput": 12_000,
            "originalPrice": 15_000,
        })),
        false,
    )
    .await;
    let offer_id = offer["id"].as_str().unwrap().to_string();

    // The provider is down when the user accepts; the offer must survive.
    h.gateway.set_failing(true);
    let (status, _) = post_authed(
        &h.router,
        "/subscription/custom-offer/accept",
        &h.profile_id,
        Some(serde_json::json!({ "offerId": offer_id })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // Retry once the provider recovers.
    h.gateway.set_failing(false);
    let (status, accepted) = post_authed(
        &h.router,
        "/subscription/custom-offer/accept",
        &h.profile_id,
        Some(serde_json::json!({ "offerId": offer_id })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(accepted["accepted_at"].is_u64());
}

#[tokio::test]
async fn accepting_someone_elses_offer_is_forbidden_and_harmless() {
    let h = harness().await;
    let now = unix_now();
    h.gateway.add_subscription(active_sub(now));
    post_authed(&h.router, "/subscription/force-sync", &h.profile_id, None, false).await;

    let (_, offer) = post_authed(
        &h.router,
        "/subscription/custom-offer/reject",
        &h.profile_id,
        Some(serde_json::json!({
            "offerPrice": 10_500,
            "userInput": 12_000,
            "originalPrice": 15_000,
        })),
        false,
    )
    .await;
    let offer_id = offer["id"].as_str().unwrap().to_string();

    // Another authenticated user who learned the id cannot burn the offer.
    let (status, _) = post_authed(
        &h.router,
        "/subscription/custom-offer/accept",
        &h.admin_id,
        Some(serde_json::json!({ "offerId": offer_id })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Still open for its owner.
    let (status, accepted) = post_authed(
        &h.router,
        "/subscription/custom-offer/accept",
        &h.profile_id,
        Some(serde_json::json!({ "offerId": offer_id })),
        false,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(accepted["accepted_at"].is_u64());
}

#[tokio::test]
async fn status_is_served_from_cached_decision() {
    let h = harness().await;
    let now = unix_now();
    h.gateway.add_subscription(active_sub(now));
    deliver_webhook(
        &h,
        webhook_body("evt_1", "customer.subscription.created", now),
    )
    .await;

    let first = get_status(&h.router, &h.profile_id).await;
    assert_eq!(first["has_access"], true);
    assert_eq!(first["subscription_amount"], 15_000);

    // Mutate the store behind the gate's back. The cached positive decision
    // keeps answering, proving the route reads no profile per request.
    let mut profile = h.store.get(&h.profile_id).await.unwrap().unwrap();
    profile.subscription_amount = Some(1);
    h.store.insert(&profile).await.unwrap();

    let second = get_status(&h.router, &h.profile_id).await;
    assert_eq!(second["has_access"], true);
    assert_eq!(second["subscription_amount"], 15_000);
}

#[tokio::test]
async fn timer_writes_are_admin_only() {
    let h = harness().await;

    // Anyone can read.
    let response = h
        .router
        .clone()
        .oneshot(Request::builder().uri("/admin/timer").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let update = serde_json::json!({ "duration_hours": 24, "message": "Last chance" });

    let request = Request::builder()
        .method("PUT")
        .uri("/admin/timer")
        .header("content-type", "application/json")
        .extension(Identity {
            profile_id: h.profile_id.clone(),
        })
        .body(Body::from(update.to_string()))
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let request = Request::builder()
        .method("PUT")
        .uri("/admin/timer")
        .header("content-type", "application/json")
        .extension(Identity {
            profile_id: h.admin_id.clone(),
        })
        .body(Body::from(update.to_string()))
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let settings: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(settings["message"], "Last chance");
    assert_eq!(settings["duration_hours"], 24);
}

#[tokio::test]
async fn admin_always_has_access() {
    let h = harness().await;
    let status = get_status(&h.router, &h.admin_id).await;
    assert_eq!(status["has_access"], true);
    assert_eq!(status["reason"], "admin");
}

#[tokio::test]
async fn grace_period_lapses_to_cancelled() {
    let h = harness().await;
    let now = unix_now();

    // Canceled upstream but paid through a future date: access retained.
    let mut sub = active_sub(now);
    sub.status = ProviderStatus::Canceled;
    sub.current_period_end = Some(now + days(5));
    sub.canceled_at = Some(now - days(1));
    h.gateway.add_subscription(sub);
    deliver_webhook(
        &h,
        webhook_body("evt_1", "customer.subscription.updated", now),
    )
    .await;

    let status = get_status(&h.router, &h.profile_id).await;
    assert_eq!(status["has_access"], true);
    assert_eq!(status["auto_renew"], false);

    // The period passes unrenewed.
    h.gateway.clear_subscriptions("cus_1");
    let mut lapsed = active_sub(now);
    lapsed.status = ProviderStatus::Canceled;
    lapsed.current_period_end = Some(now - 10);
    lapsed.canceled_at = Some(now - days(1));
    h.gateway.add_subscription(lapsed);
    deliver_webhook(
        &h,
        webhook_body("evt_2", "customer.subscription.deleted", now + 1),
    )
    .await;

    let status = get_status(&h.router, &h.profile_id).await;
    assert_eq!(status["has_access"], false);
    assert_eq!(status["status"], "cancelled");

    let stored = h.store.get(&h.profile_id).await.unwrap().unwrap();
    assert_eq!(stored.cancelled_at, Some(now - days(1)));
}
