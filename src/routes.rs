//! Axum router for the subscription surface.
//!
//! The embedding application authenticates requests and injects an
//! [`Identity`] extension; these routes never see credentials. The `cancel`
//! route additionally requires a [`ReauthProof`] extension, inserted by the
//! embedding app after it has re-verified the user.

use crate::config::PaygateConfig;
use crate::error::{PaygateError, Result};
use crate::gate::{AccessDecision, AccessGate};
use crate::gateway::client::{DiscountRequest, PaymentGateway};
use crate::notify::NotificationSink;
use crate::offer::{DiscountOffer, OfferError, OfferManager, OfferStore, RejectedNegotiation};
use crate::profile::{Profile, ProfileStore};
use crate::reconcile::ReconcileEngine;
use crate::timer::{CountdownTimer, TimerSettings, TimerUpdate};
use crate::trial::TrialManager;
use crate::webhook::{SignatureVerifier, WebhookIngress};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Authenticated caller, injected by the embedding application.
#[derive(Debug, Clone)]
pub struct Identity {
    pub profile_id: String,
}

/// Marker that the embedding app re-verified the user for this request.
#[derive(Debug, Clone, Copy)]
pub struct ReauthProof;

/// Everything the routes need, wired together.
pub struct Paygate<S, G, N, O> {
    pub config: PaygateConfig,
    pub store: Arc<S>,
    pub engine: Arc<ReconcileEngine<S, G, N>>,
    pub gate: Arc<AccessGate<S, G, N>>,
    pub trial: TrialManager<S, G, N>,
    pub offers: OfferManager<O>,
    pub ingress: WebhookIngress<S, G, N>,
    pub timer: CountdownTimer,
    gateway: Arc<G>,
}

impl<S, G, N, O> Paygate<S, G, N, O>
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
    O: OfferStore + 'static,
{
    pub fn new(
        config: PaygateConfig,
        store: Arc<S>,
        gateway: Arc<G>,
        sink: Arc<N>,
        offer_store: O,
        webhook_secret: SecretString,
    ) -> Self {
        let engine = Arc::new(ReconcileEngine::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&sink),
            config.trial.clone(),
        ));
        let gate = Arc::new(AccessGate::new(
            Arc::clone(&engine),
            Arc::clone(&store),
            &config.gate,
        ));
        let trial = TrialManager::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&sink),
            config.trial.clone(),
        );
        let offers = OfferManager::new(offer_store, config.offers.clone());
        let ingress = WebhookIngress::new(
            SignatureVerifier::new(webhook_secret, config.webhook.signature_tolerance_seconds),
            Arc::clone(&engine),
            Arc::clone(&store),
            sink,
        );
        // A deferred webhook reconciliation that moved state makes any
        // cached decision for that profile wrong; drop it.
        {
            let gate = Arc::clone(&gate);
            ingress.set_change_listener(move |profile_id| {
                let gate = Arc::clone(&gate);
                Box::pin(async move {
                    gate.invalidate(&profile_id).await;
                }) as Pin<Box<dyn Future<Output = ()> + Send>>
            });
        }
        Self {
            config,
            store,
            engine,
            gate,
            trial,
            offers,
            ingress,
            timer: CountdownTimer::default(),
            gateway,
        }
    }
}

/// Build the router. Mount under the embedding app's authenticated scope.
pub fn router<S, G, N, O>(app: Arc<Paygate<S, G, N, O>>) -> Router
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
    O: OfferStore + 'static,
{
    Router::new()
        .route("/webhooks/payments", post(handle_webhook))
        .route("/subscription/status", get(subscription_status))
        .route("/subscription/force-sync", post(force_sync))
        .route("/subscription/start-trial", post(start_trial))
        .route("/subscription/cancel", post(cancel_subscription))
        .route("/subscription/toggle-autorenew", post(toggle_autorenew))
        .route("/subscription/custom-offer", get(get_offer))
        .route("/subscription/custom-offer/reject", post(reject_offer))
        .route("/subscription/custom-offer/accept", post(accept_offer))
        .route("/admin/timer", get(read_timer).put(write_timer))
        .with_state(app)
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    has_access: bool,
    status: String,
    can_start_trial: bool,
    /// Short human-readable explanation of the decision.
    reason: String,
    subscription_end: Option<u64>,
    auto_renew: bool,
    cancelled_at: Option<u64>,
    trial_used: bool,
    trial_end: Option<u64>,
    subscription_amount: Option<i64>,
    original_amount: Option<i64>,
    discount_percent: Option<u8>,
    discount_name: Option<String>,
}

impl StatusResponse {
    fn new(profile: &Profile, has_access: bool) -> Self {
        Self {
            has_access,
            status: profile.status.to_string(),
            can_start_trial: profile.can_start_trial(),
            reason: reason_for(profile.is_admin, has_access).to_string(),
            subscription_end: profile.subscription_end,
            auto_renew: profile.auto_renew,
            cancelled_at: profile.cancelled_at,
            trial_used: profile.trial_used,
            trial_end: profile.trial_end,
            subscription_amount: profile.subscription_amount,
            original_amount: profile.original_amount,
            discount_percent: profile.discount_percent,
            discount_name: profile.discount_name.clone(),
        }
    }

    /// A decision carries the whole snapshot, so a cached one answers the
    /// status route without touching the store.
    fn from_decision(decision: &AccessDecision) -> Self {
        Self {
            has_access: decision.allowed,
            status: decision.status.to_string(),
            can_start_trial: decision.can_start_trial,
            reason: reason_for(decision.is_admin, decision.allowed).to_string(),
            subscription_end: decision.subscription_end,
            auto_renew: decision.auto_renew,
            cancelled_at: decision.cancelled_at,
            trial_used: decision.trial_used,
            trial_end: decision.trial_end,
            subscription_amount: decision.subscription_amount,
            original_amount: decision.original_amount,
            discount_percent: decision.discount_percent,
            discount_name: decision.discount_name.clone(),
        }
    }
}

fn reason_for(is_admin: bool, has_access: bool) -> &'static str {
    if is_admin {
        "admin"
    } else if has_access {
        "active subscription"
    } else {
        "no active subscription"
    }
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(default, alias = "forceRefresh")]
    force_refresh: bool,
}

fn require_identity(identity: Option<Extension<Identity>>) -> Result<Identity> {
    identity
        .map(|Extension(identity)| identity)
        .ok_or_else(|| PaygateError::authentication_required("sign in required"))
}

async fn handle_webhook<S, G, N, O>(
    State(app): State<Arc<Paygate<S, G, N, O>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
    O: OfferStore + 'static,
{
    let dev = app.config.dev.expose_error_detail;
    let Some(signature) = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
    else {
        return PaygateError::validation("missing signature header").into_response_with_mode(dev);
    };

    // The ack never waits on reconciliation; the event is verified,
    // deduplicated, and queued on its customer's lane.
    match app.ingress.process(&body, signature).await {
        Ok(_) => Json(serde_json::json!({ "received": true })).into_response(),
        Err(err) => err.into_response_with_mode(dev),
    }
}

async fn subscription_status<S, G, N, O>(
    State(app): State<Arc<Paygate<S, G, N, O>>>,
    identity: Option<Extension<Identity>>,
    Query(query): Query<StatusQuery>,
) -> Response
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
    O: OfferStore + 'static,
{
    let dev = app.config.dev.expose_error_detail;
    let result = async {
        let identity = require_identity(identity)?;
        let decision = app
            .gate
            .check_access(&identity.profile_id, query.force_refresh)
            .await?;
        Ok::<_, PaygateError>(Json(StatusResponse::from_decision(&decision)))
    }
    .await;

    match result {
        Ok(json) => json.into_response(),
        Err(err) => err.into_response_with_mode(dev),
    }
}

async fn force_sync<S, G, N, O>(
    State(app): State<Arc<Paygate<S, G, N, O>>>,
    identity: Option<Extension<Identity>>,
) -> Response
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
    O: OfferStore + 'static,
{
    let dev = app.config.dev.expose_error_detail;
    let result = async {
        let identity = require_identity(identity)?;
        let outcome = app.engine.reconcile_profile(&identity.profile_id).await?;
        app.gate.invalidate(&identity.profile_id).await;
        let profile = app
            .store
            .get(&identity.profile_id)
            .await?
            .ok_or_else(|| PaygateError::not_found("profile"))?;
        let has_access = profile.has_access_at(crate::time::unix_now());
        Ok::<_, PaygateError>(Json(serde_json::json!({
            "changed": outcome.changed,
            "profile": StatusResponse::new(&profile, has_access),
        })))
    }
    .await;

    match result {
        Ok(json) => json.into_response(),
        Err(err) => err.into_response_with_mode(dev),
    }
}

async fn start_trial<S, G, N, O>(
    State(app): State<Arc<Paygate<S, G, N, O>>>,
    identity: Option<Extension<Identity>>,
) -> Response
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
    O: OfferStore + 'static,
{
    let dev = app.config.dev.expose_error_detail;
    let result = async {
        let identity = require_identity(identity)?;
        let profile = app.trial.start_trial(&identity.profile_id).await?;
        app.gate.invalidate(&identity.profile_id).await;
        Ok::<_, PaygateError>(Json(StatusResponse::new(&profile, true)))
    }
    .await;

    match result {
        Ok(json) => json.into_response(),
        Err(err) => err.into_response_with_mode(dev),
    }
}

async fn cancel_subscription<S, G, N, O>(
    State(app): State<Arc<Paygate<S, G, N, O>>>,
    identity: Option<Extension<Identity>>,
    reauth: Option<Extension<ReauthProof>>,
) -> Response
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
    O: OfferStore + 'static,
{
    let dev = app.config.dev.expose_error_detail;
    let result = async {
        let identity = require_identity(identity)?;
        if reauth.is_none() {
            return Err(PaygateError::authentication_required(
                "cancellation requires recent re-authentication",
            ));
        }
        let profile = app.trial.cancel_with_grace(&identity.profile_id).await?;
        app.gate.invalidate(&identity.profile_id).await;
        let has_access = profile.has_access_at(crate::time::unix_now());
        Ok::<_, PaygateError>(Json(StatusResponse::new(&profile, has_access)))
    }
    .await;

    match result {
        Ok(json) => json.into_response(),
        Err(err) => err.into_response_with_mode(dev),
    }
}

#[derive(Debug, Deserialize)]
struct ToggleAutoRenewRequest {
    #[serde(alias = "autoRenew")]
    auto_renew: bool,
}

async fn toggle_autorenew<S, G, N, O>(
    State(app): State<Arc<Paygate<S, G, N, O>>>,
    identity: Option<Extension<Identity>>,
    Json(request): Json<ToggleAutoRenewRequest>,
) -> Response
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
    O: OfferStore + 'static,
{
    let dev = app.config.dev.expose_error_detail;
    let result = async {
        let identity = require_identity(identity)?;
        let current = app
            .store
            .get(&identity.profile_id)
            .await?
            .ok_or_else(|| PaygateError::not_found("profile"))?;

        // Already in the requested state: report it without touching the
        // provider.
        let profile = if current.auto_renew == request.auto_renew {
            current
        } else if request.auto_renew {
            app.trial.reenable_auto_renew(&identity.profile_id).await?
        } else {
            app.trial.cancel_with_grace(&identity.profile_id).await?
        };
        app.gate.invalidate(&identity.profile_id).await;
        let has_access = profile.has_access_at(crate::time::unix_now());
        Ok::<_, PaygateError>(Json(StatusResponse::new(&profile, has_access)))
    }
    .await;

    match result {
        Ok(json) => json.into_response(),
        Err(err) => err.into_response_with_mode(dev),
    }
}

#[derive(Debug, Deserialize)]
struct OfferQuery {
    #[serde(default, alias = "subscriptionId")]
    subscription_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RejectOfferRequest {
    #[serde(alias = "offerPrice")]
    offer_price: i64,
    #[serde(alias = "userInput")]
    user_input: i64,
    #[serde(alias = "originalPrice")]
    original_price: i64,
}

async fn get_offer<S, G, N, O>(
    State(app): State<Arc<Paygate<S, G, N, O>>>,
    identity: Option<Extension<Identity>>,
    Query(query): Query<OfferQuery>,
) -> Response
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
    O: OfferStore + 'static,
{
    let dev = app.config.dev.expose_error_detail;
    let result = async {
        let identity = require_identity(identity)?;
        let offer = app
            .offers
            .active_offer(&identity.profile_id, query.subscription_id.as_deref())
            .await?;
        Ok::<_, PaygateError>(Json(serde_json::json!({ "offer": offer })))
    }
    .await;

    match result {
        Ok(json) => json.into_response(),
        Err(err) => err.into_response_with_mode(dev),
    }
}

async fn reject_offer<S, G, N, O>(
    State(app): State<Arc<Paygate<S, G, N, O>>>,
    identity: Option<Extension<Identity>>,
    Json(request): Json<RejectOfferRequest>,
) -> Response
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
    O: OfferStore + 'static,
{
    let dev = app.config.dev.expose_error_detail;
    let result = async {
        let identity = require_identity(identity)?;
        let profile = app
            .store
            .get(&identity.profile_id)
            .await?
            .ok_or_else(|| PaygateError::not_found("profile"))?;
        let offer = app
            .offers
            .record_rejected(RejectedNegotiation {
                profile_id: identity.profile_id.clone(),
                payment_subscription_id: profile.payment_subscription_id.clone(),
                original_price: request.original_price,
                user_input: request.user_input,
                offer_price: request.offer_price,
            })
            .await?;
        Ok::<_, PaygateError>(Json(offer))
    }
    .await;

    match result {
        Ok(json) => json.into_response(),
        Err(err) => err.into_response_with_mode(dev),
    }
}

#[derive(Debug, Deserialize)]
struct AcceptOfferRequest {
    #[serde(alias = "offerId")]
    offer_id: String,
}

async fn accept_offer<S, G, N, O>(
    State(app): State<Arc<Paygate<S, G, N, O>>>,
    identity: Option<Extension<Identity>>,
    Json(request): Json<AcceptOfferRequest>,
) -> Response
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
    O: OfferStore + 'static,
{
    let dev = app.config.dev.expose_error_detail;
    let result = async {
        let identity = require_identity(identity)?;
        let offer = app
            .offers
            .get(&request.offer_id)
            .await?
            .ok_or_else(|| PaygateError::not_found("offer"))?;
        if offer.profile_id != identity.profile_id {
            return Err(PaygateError::forbidden("offer belongs to another user"));
        }
        if offer.accepted_at.is_some() {
            return Err(OfferError::AlreadyAccepted.into());
        }
        if offer.is_expired_at(crate::time::unix_now()) {
            return Err(OfferError::Expired.into());
        }

        // Upstream first. A failed discount application leaves the offer
        // open, so the user can simply retry; only a successful push
        // consumes it. Two racing accepts both reach the provider, but the
        // second loses the atomic re-check inside `accept` and the coupon
        // application is idempotent upstream.
        apply_accepted_offer(&app, &identity.profile_id, &offer).await?;
        let offer = app.offers.accept(&request.offer_id).await?;
        app.gate.invalidate(&identity.profile_id).await;
        Ok::<_, PaygateError>(Json(offer))
    }
    .await;

    match result {
        Ok(json) => json.into_response(),
        Err(err) => err.into_response_with_mode(dev),
    }
}

/// Push the accepted discount upstream. The local snapshot is not touched
/// here; the provider's webhook confirms the change and the engine records
/// it from there.
async fn apply_accepted_offer<S, G, N, O>(
    app: &Paygate<S, G, N, O>,
    profile_id: &str,
    offer: &DiscountOffer,
) -> Result<()>
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
    O: OfferStore + 'static,
{
    let profile = app
        .store
        .get(profile_id)
        .await?
        .ok_or_else(|| PaygateError::not_found("profile"))?;
    let Some(subscription_id) = profile.payment_subscription_id.as_deref() else {
        return Err(PaygateError::conflict(
            "no provider subscription to discount",
        ));
    };

    app.gateway
        .apply_discount(
            subscription_id,
            DiscountRequest {
                percent: None,
                amount_off: Some(offer.original_price - offer.offer_price),
                name: "Retention offer".to_string(),
            },
        )
        .await?;
    Ok(())
}

async fn require_admin<S, G, N, O>(
    app: &Paygate<S, G, N, O>,
    identity: Option<Extension<Identity>>,
) -> Result<Profile>
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
    O: OfferStore + 'static,
{
    let identity = require_identity(identity)?;
    let profile = app
        .store
        .get(&identity.profile_id)
        .await?
        .ok_or_else(|| PaygateError::not_found("profile"))?;
    if !profile.is_admin {
        return Err(PaygateError::forbidden("admin required"));
    }
    Ok(profile)
}

async fn read_timer<S, G, N, O>(
    State(app): State<Arc<Paygate<S, G, N, O>>>,
) -> Json<TimerSettings>
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
    O: OfferStore + 'static,
{
    Json(app.timer.current())
}

async fn write_timer<S, G, N, O>(
    State(app): State<Arc<Paygate<S, G, N, O>>>,
    identity: Option<Extension<Identity>>,
    Json(update): Json<TimerUpdate>,
) -> Response
where
    S: ProfileStore + 'static,
    G: PaymentGateway + 'static,
    N: NotificationSink + 'static,
    O: OfferStore + 'static,
{
    let dev = app.config.dev.expose_error_detail;
    match require_admin(app.as_ref(), identity).await {
        Ok(_) => Json(app.timer.update(update)).into_response(),
        Err(err) => err.into_response_with_mode(dev),
    }
}
