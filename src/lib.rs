//! Paygate - subscription-state reconciliation and access control
//!
//! Paygate keeps one question answerable at all times: does this user have
//! paid access right now? It reconciles three independently-evolving sources
//! of truth - webhook-pushed payment events, on-demand payment provider
//! queries, and locally cached profile state - and gates protected resources
//! on the result.
//!
//! # Features
//!
//! - **Reconciliation**: single-flight, atomically committed pulls of
//!   provider truth with a deterministic precedence order
//! - **Webhooks**: HMAC-SHA256 verification, idempotent delivery handling,
//!   stale-event rejection
//! - **Access gate**: cached, rate-capped request-time checks with a global
//!   circuit breaker and default-deny semantics
//! - **Trials and grace periods**: one-shot trials, cancel-at-period-end
//!   with reversible auto-renew
//! - **Retention offers**: time-boxed per-user discount offers
//! - **HTTP**: an embeddable Axum router for the whole surface
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use paygate::{ConfigBuilder, Paygate};
//! use paygate::gateway::MockGateway;
//! use paygate::notify::TracingSink;
//! use paygate::offer::memory::InMemoryOfferStore;
//! use paygate::profile::memory::InMemoryProfileStore;
//! use secrecy::SecretString;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     paygate::init_tracing();
//!
//!     let config = ConfigBuilder::new().from_env().build();
//!     let app = Arc::new(Paygate::new(
//!         config,
//!         Arc::new(InMemoryProfileStore::new()),
//!         Arc::new(MockGateway::new()),
//!         Arc::new(TracingSink),
//!         InMemoryOfferStore::new(),
//!         SecretString::new("whsec_dev".into()),
//!     ));
//!
//!     let router = paygate::router(app);
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, router).await.unwrap();
//! }
//! ```

pub mod config;
pub mod error;
pub mod gate;
pub mod gateway;
pub mod notify;
pub mod offer;
pub mod profile;
pub mod reconcile;
pub mod routes;
pub mod time;
pub mod timer;
pub mod trial;
pub mod webhook;

// Re-exports for public API
pub use config::{ConfigBuilder, PaygateConfig};
pub use error::{PaygateError, Result};
pub use gate::{AccessDecision, AccessGate, DecisionSource};
pub use profile::{AccessStatus, Profile, ProfileStore, SubscriptionSnapshot};
pub use reconcile::{ReconcileEngine, ReconcileOutcome};
pub use routes::{router, Identity, Paygate, ReauthProof};
pub use trial::TrialManager;
pub use webhook::{IngressOutcome, WebhookIngress};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging with sensible defaults.
///
/// Call once, early in `main()`.
///
/// # Environment Variables
///
/// - `RUST_LOG`: log level filter (e.g. "info", "paygate=debug")
/// - `PAYGATE_LOG_JSON`: set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("PAYGATE_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
