//! Payment provider gateway.
//!
//! [`client`] defines the trait and wire types, [`mock`] the scriptable test
//! double. The production Stripe-backed client lives in [`live`], behind the
//! `live-stripe` feature so the default build carries no provider SDK.

pub mod client;
pub mod mock;

#[cfg(feature = "live-stripe")]
pub mod live;

pub use client::{
    CheckoutRecord, DiscountRequest, PaymentGateway, ProviderDiscount, ProviderStatus,
    ProviderSubscription,
};
pub use mock::MockGateway;

#[cfg(feature = "live-stripe")]
pub use live::LiveStripeGateway;

use crate::config::GatewayConfig;
use crate::error::{PaygateError, Result};

/// Run `op` with a per-attempt timeout and bounded retries.
///
/// Only retryable errors are retried; everything else surfaces immediately.
/// Delays grow exponentially from `base_delay_ms` with jitter, capped at
/// `max_delay_ms`.
#[cfg_attr(not(feature = "live-stripe"), allow(dead_code))]
pub(crate) async fn with_retry<T, F, Fut>(config: &GatewayConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let timeout = std::time::Duration::from_secs(config.timeout_seconds);
    let mut attempt = 0u32;

    loop {
        let result = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(PaygateError::upstream_unavailable(format!(
                "payment provider request timed out after {}s",
                config.timeout_seconds
            ))),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < config.max_retries => {
                let delay =
                    client::backoff_delay(attempt, config.base_delay_ms, config.max_delay_ms);
                tracing::warn!(
                    target: "paygate::gateway",
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying payment provider call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
