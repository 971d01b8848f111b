//! Stripe-backed gateway implementation.
//!
//! Enabled with the `live-stripe` feature. Wraps the `async-stripe` client
//! with the shared timeout/retry policy and maps Stripe's models onto the
//! provider-neutral wire types.

use super::client::{
    CheckoutRecord, DiscountRequest, PaymentGateway, ProviderDiscount, ProviderStatus,
    ProviderSubscription,
};
use crate::config::GatewayConfig;
use crate::error::{PaygateError, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::str::FromStr;

/// Production gateway over the Stripe API.
pub struct LiveStripeGateway {
    client: stripe::Client,
    config: GatewayConfig,
}

impl LiveStripeGateway {
    /// Create a gateway. The key is validated for shape only; a wrong key
    /// surfaces as an authentication error on first use.
    pub fn new(api_key: SecretString, config: GatewayConfig) -> Result<Self> {
        let key = api_key.expose_secret();
        if !key.starts_with("sk_") && !key.starts_with("rk_") {
            return Err(PaygateError::validation(
                "payment provider API key must be a secret key",
            ));
        }
        Ok(Self {
            client: stripe::Client::new(key.to_string()),
            config,
        })
    }

    fn map_status(status: stripe::SubscriptionStatus) -> ProviderStatus {
        use stripe::SubscriptionStatus as S;
        match status {
            S::Active => ProviderStatus::Active,
            S::Trialing => ProviderStatus::Trialing,
            S::PastDue => ProviderStatus::PastDue,
            S::Canceled => ProviderStatus::Canceled,
            S::Incomplete => ProviderStatus::Incomplete,
            S::IncompleteExpired => ProviderStatus::IncompleteExpired,
            S::Unpaid => ProviderStatus::Unpaid,
            S::Paused => ProviderStatus::Paused,
        }
    }

    fn map_subscription(sub: &stripe::Subscription) -> ProviderSubscription {
        let item = sub.items.data.first();
        let price = item.and_then(|i| i.price.as_ref());

        let discount = sub.discount.as_ref().map(|d| ProviderDiscount {
            percent: d.coupon.percent_off.map(|p| p.round() as u8),
            amount_off: d.coupon.amount_off,
            name: d.coupon.name.clone(),
        });

        ProviderSubscription {
            id: sub.id.to_string(),
            customer_id: sub.customer.id().to_string(),
            status: Self::map_status(sub.status),
            created: sub.created.max(0) as u64,
            current_period_start: u64::try_from(sub.current_period_start).ok(),
            current_period_end: u64::try_from(sub.current_period_end).ok(),
            item_period_end: None,
            price_id: price.map(|p| p.id.to_string()),
            unit_amount: price.and_then(|p| p.unit_amount),
            discount,
            cancel_at_period_end: sub.cancel_at_period_end,
            canceled_at: sub.canceled_at.and_then(|t| u64::try_from(t).ok()),
        }
    }

    fn map_stripe_error(err: stripe::StripeError) -> PaygateError {
        match &err {
            stripe::StripeError::Stripe(request_err) => {
                use stripe::ErrorType;
                match request_err.error_type {
                    ErrorType::Authentication => PaygateError::authentication_required(
                        "payment provider rejected the API key",
                    ),
                    ErrorType::RateLimit => {
                        PaygateError::upstream_unavailable("payment provider rate limit")
                    }
                    ErrorType::InvalidRequest => {
                        PaygateError::validation(format!("payment provider: {request_err}"))
                    }
                    _ => PaygateError::upstream_unavailable(format!("payment provider: {err}")),
                }
            }
            stripe::StripeError::Timeout => {
                PaygateError::upstream_unavailable("payment provider timeout")
            }
            _ => PaygateError::upstream_unavailable(format!("payment provider: {err}")),
        }
    }
}

#[async_trait]
impl PaymentGateway for LiveStripeGateway {
    async fn list_subscriptions(&self, customer_id: &str) -> Result<Vec<ProviderSubscription>> {
        let customer = stripe::CustomerId::from_str(customer_id)
            .map_err(|_| PaygateError::validation("malformed customer id"))?;

        let subs = super::with_retry(&self.config, || {
            let customer = customer.clone();
            async move {
                let mut params = stripe::ListSubscriptions::new();
                params.customer = Some(customer);
                params.status = Some(stripe::SubscriptionStatusFilter::All);
                params.limit = Some(u64::from(self.config.page_size));
                stripe::Subscription::list(&self.client, &params)
                    .await
                    .map_err(Self::map_stripe_error)
            }
        })
        .await?;

        let mut mapped: Vec<ProviderSubscription> =
            subs.data.iter().map(Self::map_subscription).collect();
        mapped.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(mapped)
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> Result<ProviderSubscription> {
        let id = stripe::SubscriptionId::from_str(subscription_id)
            .map_err(|_| PaygateError::validation("malformed subscription id"))?;

        let sub = super::with_retry(&self.config, || {
            let id = id.clone();
            async move {
                let mut params = stripe::UpdateSubscription::new();
                params.cancel_at_period_end = Some(cancel);
                stripe::Subscription::update(&self.client, &id, params)
                    .await
                    .map_err(Self::map_stripe_error)
            }
        })
        .await?;

        Ok(Self::map_subscription(&sub))
    }

    async fn apply_discount(
        &self,
        subscription_id: &str,
        discount: DiscountRequest,
    ) -> Result<ProviderSubscription> {
        let id = stripe::SubscriptionId::from_str(subscription_id)
            .map_err(|_| PaygateError::validation("malformed subscription id"))?;

        // A coupon is minted per application; retention discounts are
        // user-specific and open-ended until the subscription changes again.
        let coupon = super::with_retry(&self.config, || {
            let discount = discount.clone();
            async move {
                let mut params = stripe::CreateCoupon::new();
                params.percent_off = discount.percent.map(f64::from);
                params.amount_off = discount.amount_off;
                params.duration = Some(stripe::CouponDuration::Forever);
                params.name = Some(&discount.name);
                stripe::Coupon::create(&self.client, params)
                    .await
                    .map_err(Self::map_stripe_error)
            }
        })
        .await?;

        let sub = super::with_retry(&self.config, || {
            let id = id.clone();
            let coupon_id = coupon.id.to_string();
            async move {
                let mut params = stripe::UpdateSubscription::new();
                params.coupon = Some(coupon_id);
                stripe::Subscription::update(&self.client, &id, params)
                    .await
                    .map_err(Self::map_stripe_error)
            }
        })
        .await?;

        Ok(Self::map_subscription(&sub))
    }

    async fn latest_completed_checkout(&self, customer_id: &str) -> Result<Option<CheckoutRecord>> {
        let customer = stripe::CustomerId::from_str(customer_id)
            .map_err(|_| PaygateError::validation("malformed customer id"))?;

        let sessions = super::with_retry(&self.config, || {
            let customer = customer.clone();
            async move {
                let mut params = stripe::ListCheckoutSessions::new();
                params.customer = Some(customer);
                params.limit = Some(u64::from(self.config.page_size));
                stripe::CheckoutSession::list(&self.client, &params)
                    .await
                    .map_err(Self::map_stripe_error)
            }
        })
        .await?;

        let latest = sessions
            .data
            .into_iter()
            .filter(|s| {
                matches!(
                    s.status,
                    Some(stripe::CheckoutSessionStatus::Complete)
                )
            })
            .max_by_key(|s| s.created.unwrap_or(0));

        Ok(latest.map(|s| CheckoutRecord {
            id: s.id.to_string(),
            customer_id: customer_id.to_string(),
            completed_at: s.created.unwrap_or(0).max(0) as u64,
            amount_total: s.amount_total,
        }))
    }
}
