//! User-facing notification sink.
//!
//! Status-change notifications are fire-and-forget: a delivery failure must
//! never fail the operation that triggered it, so the dispatch helper logs
//! and swallows sink errors.

use crate::error::Result;
use async_trait::async_trait;

/// What happened to a profile's subscription state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    SubscriptionActivated {
        profile_id: String,
        subscription_end: Option<u64>,
    },
    SubscriptionCancelled {
        profile_id: String,
        access_until: Option<u64>,
    },
    SubscriptionExpired {
        profile_id: String,
    },
    TrialStarted {
        profile_id: String,
        trial_end: u64,
    },
    PaymentFailed {
        profile_id: String,
    },
}

/// Delivery interface implemented by the embedding application (email, in-app
/// inbox, push).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

/// Send a notification, logging any failure instead of propagating it.
pub async fn dispatch(sink: &dyn NotificationSink, notification: Notification) {
    if let Err(err) = sink.notify(notification).await {
        tracing::warn!(
            target: "paygate::notify",
            error = %err,
            "Notification delivery failed; continuing"
        );
    }
}

/// Default sink that only logs.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn notify(&self, notification: Notification) -> Result<()> {
        tracing::info!(
            target: "paygate::notify",
            notification = ?notification,
            "Subscription notification"
        );
        Ok(())
    }
}

/// Recording sink for tests.
pub mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    pub struct RecordingSink {
        sent: Arc<Mutex<Vec<Notification>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl RecordingSink {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_failing(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }

        #[must_use]
        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify(&self, notification: Notification) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(crate::error::PaygateError::internal("sink down"));
            }
            self.sent.lock().unwrap().push(notification);
            Ok(())
        }
    }
}
