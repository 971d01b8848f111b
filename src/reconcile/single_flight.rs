//! Per-key single-flight execution.
//!
//! Concurrent reconciliation triggers for the same profile collapse into one
//! in-flight computation whose result every caller shares. The computation
//! runs on a spawned task, so a disconnecting HTTP caller cannot interrupt
//! the commit step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Cloneable error carried through the shared flight result.
///
/// The crate error type is not `Clone`, so flights carry this reduced form
/// and convert back at the edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlightError {
    pub kind: FlightErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightErrorKind {
    Upstream,
    NotFound,
    Internal,
}

impl FlightError {
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: FlightErrorKind::Internal,
            message: message.into(),
        }
    }
}

impl From<&crate::error::PaygateError> for FlightError {
    fn from(err: &crate::error::PaygateError) -> Self {
        use crate::error::PaygateError as E;
        let kind = match err {
            E::UpstreamUnavailable(_) | E::ServiceUnavailable(_) | E::RateLimited(_) => {
                FlightErrorKind::Upstream
            }
            E::NotFound(_) => FlightErrorKind::NotFound,
            _ => FlightErrorKind::Internal,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<FlightError> for crate::error::PaygateError {
    fn from(err: FlightError) -> Self {
        match err.kind {
            FlightErrorKind::Upstream => Self::UpstreamUnavailable(err.message),
            FlightErrorKind::NotFound => Self::NotFound(err.message),
            FlightErrorKind::Internal => Self::Internal(err.message),
        }
    }
}

/// Whether this caller started the computation or joined an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Follower,
}

type FlightResult<O> = Result<O, FlightError>;
type FlightSlot<O> = watch::Receiver<Option<FlightResult<O>>>;

/// Arena of in-flight computations keyed by string.
pub struct SingleFlight<O: Clone> {
    inflight: Arc<Mutex<HashMap<String, FlightSlot<O>>>>,
}

impl<O: Clone> Default for SingleFlight<O> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<O: Clone + Send + Sync + 'static> SingleFlight<O> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` under `key`, or join the flight already running there.
    ///
    /// The leader's future is spawned and always runs to completion; its key
    /// is removed from the arena by the spawned task itself, so cancellation
    /// of any caller can neither strand followers nor leak the slot.
    pub async fn run<Fut>(&self, key: &str, fut: Fut) -> (FlightResult<O>, FlightRole)
    where
        Fut: std::future::Future<Output = FlightResult<O>> + Send + 'static,
    {
        let (role, rx) = {
            let mut inflight = self.inflight.lock().unwrap();
            if let Some(rx) = inflight.get(key) {
                (FlightRole::Follower, rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                inflight.insert(key.to_string(), rx.clone());

                let arena = Arc::clone(&self.inflight);
                let key = key.to_string();
                tokio::spawn(async move {
                    let result = fut.await;
                    let _ = tx.send(Some(result));
                    arena.lock().unwrap().remove(&key);
                });

                (FlightRole::Leader, rx)
            }
        };

        (Self::wait(rx).await, role)
    }

    /// How many flights are currently in progress (for tests).
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    async fn wait(mut rx: FlightSlot<O>) -> FlightResult<O> {
        loop {
            let current = rx.borrow().clone();
            if let Some(result) = current {
                return result;
            }
            if rx.changed().await.is_err() {
                let current = rx.borrow().clone();
                return current.unwrap_or_else(|| {
                    Err(FlightError::internal("in-flight computation aborted"))
                });
            }
        }
    }
}
