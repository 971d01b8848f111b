//! Subscription-state reconciliation.

pub mod engine;
pub mod single_flight;

pub use engine::{derive_snapshot, ReconcileEngine, ReconcileOutcome};
pub use single_flight::{FlightError, FlightRole, SingleFlight};
