//! Payment provider webhook handling.

pub mod ingress;
pub mod verify;

pub use ingress::{EventKind, IngressOutcome, WebhookEvent, WebhookIngress};
pub use verify::{sign_payload, SignatureVerifier};
