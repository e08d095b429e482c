//! Typed settings for the workflow and the reconciler.

use std::time::Duration;

use domain::{PaymentMethod, modification_window};
use store::DEFAULT_IDEMPOTENCY_LEASE;

/// Settings for [`crate::OrderWorkflow`].
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    /// How long after creation an order may be cancelled or deleted.
    pub modification_window: chrono::Duration,
    pub card_currency: String,
    /// Currency of transfer and pay-on-delivery orders.
    pub local_currency: String,
    /// Upper bound for each collaborator or ledger call.
    pub collaborator_timeout: Duration,
    /// After this long an unfinished request no longer holds its
    /// idempotency key.
    pub idempotency_lease: Duration,
}

impl WorkflowSettings {
    pub fn currency_for(&self, method: PaymentMethod) -> &str {
        if method.requires_online_capture() {
            &self.card_currency
        } else {
            &self.local_currency
        }
    }
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            modification_window: modification_window(),
            card_currency: "USD".to_string(),
            local_currency: "NGN".to_string(),
            collaborator_timeout: Duration::from_millis(5000),
            idempotency_lease: DEFAULT_IDEMPOTENCY_LEASE,
        }
    }
}

/// Settings for [`crate::PaymentReconciler`].
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub stripe_webhook_secret: Option<String>,
    pub paypal_webhook_secret: Option<String>,
    /// Maximum clock skew accepted on signed webhook timestamps.
    pub signature_tolerance: chrono::Duration,
    pub collaborator_timeout: Duration,
    pub idempotency_lease: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            stripe_webhook_secret: None,
            paypal_webhook_secret: None,
            signature_tolerance: chrono::Duration::seconds(300),
            collaborator_timeout: Duration::from_millis(5000),
            idempotency_lease: DEFAULT_IDEMPOTENCY_LEASE,
        }
    }
}
