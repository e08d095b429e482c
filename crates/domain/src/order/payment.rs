//! Payment sub-record and its append-only audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Money;

use super::OrderStatus;

/// How the customer pays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    /// Online card payment captured by a provider.
    Card,
    /// Bank transfer, confirmed by an uploaded proof of payment.
    Transfer,
    /// Pay on delivery.
    Delivery,
}

impl PaymentMethod {
    /// Offline methods need a physical address to fulfil the order.
    pub fn requires_shipping_address(&self) -> bool {
        matches!(self, PaymentMethod::Transfer | PaymentMethod::Delivery)
    }

    /// Card payments are only settled once a provider webhook confirms them.
    pub fn requires_online_capture(&self) -> bool {
        matches!(self, PaymentMethod::Card)
    }

    pub fn requires_proof(&self) -> bool {
        matches!(self, PaymentMethod::Transfer)
    }

    /// Status a freshly created order starts in.
    pub fn initial_order_status(&self) -> OrderStatus {
        if self.requires_online_capture() {
            OrderStatus::Pending
        } else {
            OrderStatus::Placed
        }
    }

    /// Status the payment sub-record starts in.
    pub fn initial_payment_status(&self) -> PaymentStatus {
        if self.requires_online_capture() {
            PaymentStatus::Initiated
        } else {
            PaymentStatus::Pending
        }
    }

    /// Provider used when the caller does not pick one.
    pub fn default_provider(&self) -> PaymentProvider {
        match self {
            PaymentMethod::Card => PaymentProvider::Stripe,
            PaymentMethod::Transfer => PaymentProvider::Transfer,
            PaymentMethod::Delivery => PaymentProvider::Delivery,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::Transfer => "transfer",
            PaymentMethod::Delivery => "delivery",
        }
    }
}

/// Who settles the payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    Stripe,
    Paypal,
    Transfer,
    Delivery,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProvider::Stripe => "stripe",
            PaymentProvider::Paypal => "paypal",
            PaymentProvider::Transfer => "transfer",
            PaymentProvider::Delivery => "delivery",
        }
    }
}

impl std::fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Settlement status of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Initiated,
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Initiated => "initiated",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reference to an uploaded proof-of-payment attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProof {
    pub image_ref: String,
    pub filename: String,
}

/// Payment sub-record of an order. Replaced wholesale, never merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub method: PaymentMethod,
    pub provider: PaymentProvider,
    pub status: PaymentStatus,
    pub amount: Money,
    pub currency: String,
    pub idempotency_key: Option<String>,
    pub provider_checkout_session_id: Option<String>,
    pub provider_payment_id: Option<String>,
    pub proof: Option<PaymentProof>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// Seeds the payment record for a freshly placed order.
    pub fn initial(
        method: PaymentMethod,
        amount: Money,
        currency: impl Into<String>,
        idempotency_key: Option<String>,
        proof: Option<PaymentProof>,
    ) -> Self {
        Self {
            method,
            provider: method.default_provider(),
            status: method.initial_payment_status(),
            amount,
            currency: currency.into(),
            idempotency_key,
            provider_checkout_session_id: None,
            provider_payment_id: None,
            proof,
            paid_at: None,
        }
    }

    /// True when this record already reflects a settled payment for `session_id`.
    pub fn is_paid_for_session(&self, session_id: &str) -> bool {
        self.status == PaymentStatus::Paid
            && self.provider_checkout_session_id.as_deref() == Some(session_id)
    }
}

/// One entry of the append-only payment audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub status: PaymentStatus,
    pub provider: PaymentProvider,
    pub amount: Money,
    pub metadata: serde_json::Value,
    pub webhook_event: String,
}
