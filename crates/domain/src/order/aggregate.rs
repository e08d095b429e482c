//! Order aggregate.

use chrono::{DateTime, Duration, Utc};
use common::{OrderId, UserId};
use serde::{Deserialize, Serialize};

use super::{
    CustomerInfo, CustomerRef, OrderError, OrderItem, OrderStatus, Payment, PaymentHistoryEntry,
    PaymentStatus, ShippingAddress, value_objects::order_total,
};
use crate::Money;

/// Orders can be cancelled or deleted for this many days after creation.
pub const MODIFICATION_WINDOW_DAYS: i64 = 4;

/// Everything needed to persist a brand new order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub customer: CustomerRef,
    pub items: Vec<OrderItem>,
    pub payment: Payment,
    pub shipping_address: Option<ShippingAddress>,
    pub customer_info: Option<CustomerInfo>,
    pub idempotency_key: Option<String>,
    pub stock_reserved: bool,
}

/// Replacement payment state written by the reconciler in a single update.
#[derive(Debug, Clone)]
pub struct PaymentApplication {
    pub status: OrderStatus,
    pub payment: Payment,
    pub history_entry: PaymentHistoryEntry,
    pub total_amount: Money,
    pub currency: String,
    /// Re-derived line items, when the provider reported complete ones.
    /// Ignored for orders holding reserved stock.
    pub items: Option<Vec<OrderItem>>,
}

/// Order aggregate root.
///
/// Items, customer and shipping details are fixed at creation. Afterwards only
/// the status, the payment sub-record and its audit trail change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub customer: CustomerRef,
    pub items: Vec<OrderItem>,
    pub status: OrderStatus,
    pub payment: Option<Payment>,
    #[serde(default)]
    pub payment_history: Vec<PaymentHistoryEntry>,
    pub shipping_address: Option<ShippingAddress>,
    pub customer_info: Option<CustomerInfo>,
    pub total_amount: Money,
    pub currency: String,
    pub idempotency_key: Option<String>,
    /// Whether stock was deducted for this order and must be restored on cancel.
    pub stock_reserved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Builds an order from a validated request.
    ///
    /// The total is always derived from the items; the starting status follows
    /// the payment method, except that an already settled payment starts `paid`.
    pub fn create(new: NewOrder, now: DateTime<Utc>) -> Result<Self, OrderError> {
        if new.items.is_empty() {
            return Err(OrderError::NoItems);
        }
        for (index, item) in new.items.iter().enumerate() {
            item.validate(index)?;
        }

        let total_amount = order_total(&new.items)?;
        let status = if new.payment.status == PaymentStatus::Paid {
            OrderStatus::Paid
        } else {
            new.payment.method.initial_order_status()
        };

        Ok(Self {
            id: OrderId::new(),
            customer: new.customer,
            total_amount,
            currency: new.payment.currency.clone(),
            items: new.items,
            status,
            payment: Some(new.payment),
            payment_history: Vec::new(),
            shipping_address: new.shipping_address,
            customer_info: new.customer_info,
            idempotency_key: new.idempotency_key,
            stock_reserved: new.stock_reserved,
            created_at: now,
            updated_at: now,
        })
    }

    /// Moves the order to `next`, returning the status it left.
    pub fn transition_to(
        &mut self,
        next: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<OrderStatus, OrderError> {
        if !self.status.can_transition_to(next) {
            return Err(OrderError::InvalidStateTransition {
                from: self.status,
                to: next,
            });
        }
        let previous = self.status;
        self.status = next;
        self.updated_at = now;
        Ok(previous)
    }

    /// Replaces the payment sub-record and appends one audit entry.
    ///
    /// A status equal to the current one is accepted so that failed and
    /// refunded events can be recorded without moving the order. Items are
    /// only replaced when no stock is reserved, since cancellation restores
    /// exactly the quantities on the order.
    pub fn apply_payment(
        &mut self,
        application: PaymentApplication,
        now: DateTime<Utc>,
    ) -> Result<(), OrderError> {
        if application.status != self.status && !self.status.can_transition_to(application.status)
        {
            return Err(OrderError::InvalidStateTransition {
                from: self.status,
                to: application.status,
            });
        }

        self.status = application.status;
        self.payment = Some(application.payment);
        self.payment_history.push(application.history_entry);
        self.total_amount = application.total_amount;
        self.currency = application.currency;
        if let Some(items) = application.items
            && !items.is_empty()
            && !self.stock_reserved
        {
            self.items = items;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Returns the owning user, if the order was placed by a registered user.
    pub fn user_id(&self) -> Option<&UserId> {
        self.customer.user_id()
    }

    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        self.user_id() == Some(user_id)
    }

    /// True while the order is young enough to be cancelled or deleted.
    pub fn is_within_window(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now.signed_duration_since(self.created_at) <= window
    }

    /// Returns the total quantity of all items.
    pub fn total_quantity(&self) -> u32 {
        self.items.iter().map(|item| item.quantity).sum()
    }

    /// True when the payment was already settled for this checkout session.
    pub fn is_paid_for_session(&self, session_id: &str) -> bool {
        self.payment
            .as_ref()
            .is_some_and(|payment| payment.is_paid_for_session(session_id))
    }
}

/// The default cancellation window.
pub fn modification_window() -> Duration {
    Duration::days(MODIFICATION_WINDOW_DAYS)
}
