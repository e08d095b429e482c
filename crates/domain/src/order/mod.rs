//! Order aggregate and related types.

mod aggregate;
mod payment;
mod status;
mod value_objects;

pub use aggregate::{
    MODIFICATION_WINDOW_DAYS, NewOrder, Order, PaymentApplication, modification_window,
};
pub use payment::{
    Payment, PaymentHistoryEntry, PaymentMethod, PaymentProof, PaymentProvider, PaymentStatus,
};
pub use status::OrderStatus;
pub use value_objects::{
    CustomerInfo, CustomerRef, OrderItem, PersonName, ShippingAddress, generate_guest_id,
    order_total,
};

use thiserror::Error;

/// Errors that can occur during order operations.
#[derive(Debug, Error)]
pub enum OrderError {
    /// Order is not allowed to move between these statuses.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: OrderStatus, to: OrderStatus },

    /// Order has no items.
    #[error("Order has no items")]
    NoItems,

    /// An item is missing its product id or sku.
    #[error("Item {index} is invalid: {reason}")]
    InvalidItem { index: usize, reason: String },

    /// Invalid quantity.
    #[error("Invalid quantity for {sku}: {quantity} (must be greater than 0)")]
    InvalidQuantity { sku: String, quantity: u32 },

    /// Invalid price.
    #[error("Invalid price for {sku}: {price} (must be greater than 0)")]
    InvalidPrice { sku: String, price: i64 },

    /// Guest orders need contact details.
    #[error("Customer info is required for guest orders")]
    CustomerInfoRequired,

    #[error("Invalid customer info: {0}")]
    InvalidCustomerInfo(&'static str),

    /// Offline payment methods ship to a physical address.
    #[error("Shipping address is required for this payment method")]
    ShippingAddressRequired,

    #[error("Shipping address is incomplete: {field} is required")]
    IncompleteShippingAddress { field: &'static str },

    #[error("Order total is too large")]
    AmountOverflow,

    /// Bank transfers must come with a proof of payment.
    #[error("Payment proof is required for transfer payments")]
    PaymentProofRequired,
}
