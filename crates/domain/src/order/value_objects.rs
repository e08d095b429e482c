//! Value objects for the order domain.

use chrono::{DateTime, Utc};
use common::{ProductId, Sku, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Money;

use super::OrderError;

/// A line of an order. Immutable once the order exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    /// Catalog product the variant belongs to.
    pub product_id: ProductId,

    /// Variant whose stock is reserved.
    pub variant_sku: Sku,

    /// Quantity ordered, at least 1.
    pub quantity: u32,

    /// Price per unit in minor units.
    pub unit_price: Money,
}

impl OrderItem {
    /// Creates a new order item.
    pub fn new(
        product_id: impl Into<ProductId>,
        variant_sku: impl Into<Sku>,
        quantity: u32,
        unit_price: Money,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            variant_sku: variant_sku.into(),
            quantity,
            unit_price,
        }
    }

    /// Returns the total price for this item (quantity * unit_price), or
    /// `None` when it overflows.
    pub fn total_price(&self) -> Option<Money> {
        self.unit_price.checked_multiply(self.quantity)
    }

    /// Checks the item is complete: ids present, quantity >= 1, price > 0.
    pub fn validate(&self, index: usize) -> Result<(), OrderError> {
        if self.product_id.is_blank() {
            return Err(OrderError::InvalidItem {
                index,
                reason: "product id is required".to_string(),
            });
        }
        if self.variant_sku.is_blank() {
            return Err(OrderError::InvalidItem {
                index,
                reason: "variant sku is required".to_string(),
            });
        }
        if self.quantity == 0 {
            return Err(OrderError::InvalidQuantity {
                sku: self.variant_sku.to_string(),
                quantity: self.quantity,
            });
        }
        if !self.unit_price.is_positive() {
            return Err(OrderError::InvalidPrice {
                sku: self.variant_sku.to_string(),
                price: self.unit_price.cents(),
            });
        }
        Ok(())
    }
}

/// Sum of `quantity * unit_price` over all items.
pub fn order_total(items: &[OrderItem]) -> Result<Money, OrderError> {
    items.iter().try_fold(Money::zero(), |total, item| {
        item.total_price()
            .and_then(|line| total.checked_add(line))
            .ok_or(OrderError::AmountOverflow)
    })
}

/// Who owns an order: a registered user or a guest. Exactly one, never both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum CustomerRef {
    User(UserId),
    Guest(String),
}

impl CustomerRef {
    /// Synthesizes a fresh guest identity.
    pub fn new_guest(now: DateTime<Utc>) -> Self {
        CustomerRef::Guest(generate_guest_id(now))
    }

    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            CustomerRef::User(id) => Some(id),
            CustomerRef::Guest(_) => None,
        }
    }

    pub fn guest_id(&self) -> Option<&str> {
        match self {
            CustomerRef::User(_) => None,
            CustomerRef::Guest(id) => Some(id),
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, CustomerRef::Guest(_))
    }
}

/// Builds a guest id of the form `guest-YYYYMMDDHHMMSSmmm-xxxxxxxx`:
/// UTC timestamp to the millisecond, then 8 random lowercase alphanumerics.
pub fn generate_guest_id(now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("guest-{}-{}", now.format("%Y%m%d%H%M%S%3f"), &random[..8])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonName {
    pub first: String,
    pub last: String,
}

/// Contact details captured on the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInfo {
    pub name: PersonName,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
}

impl CustomerInfo {
    /// Guests must supply a full name and a plausible email; phone is optional.
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.name.first.trim().is_empty() {
            return Err(OrderError::InvalidCustomerInfo("first name is required"));
        }
        if self.name.last.trim().is_empty() {
            return Err(OrderError::InvalidCustomerInfo("last name is required"));
        }
        let email = self.email.trim();
        if email.is_empty() {
            return Err(OrderError::InvalidCustomerInfo("email is required"));
        }
        if !email.contains('@') {
            return Err(OrderError::InvalidCustomerInfo("email is malformed"));
        }
        Ok(())
    }
}

/// Postal address orders are shipped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddress {
    pub line1: String,
    #[serde(default)]
    pub line2: Option<String>,
    pub city: String,
    pub state: String,
    pub postal: String,
    pub country: String,
}

impl ShippingAddress {
    /// Every field except `line2` must be present.
    pub fn validate(&self) -> Result<(), OrderError> {
        let required = [
            ("line1", &self.line1),
            ("city", &self.city),
            ("state", &self.state),
            ("postal", &self.postal),
            ("country", &self.country),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(OrderError::IncompleteShippingAddress { field });
            }
        }
        Ok(())
    }
}
