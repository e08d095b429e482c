//! Provider webhook payloads, normalized into one event shape.
//!
//! Stripe sends `{id, type, data: {object}}`, PayPal sends
//! `{id, event_type, resource}`. Both are read as untyped JSON and reduced to
//! [`ProviderEvent`] so the reconciler never touches provider field names.

use common::{OrderId, ProductId, Sku};
use domain::{Money, OrderItem, PaymentProvider, ShippingAddress};
use serde_json::Value;

use crate::error::{Result, WorkflowError};

/// Payment providers that deliver webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebhookProvider {
    Stripe,
    Paypal,
}

impl WebhookProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookProvider::Stripe => "stripe",
            WebhookProvider::Paypal => "paypal",
        }
    }

    pub fn payment_provider(&self) -> PaymentProvider {
        match self {
            WebhookProvider::Stripe => PaymentProvider::Stripe,
            WebhookProvider::Paypal => PaymentProvider::Paypal,
        }
    }
}

impl std::fmt::Display for WebhookProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WebhookProvider {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stripe" => Ok(WebhookProvider::Stripe),
            "paypal" => Ok(WebhookProvider::Paypal),
            other => Err(WorkflowError::NotFound(format!(
                "unknown payment provider '{other}'"
            ))),
        }
    }
}

/// A line item as reported by the provider.
///
/// Product and sku come from provider-side metadata and may be missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineItem {
    pub product_id: Option<ProductId>,
    pub variant_sku: Option<Sku>,
    pub quantity: u32,
    pub amount_total: Money,
}

impl LineItem {
    /// Converts to an order item when the provider supplied every field.
    pub fn to_order_item(&self) -> Option<OrderItem> {
        let product_id = self.product_id.clone().filter(|id| !id.is_blank())?;
        let variant_sku = self.variant_sku.clone().filter(|sku| !sku.is_blank())?;
        if self.quantity == 0 {
            return None;
        }
        let unit_price = self.amount_total.per_unit(self.quantity);
        if !unit_price.is_positive() {
            return None;
        }
        Some(OrderItem {
            product_id,
            variant_sku,
            quantity: self.quantity,
            unit_price,
        })
    }
}

/// Order items for `lines`, or `None` when any line is incomplete.
pub fn complete_items(lines: &[LineItem]) -> Option<Vec<OrderItem>> {
    if lines.is_empty() {
        return None;
    }
    lines.iter().map(LineItem::to_order_item).collect()
}

/// A finished checkout session.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSession {
    pub session_id: String,
    /// Our order id, echoed back through provider metadata.
    pub order_id: Option<OrderId>,
    pub payment_id: Option<String>,
    pub amount: Money,
    pub currency: String,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub shipping_address: Option<ShippingAddress>,
    pub line_items: Vec<LineItem>,
}

/// A payment failure or refund for an existing order.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentUpdate {
    pub order_id: Option<OrderId>,
    pub session_id: Option<String>,
    pub payment_id: Option<String>,
    pub amount: Option<Money>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    CheckoutCompleted(CheckoutSession),
    PaymentFailed(PaymentUpdate),
    Refunded(PaymentUpdate),
    /// Anything we do not act on.
    Unrecognized,
}

/// A verified webhook event.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    pub id: String,
    pub event_type: String,
    pub kind: EventKind,
    /// The payload as sent, kept in the order's payment audit trail.
    pub raw: Value,
}

impl ProviderEvent {
    /// Parses a verified payload from `provider`.
    pub fn parse(provider: WebhookProvider, payload: &[u8]) -> Result<Self> {
        let raw: Value = serde_json::from_slice(payload)
            .map_err(|err| WorkflowError::Validation(format!("malformed webhook payload: {err}")))?;
        match provider {
            WebhookProvider::Stripe => parse_stripe(raw),
            WebhookProvider::Paypal => parse_paypal(raw),
        }
    }
}

fn str_field(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn order_id_field(value: &Value, pointer: &str) -> Option<OrderId> {
    str_field(value, pointer).and_then(|s| OrderId::parse(&s).ok())
}

fn required_id(raw: &Value) -> Result<String> {
    str_field(raw, "/id")
        .ok_or_else(|| WorkflowError::Validation("webhook event has no id".into()))
}

fn parse_stripe(raw: Value) -> Result<ProviderEvent> {
    let id = required_id(&raw)?;
    let event_type = str_field(&raw, "/type")
        .ok_or_else(|| WorkflowError::Validation("webhook event has no type".into()))?;
    let object = raw.pointer("/data/object").cloned().unwrap_or(Value::Null);

    // `payment_intent` is either an id or an expanded object.
    let payment_intent = str_field(&object, "/payment_intent")
        .or_else(|| str_field(&object, "/payment_intent/id"));

    let kind = match event_type.as_str() {
        "checkout.session.completed" => {
            let session_id = str_field(&object, "/id").ok_or_else(|| {
                WorkflowError::Validation("checkout session has no id".into())
            })?;
            EventKind::CheckoutCompleted(CheckoutSession {
                session_id,
                order_id: order_id_field(&object, "/metadata/orderId"),
                payment_id: payment_intent,
                amount: Money::from_cents(
                    object
                        .pointer("/amount_total")
                        .and_then(Value::as_i64)
                        .unwrap_or(0),
                ),
                currency: str_field(&object, "/currency")
                    .unwrap_or_else(|| "USD".to_string())
                    .to_uppercase(),
                customer_email: str_field(&object, "/customer_email")
                    .or_else(|| str_field(&object, "/customer_details/email")),
                customer_name: str_field(&object, "/customer_details/name"),
                customer_phone: str_field(&object, "/customer_details/phone"),
                shipping_address: object
                    .pointer("/shipping_details/address")
                    .or_else(|| object.pointer("/shipping/address"))
                    .and_then(stripe_address),
                line_items: object
                    .get("line_items")
                    .map(parse_stripe_line_items)
                    .unwrap_or_default(),
            })
        }
        "checkout.session.async_payment_failed" => EventKind::PaymentFailed(PaymentUpdate {
            order_id: order_id_field(&object, "/metadata/orderId"),
            session_id: str_field(&object, "/id"),
            payment_id: payment_intent,
            amount: object
                .pointer("/amount_total")
                .and_then(Value::as_i64)
                .map(Money::from_cents),
        }),
        "payment_intent.payment_failed" => EventKind::PaymentFailed(PaymentUpdate {
            order_id: order_id_field(&object, "/metadata/orderId"),
            session_id: None,
            payment_id: str_field(&object, "/id"),
            amount: object
                .pointer("/amount")
                .and_then(Value::as_i64)
                .map(Money::from_cents),
        }),
        "charge.refunded" => EventKind::Refunded(PaymentUpdate {
            order_id: order_id_field(&object, "/metadata/orderId"),
            session_id: None,
            payment_id: payment_intent,
            amount: object
                .pointer("/amount_refunded")
                .and_then(Value::as_i64)
                .map(Money::from_cents),
        }),
        _ => EventKind::Unrecognized,
    };

    Ok(ProviderEvent {
        id,
        event_type,
        kind,
        raw,
    })
}

fn stripe_address(address: &Value) -> Option<ShippingAddress> {
    if !address.is_object() {
        return None;
    }
    let field = |name: &str| str_field(address, &format!("/{name}")).unwrap_or_default();
    Some(ShippingAddress {
        line1: field("line1"),
        line2: str_field(address, "/line2"),
        city: field("city"),
        state: field("state"),
        postal: field("postal_code"),
        country: field("country"),
    })
}

/// Reads a Stripe line-item list (`{data: [...]}`).
///
/// Our product id and sku travel in the product metadata, or in the price
/// metadata when the product was not expanded.
pub fn parse_stripe_line_items(list: &Value) -> Vec<LineItem> {
    let Some(lines) = list.get("data").and_then(Value::as_array) else {
        return Vec::new();
    };
    lines
        .iter()
        .map(|line| {
            let metadata = |key: &str| {
                str_field(line, &format!("/price/product/metadata/{key}"))
                    .or_else(|| str_field(line, &format!("/price/metadata/{key}")))
            };
            let quantity = line
                .get("quantity")
                .and_then(Value::as_u64)
                .and_then(|q| u32::try_from(q).ok())
                .unwrap_or(1);
            LineItem {
                product_id: metadata("productId").map(ProductId::new),
                variant_sku: metadata("variantSku").map(Sku::new),
                quantity,
                amount_total: Money::from_cents(
                    line.get("amount_total").and_then(Value::as_i64).unwrap_or(0),
                ),
            }
        })
        .collect()
}

fn parse_paypal(raw: Value) -> Result<ProviderEvent> {
    let id = required_id(&raw)?;
    let event_type = str_field(&raw, "/event_type")
        .ok_or_else(|| WorkflowError::Validation("webhook event has no event_type".into()))?;
    let resource = raw.get("resource").cloned().unwrap_or(Value::Null);

    let capture_id = str_field(&resource, "/id");
    let paypal_order = str_field(&resource, "/supplementary_data/related_ids/order_id");
    let amount = str_field(&resource, "/amount/value").and_then(|v| Money::parse_decimal(&v));
    let update = || PaymentUpdate {
        order_id: order_id_field(&resource, "/custom_id"),
        session_id: paypal_order.clone(),
        payment_id: capture_id.clone(),
        amount,
    };

    let kind = match event_type.as_str() {
        "PAYMENT.CAPTURE.COMPLETED" => {
            let session_id = paypal_order.clone().or_else(|| capture_id.clone()).ok_or_else(
                || WorkflowError::Validation("capture has no order or capture id".into()),
            )?;
            EventKind::CheckoutCompleted(CheckoutSession {
                session_id,
                order_id: order_id_field(&resource, "/custom_id"),
                payment_id: capture_id.clone(),
                amount: amount.unwrap_or_default(),
                currency: str_field(&resource, "/amount/currency_code")
                    .unwrap_or_else(|| "USD".to_string())
                    .to_uppercase(),
                customer_email: str_field(&resource, "/payer/email_address"),
                customer_name: str_field(&resource, "/payer/name/given_name"),
                customer_phone: None,
                shipping_address: None,
                line_items: Vec::new(),
            })
        }
        "PAYMENT.CAPTURE.DENIED" => EventKind::PaymentFailed(update()),
        "PAYMENT.CAPTURE.REFUNDED" => EventKind::Refunded(update()),
        _ => EventKind::Unrecognized,
    };

    Ok(ProviderEvent {
        id,
        event_type,
        kind,
        raw,
    })
}
