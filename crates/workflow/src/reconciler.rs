//! Payment webhook reconciliation.
//!
//! Verified provider events are deduplicated by event id, then mapped onto
//! the order they refer to. Every mutation is one compare-and-set write of
//! status, payment and one audit entry, so a replayed or concurrent event can
//! never produce a second transition to `paid`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use common::{OrderId, ProductId, Sku};
use domain::{
    CustomerInfo, CustomerRef, NewOrder, Order, OrderItem, OrderStatus, Payment,
    PaymentApplication, PaymentHistoryEntry, PaymentMethod, PaymentStatus, PersonName,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use store::{IdempotencyOutcome, IdempotencyScope, StoreError, Stores};

use crate::error::{Result, WorkflowError};
use crate::services::CheckoutProvider;
use crate::settings::ReconcilerSettings;
use crate::signature::{
    PAYPAL_TRANSMISSION_ID_HEADER, PAYPAL_TRANSMISSION_SIG_HEADER,
    PAYPAL_TRANSMISSION_TIME_HEADER, STRIPE_SIGNATURE_HEADER, SignatureError, verify_paypal,
    verify_stripe,
};
use crate::stock::StockMover;
use crate::webhook::{
    CheckoutSession, EventKind, LineItem, PaymentUpdate, ProviderEvent, WebhookProvider,
    complete_items,
};

/// Request headers relevant to webhook verification, keyed by lowercase name.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders(HashMap<String, String>);

impl WebhookHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for WebhookHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// What handling an event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    /// The order's payment was updated.
    Applied,
    /// The order already reflected this payment.
    AlreadyApplied,
    /// No order existed, so one was created from the checkout.
    Created,
    /// This event id was seen before.
    Duplicate,
    /// Unhandled event type, or an order that cannot take the event.
    Ignored,
    /// No order could be matched and none could be created.
    Unmatched,
}

impl AckOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckOutcome::Applied => "applied",
            AckOutcome::AlreadyApplied => "already_applied",
            AckOutcome::Created => "created",
            AckOutcome::Duplicate => "duplicate",
            AckOutcome::Ignored => "ignored",
            AckOutcome::Unmatched => "unmatched",
        }
    }
}

/// Acknowledgement for a processed webhook.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub event_id: String,
    pub event_type: String,
    pub outcome: AckOutcome,
    pub order_id: Option<OrderId>,
}

fn record_event(provider: WebhookProvider, outcome: &'static str) {
    metrics::counter!(
        "webhook_events_total",
        "provider" => provider.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

pub struct PaymentReconciler {
    stores: Stores,
    /// Used to fetch Stripe line items. Without it, items embedded in the
    /// event are used.
    provider: Option<Arc<dyn CheckoutProvider>>,
    settings: ReconcilerSettings,
}

impl PaymentReconciler {
    pub fn new(
        stores: Stores,
        provider: Option<Arc<dyn CheckoutProvider>>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            stores,
            provider,
            settings,
        }
    }

    /// Verifies and applies one provider webhook.
    ///
    /// Only a bad signature, an event still being processed elsewhere or a
    /// failed write is an error; everything else is acknowledged. A signed
    /// payload we cannot use is acked as ignored, since a retry would carry
    /// the same bytes.
    #[tracing::instrument(skip(self, provider, payload, headers), fields(provider = %provider))]
    pub async fn handle_webhook(
        &self,
        provider: WebhookProvider,
        payload: &[u8],
        headers: &WebhookHeaders,
    ) -> Result<WebhookAck> {
        if let Err(err) = self.verify(provider, payload, headers) {
            record_event(provider, "invalid_signature");
            tracing::warn!(error = %err, "webhook signature verification failed");
            return Err(WorkflowError::InvalidSignature(err.to_string()));
        }

        let event = match ProviderEvent::parse(provider, payload) {
            Ok(event) => event,
            Err(err) => {
                record_event(provider, AckOutcome::Ignored.as_str());
                tracing::warn!(error = %err, "verified webhook payload is unusable, ignoring");
                return Ok(WebhookAck {
                    event_id: String::new(),
                    event_type: String::new(),
                    outcome: AckOutcome::Ignored,
                    order_id: None,
                });
            }
        };
        tracing::info!(event_id = %event.id, event_type = %event.event_type, "webhook received");

        let key = format!("{provider}:{}", event.id);
        match self
            .stores
            .idempotency
            .check_and_reserve(
                IdempotencyScope::PaymentEvent,
                &key,
                self.settings.idempotency_lease,
            )
            .await?
        {
            IdempotencyOutcome::Fresh => {}
            // Not acked: if the other delivery dies, the provider's next retry
            // takes the key over once its lease runs out.
            IdempotencyOutcome::InFlight => {
                record_event(provider, "in_flight");
                tracing::info!(event_id = %event.id, "webhook event already in progress");
                return Err(WorkflowError::Conflict(format!(
                    "webhook event {} is already being processed",
                    event.id
                )));
            }
            IdempotencyOutcome::Completed(_) => {
                record_event(provider, AckOutcome::Duplicate.as_str());
                tracing::info!(event_id = %event.id, "duplicate webhook event, skipping");
                return Ok(WebhookAck {
                    event_id: event.id,
                    event_type: event.event_type,
                    outcome: AckOutcome::Duplicate,
                    order_id: None,
                });
            }
        }

        match self.dispatch(provider, &event).await {
            Ok((outcome, order_id)) => {
                let recorded = json!({ "outcome": outcome.as_str(), "orderId": order_id });
                if let Err(err) = self
                    .stores
                    .idempotency
                    .complete(IdempotencyScope::PaymentEvent, &key, recorded)
                    .await
                {
                    tracing::warn!(error = %err, "failed to record webhook outcome");
                }
                record_event(provider, outcome.as_str());
                Ok(WebhookAck {
                    event_id: event.id,
                    event_type: event.event_type,
                    outcome,
                    order_id,
                })
            }
            Err(err) => {
                // Let the provider's retry run the event again.
                if let Err(release_err) = self
                    .stores
                    .idempotency
                    .release(IdempotencyScope::PaymentEvent, &key)
                    .await
                {
                    tracing::error!(error = %release_err, "failed to release webhook event key");
                }
                record_event(provider, "error");
                tracing::error!(event_id = %event.id, error = %err, "webhook processing failed");
                Err(err)
            }
        }
    }

    fn verify(
        &self,
        provider: WebhookProvider,
        payload: &[u8],
        headers: &WebhookHeaders,
    ) -> std::result::Result<(), SignatureError> {
        let header = |name: &'static str| {
            headers
                .get(name)
                .ok_or(SignatureError::MissingHeader(name))
        };
        match provider {
            WebhookProvider::Stripe => {
                let secret = self
                    .settings
                    .stripe_webhook_secret
                    .as_deref()
                    .ok_or(SignatureError::NotConfigured)?;
                verify_stripe(
                    payload,
                    header(STRIPE_SIGNATURE_HEADER)?,
                    secret,
                    self.settings.signature_tolerance,
                    Utc::now(),
                )
            }
            WebhookProvider::Paypal => {
                let secret = self
                    .settings
                    .paypal_webhook_secret
                    .as_deref()
                    .ok_or(SignatureError::NotConfigured)?;
                verify_paypal(
                    payload,
                    header(PAYPAL_TRANSMISSION_ID_HEADER)?,
                    header(PAYPAL_TRANSMISSION_TIME_HEADER)?,
                    header(PAYPAL_TRANSMISSION_SIG_HEADER)?,
                    secret,
                )
            }
        }
    }

    async fn dispatch(
        &self,
        provider: WebhookProvider,
        event: &ProviderEvent,
    ) -> Result<(AckOutcome, Option<OrderId>)> {
        match &event.kind {
            EventKind::CheckoutCompleted(session) => {
                self.settle_checkout(provider, event, session).await
            }
            EventKind::PaymentFailed(update) => {
                self.record_payment_status(provider, event, update, PaymentStatus::Failed)
                    .await
            }
            EventKind::Refunded(update) => {
                self.record_payment_status(provider, event, update, PaymentStatus::Refunded)
                    .await
            }
            EventKind::Unrecognized => {
                tracing::info!(event_type = %event.event_type, "unhandled webhook event type");
                Ok((AckOutcome::Ignored, None))
            }
        }
    }

    async fn find_order(
        &self,
        order_id: Option<OrderId>,
        session_id: Option<&str>,
    ) -> Result<Option<Order>> {
        if let Some(id) = order_id
            && let Some(order) = self.stores.orders.find_by_id(id).await?
        {
            return Ok(Some(order));
        }
        match session_id {
            Some(session_id) => Ok(self.stores.orders.find_by_provider_session(session_id).await?),
            None => Ok(None),
        }
    }

    async fn settle_checkout(
        &self,
        provider: WebhookProvider,
        event: &ProviderEvent,
        session: &CheckoutSession,
    ) -> Result<(AckOutcome, Option<OrderId>)> {
        let existing = self
            .find_order(session.order_id, Some(&session.session_id))
            .await?;
        let Some(order) = existing else {
            return self.create_from_checkout(provider, event, session).await;
        };

        if order.is_paid_for_session(&session.session_id) {
            tracing::info!(order_id = %order.id, "checkout already applied");
            return Ok((AckOutcome::AlreadyApplied, Some(order.id)));
        }
        if !order.status.can_transition_to(OrderStatus::Paid) {
            tracing::warn!(
                order_id = %order.id,
                status = %order.status,
                session_id = %session.session_id,
                reconciliation_required = true,
                "completed checkout for an order that cannot become paid"
            );
            return Ok((AckOutcome::Ignored, Some(order.id)));
        }

        let lines = self.line_items(provider, session).await;
        let items = complete_items(&lines);
        if order.stock_reserved
            && let Some(ref reported) = items
            && !same_quantities(&order.items, reported)
        {
            tracing::warn!(
                order_id = %order.id,
                session_id = %session.session_id,
                reconciliation_required = true,
                "checkout line items differ from the reserved order items, keeping the order's"
            );
        }
        let now = Utc::now();
        let application = PaymentApplication {
            status: OrderStatus::Paid,
            payment: paid_payment(provider, session, order.payment.as_ref(), now),
            history_entry: history_entry(
                provider,
                PaymentStatus::Paid,
                session.amount,
                event,
                session.payment_id.as_deref(),
                Some(&session.session_id),
            ),
            total_amount: session.amount,
            currency: session.currency.clone(),
            items,
        };

        match self
            .stores
            .orders
            .apply_payment(order.id, order.status, application)
            .await
        {
            Ok(updated) => {
                tracing::info!(order_id = %updated.id, "order marked paid");
                Ok((AckOutcome::Applied, Some(updated.id)))
            }
            Err(StoreError::ConcurrencyConflict { .. }) => {
                let current = self.stores.orders.find_by_id(order.id).await?;
                if current.is_some_and(|o| o.is_paid_for_session(&session.session_id)) {
                    Ok((AckOutcome::AlreadyApplied, Some(order.id)))
                } else {
                    Err(WorkflowError::Conflict(format!(
                        "order {} changed while applying checkout {}",
                        order.id, session.session_id
                    )))
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Line items for the session: fetched from Stripe when a client is
    /// configured, otherwise whatever the event carried.
    async fn line_items(
        &self,
        provider: WebhookProvider,
        session: &CheckoutSession,
    ) -> Vec<LineItem> {
        let (WebhookProvider::Stripe, Some(client)) = (provider, self.provider.as_ref()) else {
            return session.line_items.clone();
        };
        let lookup = tokio::time::timeout(
            self.settings.collaborator_timeout,
            client.session_line_items(&session.session_id),
        )
        .await;
        match lookup {
            Ok(Ok(lines)) => lines,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "line item lookup failed, using event payload");
                session.line_items.clone()
            }
            Err(_) => {
                tracing::warn!("line item lookup timed out, using event payload");
                session.line_items.clone()
            }
        }
    }

    // A paid checkout with no matching order means our order was never
    // persisted or the provider lost its metadata. The sale is still recorded,
    // as a paid guest order with a best-effort reservation, so the payment is
    // not silently dropped. Whether this should instead be escalated to a
    // human is unresolved; both behaviors keep the audit entry.
    async fn create_from_checkout(
        &self,
        provider: WebhookProvider,
        event: &ProviderEvent,
        session: &CheckoutSession,
    ) -> Result<(AckOutcome, Option<OrderId>)> {
        let lines = self.line_items(provider, session).await;
        let Some(items) = complete_items(&lines) else {
            tracing::error!(
                session_id = %session.session_id,
                reconciliation_required = true,
                "paid checkout has no matching order and no usable line items"
            );
            return Ok((AckOutcome::Unmatched, None));
        };

        let stock = StockMover::new(
            self.stores.ledger.as_ref(),
            self.settings.collaborator_timeout,
        );
        let reserved = match stock.reserve(&items).await {
            Ok(reserved) => Some(reserved),
            Err(err) => {
                tracing::warn!(
                    session_id = %session.session_id,
                    error = %err,
                    reconciliation_required = true,
                    "could not reserve stock for webhook order"
                );
                None
            }
        };

        let built = build_fallback_order(provider, event, session, items, reserved.is_some());
        let order = match built {
            Ok(order) => order,
            Err(err) => {
                if let Some(ref reserved) = reserved {
                    stock.release(reserved).await;
                }
                return Err(err);
            }
        };

        match self.stores.orders.create(&order).await {
            Ok(()) => {
                tracing::info!(
                    order_id = %order.id,
                    session_id = %session.session_id,
                    "order created from checkout"
                );
                Ok((AckOutcome::Created, Some(order.id)))
            }
            Err(err) => {
                if let Some(ref reserved) = reserved {
                    stock.release(reserved).await;
                }
                match err {
                    // Another delivery of the same checkout created it first.
                    StoreError::DuplicateIdempotencyKey(_) => {
                        let existing = self
                            .stores
                            .orders
                            .find_by_provider_session(&session.session_id)
                            .await?;
                        Ok((AckOutcome::AlreadyApplied, existing.map(|o| o.id)))
                    }
                    other => Err(other.into()),
                }
            }
        }
    }

    async fn record_payment_status(
        &self,
        provider: WebhookProvider,
        event: &ProviderEvent,
        update: &PaymentUpdate,
        status: PaymentStatus,
    ) -> Result<(AckOutcome, Option<OrderId>)> {
        let Some(order) = self
            .find_order(update.order_id, update.session_id.as_deref())
            .await?
        else {
            tracing::info!(event_type = %event.event_type, "no order matches payment update");
            return Ok((AckOutcome::Unmatched, None));
        };

        let mut payment = order.payment.clone().unwrap_or_else(|| {
            Payment::initial(
                PaymentMethod::Card,
                order.total_amount,
                order.currency.clone(),
                None,
                None,
            )
        });
        payment.status = status;
        payment.provider = provider.payment_provider();
        if let Some(ref payment_id) = update.payment_id {
            payment.provider_payment_id = Some(payment_id.clone());
        }
        let amount = update.amount.unwrap_or(payment.amount);

        // The order keeps its status; only the payment and its trail change.
        let application = PaymentApplication {
            status: order.status,
            history_entry: history_entry(
                provider,
                status,
                amount,
                event,
                payment.provider_payment_id.as_deref(),
                update.session_id.as_deref(),
            ),
            payment,
            total_amount: order.total_amount,
            currency: order.currency.clone(),
            items: None,
        };
        let updated = self
            .stores
            .orders
            .apply_payment(order.id, order.status, application)
            .await?;
        tracing::info!(order_id = %updated.id, payment_status = %status, "payment status recorded");
        Ok((AckOutcome::Applied, Some(updated.id)))
    }
}

/// True when both lists move the same quantity of every variant.
fn same_quantities(ordered: &[OrderItem], reported: &[OrderItem]) -> bool {
    fn tally(items: &[OrderItem]) -> HashMap<(&ProductId, &Sku), u64> {
        let mut counts = HashMap::new();
        for item in items {
            *counts
                .entry((&item.product_id, &item.variant_sku))
                .or_default() += u64::from(item.quantity);
        }
        counts
    }
    tally(ordered) == tally(reported)
}

fn paid_payment(
    provider: WebhookProvider,
    session: &CheckoutSession,
    previous: Option<&Payment>,
    now: chrono::DateTime<Utc>,
) -> Payment {
    Payment {
        method: PaymentMethod::Card,
        provider: provider.payment_provider(),
        status: PaymentStatus::Paid,
        amount: session.amount,
        currency: session.currency.clone(),
        idempotency_key: previous.and_then(|p| p.idempotency_key.clone()),
        provider_checkout_session_id: Some(session.session_id.clone()),
        provider_payment_id: session.payment_id.clone(),
        proof: None,
        paid_at: Some(now),
    }
}

fn history_entry(
    provider: WebhookProvider,
    status: PaymentStatus,
    amount: domain::Money,
    event: &ProviderEvent,
    payment_id: Option<&str>,
    session_id: Option<&str>,
) -> PaymentHistoryEntry {
    PaymentHistoryEntry {
        timestamp: Utc::now(),
        status,
        provider: provider.payment_provider(),
        amount,
        metadata: json!({
            "eventId": event.id,
            "sessionId": session_id,
            "paymentId": payment_id,
            "rawEvent": event.raw,
        }),
        webhook_event: event.event_type.clone(),
    }
}

fn build_fallback_order(
    provider: WebhookProvider,
    event: &ProviderEvent,
    session: &CheckoutSession,
    items: Vec<OrderItem>,
    stock_reserved: bool,
) -> Result<Order> {
    let now = Utc::now();
    let customer_info = session.customer_email.as_ref().map(|email| CustomerInfo {
        name: PersonName {
            first: session.customer_name.clone().unwrap_or_default(),
            last: String::new(),
        },
        email: email.clone(),
        phone: session.customer_phone.clone(),
    });

    let new_order = NewOrder {
        customer: CustomerRef::new_guest(now),
        items,
        payment: paid_payment(provider, session, None, now),
        shipping_address: session.shipping_address.clone(),
        customer_info,
        // Unique per checkout, so concurrent deliveries cannot both insert.
        idempotency_key: Some(format!("checkout:{provider}:{}", session.session_id)),
        stock_reserved,
    };
    let mut order = Order::create(new_order, now)?;
    order.total_amount = session.amount;
    order.payment_history.push(history_entry(
        provider,
        PaymentStatus::Paid,
        session.amount,
        event,
        session.payment_id.as_deref(),
        Some(&session.session_id),
    ));
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_are_case_insensitive() {
        let headers: WebhookHeaders = [("Stripe-Signature", "t=1,v1=ab")].into_iter().collect();
        assert_eq!(headers.get("stripe-signature"), Some("t=1,v1=ab"));
        assert_eq!(headers.get("STRIPE-SIGNATURE"), Some("t=1,v1=ab"));
        assert!(headers.get("paypal-transmission-sig").is_none());
    }

    #[test]
    fn test_same_quantities_ignores_order_and_splits() {
        let price = domain::Money::from_cents(100);
        let ordered = vec![
            OrderItem::new("p1", "A", 2, price),
            OrderItem::new("p2", "B", 1, price),
        ];
        let reported = vec![
            OrderItem::new("p2", "B", 1, price),
            OrderItem::new("p1", "A", 1, price),
            OrderItem::new("p1", "A", 1, price),
        ];
        assert!(same_quantities(&ordered, &reported));
        assert!(!same_quantities(&ordered, &reported[..2]));
    }

    #[test]
    fn test_ack_serializes_outcome() {
        let ack = WebhookAck {
            event_id: "evt_1".into(),
            event_type: "checkout.session.completed".into(),
            outcome: AckOutcome::AlreadyApplied,
            order_id: None,
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["outcome"], "already_applied");
        assert_eq!(json["eventId"], "evt_1");
    }
}
