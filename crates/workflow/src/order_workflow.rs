//! Order creation, cancellation and permanent deletion.
//!
//! Creation is a saga over independent atomic writes: stock is reserved one
//! variant at a time, then the order is persisted. Any failure after the first
//! reservation runs the compensating releases in reverse before returning.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use common::{OrderId, UserId};
use domain::{
    CustomerInfo, CustomerRef, NewOrder, Order, OrderItem, OrderStatus, Payment,
    PaymentApplication, PaymentHistoryEntry, PaymentMethod, PaymentProof, ShippingAddress,
    order_total,
};
use serde::{Deserialize, Serialize};
use store::{IdempotencyOutcome, IdempotencyScope, OrderFilter, StoreError, Stores};

use crate::error::{Result, WorkflowError};
use crate::services::{AuthService, CartService, Caller, ProofStore, ProofUpload, proof_filename};
use crate::settings::WorkflowSettings;
use crate::stock::StockMover;

/// Who is acting on an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Admin(UserId),
    Customer(UserId),
    /// No session: a guest checkout or a guest holding an order id.
    Anonymous,
}

impl Actor {
    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::Admin(_))
    }

    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            Actor::Admin(id) | Actor::Customer(id) => Some(id),
            Actor::Anonymous => None,
        }
    }

    /// Admins reach every order, users their own. Guest orders have no
    /// account to check, so the order id itself is the credential.
    pub fn can_access(&self, order: &Order) -> bool {
        match self {
            Actor::Admin(_) => true,
            Actor::Customer(id) => order.is_owned_by(id) || order.customer.is_guest(),
            Actor::Anonymous => order.customer.is_guest(),
        }
    }
}

impl From<Option<Caller>> for Actor {
    fn from(caller: Option<Caller>) -> Self {
        match caller {
            Some(caller) if caller.is_admin() => Actor::Admin(caller.user_id),
            Some(caller) => Actor::Customer(caller.user_id),
            None => Actor::Anonymous,
        }
    }
}

/// Body of an order creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub items: Vec<OrderItem>,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub shipping_address: Option<ShippingAddress>,
    /// Required for guests; registered users get their profile instead.
    #[serde(default)]
    pub customer_info: Option<CustomerInfo>,
    /// Proof-of-payment image for transfers, as a data URL or bare base64.
    #[serde(default)]
    pub payment_proof: Option<String>,
}

/// Body of a payment method change on an existing order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePaymentRequest {
    pub payment_method: PaymentMethod,
    /// Identifies this payment attempt; repeating it changes nothing.
    pub idempotency_key: String,
    #[serde(default)]
    pub payment_proof: Option<String>,
    /// Guests prove they own the order with the email it was placed under.
    #[serde(default)]
    pub email: Option<String>,
}

/// Reference returned to the caller once an order exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderReceipt {
    pub order_id: OrderId,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<Payment>,
}

impl From<&Order> for OrderReceipt {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            status: order.status,
            payment: order.payment.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateOutcome {
    pub receipt: OrderReceipt,
    /// True when an earlier request with the same idempotency key produced
    /// this receipt.
    pub replayed: bool,
}

/// Drives order creation and cancellation against the stores and the
/// external collaborators.
#[derive(Clone)]
pub struct OrderWorkflow {
    stores: Stores,
    auth: Arc<dyn AuthService>,
    cart: Arc<dyn CartService>,
    proofs: Arc<dyn ProofStore>,
    settings: WorkflowSettings,
}

impl OrderWorkflow {
    pub fn new(
        stores: Stores,
        auth: Arc<dyn AuthService>,
        cart: Arc<dyn CartService>,
        proofs: Arc<dyn ProofStore>,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            stores,
            auth,
            cart,
            proofs,
            settings,
        }
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    fn stock(&self) -> StockMover<'_> {
        StockMover::new(
            self.stores.ledger.as_ref(),
            self.settings.collaborator_timeout,
        )
    }

    /// Turns a cart into a persisted order.
    ///
    /// Everything that can be checked without side effects is checked first.
    /// With an idempotency key, a repeat of a completed request returns the
    /// original receipt and touches nothing.
    #[tracing::instrument(
        skip(self, request, idempotency_key),
        fields(method = request.payment_method.as_str(), items = request.items.len())
    )]
    pub async fn create_order(
        &self,
        actor: &Actor,
        request: CreateOrderRequest,
        idempotency_key: Option<String>,
    ) -> Result<CreateOutcome> {
        let started = Instant::now();

        let proof = validate_request(actor, &request)?;
        let (customer, customer_info) = self.resolve_customer(actor, &request).await?;

        let key = idempotency_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        if let Some(ref key) = key {
            match self
                .stores
                .idempotency
                .check_and_reserve(
                    IdempotencyScope::OrderCreation,
                    key,
                    self.settings.idempotency_lease,
                )
                .await?
            {
                IdempotencyOutcome::Fresh => {}
                IdempotencyOutcome::InFlight => {
                    // The order is written before the key is completed, so a
                    // failed completion still leaves the order to replay.
                    let stored = self.stores.orders.find_by_idempotency_key(key).await?;
                    if let Some(existing) = stored {
                        tracing::info!(
                            order_id = %existing.id,
                            "idempotent replay of order creation from the stored order"
                        );
                        metrics::counter!("orders_replayed_total").increment(1);
                        return Ok(CreateOutcome {
                            receipt: OrderReceipt::from(&existing),
                            replayed: true,
                        });
                    }
                    return Err(WorkflowError::Conflict(format!(
                        "a request with idempotency key '{key}' is still in progress"
                    )));
                }
                IdempotencyOutcome::Completed(prior) => {
                    let receipt: OrderReceipt = serde_json::from_value(prior)?;
                    tracing::info!(
                        order_id = %receipt.order_id,
                        "idempotent replay of order creation"
                    );
                    metrics::counter!("orders_replayed_total").increment(1);
                    return Ok(CreateOutcome {
                        receipt,
                        replayed: true,
                    });
                }
            }
        }

        let result = self
            .place_order(customer, customer_info, request, proof, key.clone())
            .await;

        if let Some(ref key) = key {
            match &result {
                Ok(outcome) => {
                    let recorded = serde_json::to_value(&outcome.receipt)?;
                    if let Err(err) = self
                        .stores
                        .idempotency
                        .complete(IdempotencyScope::OrderCreation, key, recorded)
                        .await
                    {
                        // The order carries the key too, so a retry replays it.
                        tracing::warn!(error = %err, "failed to record idempotency result");
                    }
                }
                Err(_) => {
                    if let Err(err) = self
                        .stores
                        .idempotency
                        .release(IdempotencyScope::OrderCreation, key)
                        .await
                    {
                        tracing::error!(error = %err, "failed to release idempotency key");
                    }
                }
            }
        }

        metrics::histogram!("order_creation_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn resolve_customer(
        &self,
        actor: &Actor,
        request: &CreateOrderRequest,
    ) -> Result<(CustomerRef, Option<CustomerInfo>)> {
        let Some(user_id) = actor.user_id() else {
            return Ok((
                CustomerRef::new_guest(Utc::now()),
                request.customer_info.clone(),
            ));
        };

        let profile = tokio::time::timeout(
            self.settings.collaborator_timeout,
            self.auth.profile(user_id),
        )
        .await
        .map_err(|_| WorkflowError::timeout("auth service"))??;

        Ok((
            CustomerRef::User(user_id.clone()),
            profile.or_else(|| request.customer_info.clone()),
        ))
    }

    async fn place_order(
        &self,
        customer: CustomerRef,
        customer_info: Option<CustomerInfo>,
        request: CreateOrderRequest,
        proof: Option<ProofUpload>,
        idempotency_key: Option<String>,
    ) -> Result<CreateOutcome> {
        let method = request.payment_method;
        let total = order_total(&request.items)?;

        let proof = match proof {
            Some(upload) => Some(self.store_proof(upload).await?),
            None => None,
        };

        let reserved = self.stock().reserve(&request.items).await?;

        let new_order = NewOrder {
            customer,
            payment: Payment::initial(
                method,
                total,
                self.settings.currency_for(method),
                idempotency_key.clone(),
                proof,
            ),
            items: request.items,
            shipping_address: request.shipping_address,
            customer_info,
            idempotency_key: idempotency_key.clone(),
            stock_reserved: true,
        };
        let order = match Order::create(new_order, Utc::now()) {
            Ok(order) => order,
            Err(err) => {
                self.stock().release(&reserved).await;
                return Err(err.into());
            }
        };

        if let Err(err) = self.stores.orders.create(&order).await {
            self.stock().release(&reserved).await;

            // Another request with the same key won the race to persist.
            if let (StoreError::DuplicateIdempotencyKey(_), Some(key)) = (&err, &idempotency_key)
                && let Some(existing) = self.stores.orders.find_by_idempotency_key(key).await?
            {
                return Ok(CreateOutcome {
                    receipt: OrderReceipt::from(&existing),
                    replayed: true,
                });
            }
            return Err(err.into());
        }

        metrics::counter!("orders_created_total", "method" => method.as_str()).increment(1);
        tracing::info!(
            order_id = %order.id,
            status = %order.status,
            total = %order.total_amount,
            "order created"
        );

        if let Some(user_id) = order.user_id() {
            self.clear_cart(user_id, &order).await;
        }

        Ok(CreateOutcome {
            receipt: OrderReceipt::from(&order),
            replayed: false,
        })
    }

    async fn store_proof(&self, upload: ProofUpload) -> Result<PaymentProof> {
        let filename = proof_filename(Utc::now());
        let image_ref = tokio::time::timeout(
            self.settings.collaborator_timeout,
            self.proofs.store(upload, &filename),
        )
        .await
        .map_err(|_| WorkflowError::timeout("image store"))??;
        Ok(PaymentProof {
            image_ref,
            filename,
        })
    }

    /// Best effort: the order stands even if the cart keeps its items.
    async fn clear_cart(&self, user_id: &UserId, order: &Order) {
        let skus: Vec<_> = order
            .items
            .iter()
            .map(|item| item.variant_sku.clone())
            .collect();
        let outcome = tokio::time::timeout(
            self.settings.collaborator_timeout,
            self.cart.remove_items(user_id, &skus),
        )
        .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(order_id = %order.id, error = %err, "failed to clear cart")
            }
            Err(_) => tracing::warn!(order_id = %order.id, "cart removal timed out"),
        }
    }

    /// Switches an unpaid order to another payment method.
    ///
    /// The payment sub-record is replaced, the currency follows the new
    /// method and transfer or pay-on-delivery orders move to `placed`. Items
    /// and total stay as they are.
    #[tracing::instrument(skip(self, request), fields(method = request.payment_method.as_str()))]
    pub async fn update_payment(
        &self,
        actor: &Actor,
        order_id: OrderId,
        request: UpdatePaymentRequest,
    ) -> Result<Order> {
        let key = request.idempotency_key.trim().to_string();
        if key.is_empty() {
            return Err(WorkflowError::Validation(
                "an idempotency key is required to update a payment".to_string(),
            ));
        }
        let method = request.payment_method;
        let upload = if method.requires_proof() {
            let encoded = request
                .payment_proof
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .ok_or(domain::OrderError::PaymentProofRequired)?;
            Some(ProofUpload::decode(encoded)?)
        } else {
            None
        };

        let order = self.load_visible(actor, order_id).await?;
        if actor.user_id().is_none() {
            check_guest_email(&order, request.email.as_deref())?;
        }

        if let Some(ref current) = order.payment
            && current.idempotency_key.as_deref() == Some(key.as_str())
            && current.method == method
        {
            tracing::info!(%order_id, "payment update already applied");
            return Ok(order);
        }
        if !matches!(order.status, OrderStatus::Pending | OrderStatus::Placed) {
            return Err(WorkflowError::Conflict(format!(
                "order {order_id} is {} and its payment can no longer be changed",
                order.status
            )));
        }

        let proof = match upload {
            Some(upload) => Some(self.store_proof(upload).await?),
            None => None,
        };
        let currency = self.settings.currency_for(method).to_string();
        let payment = Payment::initial(
            method,
            order.total_amount,
            currency.clone(),
            Some(key.clone()),
            proof,
        );
        let status = if method.requires_online_capture() {
            order.status
        } else {
            OrderStatus::Placed
        };
        let application = PaymentApplication {
            status,
            history_entry: PaymentHistoryEntry {
                timestamp: Utc::now(),
                status: payment.status,
                provider: payment.provider,
                amount: order.total_amount,
                metadata: serde_json::json!({
                    "idempotencyKey": key,
                    "method": method.as_str(),
                }),
                webhook_event: "payment.method_changed".to_string(),
            },
            payment,
            total_amount: order.total_amount,
            currency,
            items: None,
        };
        let updated = self
            .stores
            .orders
            .apply_payment(order.id, order.status, application)
            .await?;

        metrics::counter!("order_payments_updated_total", "method" => method.as_str())
            .increment(1);
        tracing::info!(%order_id, status = %updated.status, "order payment updated");
        Ok(updated)
    }

    /// Loads an order the actor may change and that is still young enough.
    async fn load_modifiable(&self, actor: &Actor, order_id: OrderId) -> Result<Order> {
        let order = self.load_visible(actor, order_id).await?;
        if !order.is_within_window(Utc::now(), self.settings.modification_window) {
            return Err(WorkflowError::Forbidden(format!(
                "order {order_id} is older than {} days and can no longer be changed",
                self.settings.modification_window.num_days()
            )));
        }
        Ok(order)
    }

    async fn load_visible(&self, actor: &Actor, order_id: OrderId) -> Result<Order> {
        let order = self
            .stores
            .orders
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("order {order_id}")))?;
        if !actor.can_access(&order) {
            return Err(WorkflowError::Forbidden(format!(
                "not allowed to access order {order_id}"
            )));
        }
        Ok(order)
    }

    /// Cancels an order and returns its stock.
    ///
    /// Restitution stops at the first failing item and reports what was
    /// already restored; the order then keeps its status.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_order(&self, actor: &Actor, order_id: OrderId) -> Result<Order> {
        let order = self.load_modifiable(actor, order_id).await?;
        if !order.status.can_cancel() {
            return Err(WorkflowError::Conflict(format!(
                "order {order_id} is {} and cannot be cancelled",
                order.status
            )));
        }

        let restored = if order.stock_reserved {
            self.stock().restitute(order.id, &order.items).await?
        } else {
            Vec::new()
        };

        match self
            .stores
            .orders
            .update_status(order.id, order.status, OrderStatus::Cancelled)
            .await
        {
            Ok(cancelled) => {
                metrics::counter!("orders_cancelled_total").increment(1);
                tracing::info!(%order_id, previous = %order.status, "order cancelled");
                Ok(cancelled)
            }
            Err(err) => {
                self.stock().retake(&restored).await;
                Err(err.into())
            }
        }
    }

    /// Removes an order for good, returning its stock unless it was already
    /// cancelled. Admin only.
    #[tracing::instrument(skip(self))]
    pub async fn delete_order(&self, actor: &Actor, order_id: OrderId) -> Result<()> {
        if !actor.is_admin() {
            return Err(WorkflowError::Forbidden(
                "only admins may delete orders".to_string(),
            ));
        }
        let order = self.load_modifiable(actor, order_id).await?;

        let restored = if order.stock_reserved && order.status != OrderStatus::Cancelled {
            self.stock().restitute(order.id, &order.items).await?
        } else {
            Vec::new()
        };

        let created_after = Utc::now() - self.settings.modification_window;
        match self
            .stores
            .orders
            .delete(order.id, order.status, created_after)
            .await
        {
            Ok(()) => {
                metrics::counter!("orders_deleted_total").increment(1);
                tracing::info!(%order_id, status = %order.status, "order deleted");
                Ok(())
            }
            Err(err) => {
                self.stock().retake(&restored).await;
                Err(err.into())
            }
        }
    }

    /// Moves an order along its lifecycle. Admin only. Cancelling goes
    /// through [`Self::cancel_order`] so stock is returned.
    #[tracing::instrument(skip(self))]
    pub async fn update_status(
        &self,
        actor: &Actor,
        order_id: OrderId,
        next: OrderStatus,
    ) -> Result<Order> {
        if !actor.is_admin() {
            return Err(WorkflowError::Forbidden(
                "only admins may change order status".to_string(),
            ));
        }
        if next == OrderStatus::Cancelled {
            return self.cancel_order(actor, order_id).await;
        }

        let order = self.load_visible(actor, order_id).await?;
        if !order.status.can_transition_to(next) {
            return Err(WorkflowError::Conflict(format!(
                "order {order_id} cannot move from {} to {next}",
                order.status
            )));
        }
        let updated = self
            .stores
            .orders
            .update_status(order.id, order.status, next)
            .await?;
        tracing::info!(%order_id, from = %order.status, to = %next, "order status updated");
        Ok(updated)
    }

    pub async fn get_order(&self, actor: &Actor, order_id: OrderId) -> Result<Order> {
        self.load_visible(actor, order_id).await
    }

    /// Lists orders, newest first. Admin only.
    pub async fn list_orders(&self, actor: &Actor, filter: OrderFilter) -> Result<Vec<Order>> {
        if !actor.is_admin() {
            return Err(WorkflowError::Forbidden(
                "only admins may list all orders".to_string(),
            ));
        }
        Ok(self.stores.orders.list(filter).await?)
    }

    /// The signed-in user's own orders, newest first.
    pub async fn list_mine(&self, actor: &Actor) -> Result<Vec<Order>> {
        let user_id = actor
            .user_id()
            .ok_or_else(|| WorkflowError::Forbidden("sign in to list your orders".to_string()))?;
        Ok(self
            .stores
            .orders
            .list(OrderFilter::for_user(user_id.clone()))
            .await?)
    }
}

/// Guests have no session, so the email on the order stands in for one.
fn check_guest_email(order: &Order, email: Option<&str>) -> Result<()> {
    let email = email
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .ok_or_else(|| {
            WorkflowError::Forbidden("guests must give their email to update a payment".into())
        })?;
    let matches = order
        .customer_info
        .as_ref()
        .is_some_and(|info| info.email.trim().eq_ignore_ascii_case(email));
    if !matches {
        return Err(WorkflowError::Forbidden(
            "email does not match the order".to_string(),
        ));
    }
    Ok(())
}

/// Checks the request before any side effect. Returns the decoded proof for
/// transfers.
fn validate_request(actor: &Actor, request: &CreateOrderRequest) -> Result<Option<ProofUpload>> {
    if request.items.is_empty() {
        return Err(domain::OrderError::NoItems.into());
    }
    for (index, item) in request.items.iter().enumerate() {
        item.validate(index)?;
    }
    order_total(&request.items)?;

    if actor.user_id().is_none() {
        let info = request
            .customer_info
            .as_ref()
            .ok_or(domain::OrderError::CustomerInfoRequired)?;
        info.validate()?;
    } else if let Some(ref info) = request.customer_info {
        info.validate()?;
    }

    match request.shipping_address {
        Some(ref address) => address.validate()?,
        None if request.payment_method.requires_shipping_address() => {
            return Err(domain::OrderError::ShippingAddressRequired.into());
        }
        None => {}
    }

    if !request.payment_method.requires_proof() {
        return Ok(None);
    }
    let encoded = request
        .payment_proof
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .ok_or(domain::OrderError::PaymentProofRequired)?;
    ProofUpload::decode(encoded).map(Some)
}
