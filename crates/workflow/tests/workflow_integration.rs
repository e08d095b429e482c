//! Integration tests for order creation, cancellation and webhook
//! reconciliation against the in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{OrderId, ProductId, Sku, UserId};
use domain::{
    CatalogProduct, CustomerInfo, CustomerRef, InventoryItem, InventoryVariant, Money, NewOrder,
    Order, OrderItem, OrderStatus, Payment, PaymentMethod, PaymentStatus, PersonName,
    ShippingAddress, SyncMode, SyncReport, order_total,
};
use futures_util::future::join_all;
use serde_json::{Value, json};
use store::{
    DEFAULT_IDEMPOTENCY_LEASE, IdempotencyScope, InMemoryIdempotencyGuard, InMemoryInventoryLedger,
    InMemoryOrderStore, InventoryLedger, OrderFilter, StockAdjustment, Stores,
};
use workflow::signature::{
    PAYPAL_TRANSMISSION_ID_HEADER, PAYPAL_TRANSMISSION_SIG_HEADER,
    PAYPAL_TRANSMISSION_TIME_HEADER, STRIPE_SIGNATURE_HEADER, sign_paypal, sign_stripe,
};
use workflow::{
    AckOutcome, Actor, AuthService, Caller, CreateOrderRequest, InMemoryAuthService,
    InMemoryCartService, InMemoryCheckoutProvider, InMemoryProofStore, InventoryManager, LineItem,
    OrderWorkflow, PaymentReconciler, ReconcilerSettings, UpdatePaymentRequest, WebhookAck,
    WebhookHeaders, WebhookProvider, WorkflowError, WorkflowSettings,
};

const STRIPE_SECRET: &str = "whsec_test";
const PAYPAL_SECRET: &str = "paypal_test";
const PRODUCT: &str = "prod-1";

struct TestHarness {
    workflow: OrderWorkflow,
    reconciler: PaymentReconciler,
    inventory: InventoryManager,
    stores: Stores,
    ledger: InMemoryInventoryLedger,
    auth: InMemoryAuthService,
    cart: InMemoryCartService,
    proofs: InMemoryProofStore,
    provider: InMemoryCheckoutProvider,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_ledger(None, WorkflowSettings::default())
    }

    /// Builds the harness around `ledger` when given, so tests can interpose
    /// a misbehaving ledger in front of the in-memory one.
    fn with_ledger(ledger: Option<Arc<dyn InventoryLedger>>, settings: WorkflowSettings) -> Self {
        let memory_ledger = InMemoryInventoryLedger::new();
        let ledger: Arc<dyn InventoryLedger> = match ledger {
            Some(ledger) => ledger,
            None => Arc::new(memory_ledger.clone()),
        };
        let stores = Stores {
            ledger,
            idempotency: Arc::new(InMemoryIdempotencyGuard::new()),
            orders: Arc::new(InMemoryOrderStore::new()),
        };
        let auth = InMemoryAuthService::new();
        let cart = InMemoryCartService::new();
        let proofs = InMemoryProofStore::new();
        let provider = InMemoryCheckoutProvider::new();

        let workflow = OrderWorkflow::new(
            stores.clone(),
            Arc::new(auth.clone()),
            Arc::new(cart.clone()),
            Arc::new(proofs.clone()),
            settings,
        );
        let reconciler = PaymentReconciler::new(
            stores.clone(),
            Some(Arc::new(provider.clone())),
            ReconcilerSettings {
                stripe_webhook_secret: Some(STRIPE_SECRET.to_string()),
                paypal_webhook_secret: Some(PAYPAL_SECRET.to_string()),
                ..ReconcilerSettings::default()
            },
        );
        let inventory = InventoryManager::new(stores.ledger.clone());

        Self {
            workflow,
            reconciler,
            inventory,
            stores,
            ledger: memory_ledger,
            auth,
            cart,
            proofs,
            provider,
        }
    }

    /// Seeds one product with the given `(sku, total, current)` variants.
    async fn seed(&self, variants: &[(&str, i64, i64)]) {
        self.ledger
            .put_item(InventoryItem {
                product_id: ProductId::new(PRODUCT),
                label: "Tee".into(),
                slug: "tee".into(),
                variants: variants
                    .iter()
                    .map(|(sku, total, current)| {
                        InventoryVariant::new(*sku, *total, 0, Money::from_cents(1000))
                            .with_current_stock(*current)
                    })
                    .collect(),
            })
            .await
            .unwrap();
    }

    async fn stock(&self, sku: &str) -> i64 {
        self.ledger
            .get_variant(&ProductId::new(PRODUCT), &Sku::new(sku))
            .await
            .unwrap()
            .unwrap()
            .current_stock
    }

    async fn order(&self, id: OrderId) -> Order {
        self.stores.orders.find_by_id(id).await.unwrap().unwrap()
    }

    async fn order_count(&self) -> usize {
        self.stores
            .orders
            .list(OrderFilter::default())
            .await
            .unwrap()
            .len()
    }

    async fn place(&self, actor: &Actor, request: CreateOrderRequest) -> OrderId {
        self.workflow
            .create_order(actor, request, None)
            .await
            .unwrap()
            .receipt
            .order_id
    }

    async fn stripe(&self, payload: &Value) -> Result<WebhookAck, WorkflowError> {
        self.stripe_raw(&serde_json::to_vec(payload).unwrap()).await
    }

    async fn stripe_raw(&self, body: &[u8]) -> Result<WebhookAck, WorkflowError> {
        let signature = sign_stripe(body, STRIPE_SECRET, Utc::now().timestamp()).unwrap();
        let headers: WebhookHeaders = [(STRIPE_SIGNATURE_HEADER, signature)].into_iter().collect();
        self.reconciler
            .handle_webhook(WebhookProvider::Stripe, body, &headers)
            .await
    }

    async fn reserve_key(&self, scope: IdempotencyScope, key: &str) {
        self.stores
            .idempotency
            .check_and_reserve(scope, key, DEFAULT_IDEMPOTENCY_LEASE)
            .await
            .unwrap();
    }
}

fn admin() -> Actor {
    Actor::Admin(UserId::new("admin-1"))
}

fn customer() -> Actor {
    Actor::Customer(UserId::new("user-1"))
}

fn item(sku: &str, quantity: u32) -> OrderItem {
    OrderItem::new(PRODUCT, sku, quantity, Money::from_cents(1000))
}

fn info() -> CustomerInfo {
    CustomerInfo {
        name: PersonName {
            first: "Ada".into(),
            last: "Obi".into(),
        },
        email: "ada@example.com".into(),
        phone: None,
    }
}

fn address() -> ShippingAddress {
    ShippingAddress {
        line1: "1 Main St".into(),
        line2: None,
        city: "Lagos".into(),
        state: "LA".into(),
        postal: "100001".into(),
        country: "NG".into(),
    }
}

fn delivery(items: Vec<OrderItem>) -> CreateOrderRequest {
    CreateOrderRequest {
        items,
        payment_method: PaymentMethod::Delivery,
        shipping_address: Some(address()),
        customer_info: Some(info()),
        payment_proof: None,
    }
}

fn card(items: Vec<OrderItem>) -> CreateOrderRequest {
    CreateOrderRequest {
        items,
        payment_method: PaymentMethod::Card,
        shipping_address: None,
        customer_info: Some(info()),
        payment_proof: None,
    }
}

fn checkout_completed(event_id: &str, session_id: &str, order_id: Option<OrderId>) -> Value {
    let mut object = json!({
        "id": session_id,
        "payment_intent": "pi_1",
        "amount_total": 3000,
        "currency": "usd",
        "customer_details": { "email": "ada@example.com", "name": "Ada" },
    });
    if let Some(order_id) = order_id {
        object["metadata"] = json!({ "orderId": order_id.to_string() });
    }
    json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "data": { "object": object },
    })
}

fn with_line_items(mut event: Value, sku: &str, quantity: u32) -> Value {
    event["data"]["object"]["line_items"] = json!({
        "data": [{
            "quantity": quantity,
            "amount_total": 1000 * i64::from(quantity),
            "price": { "product": { "metadata": { "productId": PRODUCT, "variantSku": sku } } }
        }]
    });
    event
}

// --- Order creation ---

#[tokio::test]
async fn test_create_then_cancel_restores_stock() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;

    let outcome = h
        .workflow
        .create_order(&Actor::Anonymous, delivery(vec![item("X", 3)]), None)
        .await
        .unwrap();
    assert!(!outcome.replayed);
    assert_eq!(outcome.receipt.status, OrderStatus::Placed);
    assert_eq!(h.stock("X").await, 2);

    let order = h.order(outcome.receipt.order_id).await;
    assert!(order.stock_reserved);
    assert!(order.customer.is_guest());
    assert_eq!(order.currency, "NGN");

    let cancelled = h
        .workflow
        .cancel_order(&Actor::Anonymous, order.id)
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(h.stock("X").await, 5);
}

#[tokio::test]
async fn test_card_order_starts_pending_in_card_currency() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;

    let outcome = h
        .workflow
        .create_order(&Actor::Anonymous, card(vec![item("X", 1)]), None)
        .await
        .unwrap();
    assert_eq!(outcome.receipt.status, OrderStatus::Pending);
    let payment = outcome.receipt.payment.unwrap();
    assert_eq!(payment.status, PaymentStatus::Initiated);
    assert_eq!(payment.currency, "USD");
}

#[tokio::test]
async fn test_same_idempotency_key_creates_one_order() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;

    let first = h
        .workflow
        .create_order(
            &Actor::Anonymous,
            delivery(vec![item("X", 2)]),
            Some("key-1".to_string()),
        )
        .await
        .unwrap();
    let second = h
        .workflow
        .create_order(
            &Actor::Anonymous,
            delivery(vec![item("X", 2)]),
            Some("key-1".to_string()),
        )
        .await
        .unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.receipt, second.receipt);
    assert_eq!(h.stock("X").await, 3);
    assert_eq!(h.order_count().await, 1);
}

#[tokio::test]
async fn test_concurrent_requests_with_same_key_deduct_once() {
    let h = TestHarness::new();
    h.seed(&[("X", 10, 10)]).await;

    let results = join_all((0..4).map(|_| {
        h.workflow.create_order(
            &Actor::Anonymous,
            delivery(vec![item("X", 2)]),
            Some("shared-key".to_string()),
        )
    }))
    .await;

    let created = results
        .iter()
        .filter(|r| matches!(r, Ok(outcome) if !outcome.replayed))
        .count();
    assert_eq!(created, 1);
    for result in &results {
        assert!(matches!(result, Ok(_) | Err(WorkflowError::Conflict(_))));
    }
    assert_eq!(h.stock("X").await, 8);
    assert_eq!(h.order_count().await, 1);
}

#[tokio::test]
async fn test_contended_last_unit_sells_once() {
    let h = TestHarness::new();
    h.seed(&[("X", 1, 1)]).await;

    let results = join_all(
        (0..2).map(|_| {
            h.workflow
                .create_order(&Actor::Anonymous, delivery(vec![item("X", 1)]), None)
        }),
    )
    .await;

    let placed = results.iter().filter(|r| r.is_ok()).count();
    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(WorkflowError::StockExhausted { .. })))
        .count();
    assert_eq!(placed, 1);
    assert_eq!(exhausted, 1);
    assert_eq!(h.stock("X").await, 0);
    assert_eq!(h.order_count().await, 1);
}

#[tokio::test]
async fn test_failed_reservation_releases_earlier_items() {
    let h = TestHarness::new();
    h.seed(&[("A", 10, 10), ("B", 10, 0)]).await;

    let err = h
        .workflow
        .create_order(
            &Actor::Anonymous,
            delivery(vec![item("A", 4), item("B", 1)]),
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::StockExhausted { ref sku, .. } if sku.as_str() == "B"));
    assert_eq!(h.stock("A").await, 10);
    assert_eq!(h.order_count().await, 0);
}

#[tokio::test]
async fn test_failed_request_frees_its_idempotency_key() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 0)]).await;

    let key = Some("retry-me".to_string());
    let err = h
        .workflow
        .create_order(&Actor::Anonymous, delivery(vec![item("X", 1)]), key.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::StockExhausted { .. }));

    h.inventory
        .adjust_stock(&admin(), &ProductId::new(PRODUCT), &Sku::new("X"), 3)
        .await
        .unwrap();
    let outcome = h
        .workflow
        .create_order(&Actor::Anonymous, delivery(vec![item("X", 1)]), key)
        .await
        .unwrap();
    assert!(!outcome.replayed);
    assert_eq!(h.stock("X").await, 2);
}

#[tokio::test]
async fn test_key_left_in_flight_replays_the_stored_order() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;

    // The order was written but the key was never marked complete.
    let key = "lost-completion";
    h.reserve_key(IdempotencyScope::OrderCreation, key).await;
    let items = vec![item("X", 2)];
    let new = NewOrder {
        customer: CustomerRef::new_guest(Utc::now()),
        payment: Payment::initial(
            PaymentMethod::Delivery,
            order_total(&items).unwrap(),
            "NGN",
            Some(key.to_string()),
            None,
        ),
        items,
        shipping_address: Some(address()),
        customer_info: Some(info()),
        idempotency_key: Some(key.to_string()),
        stock_reserved: true,
    };
    let stored = Order::create(new, Utc::now()).unwrap();
    h.stores.orders.create(&stored).await.unwrap();

    let outcome = h
        .workflow
        .create_order(
            &Actor::Anonymous,
            delivery(vec![item("X", 2)]),
            Some(key.to_string()),
        )
        .await
        .unwrap();
    assert!(outcome.replayed);
    assert_eq!(outcome.receipt.order_id, stored.id);
    assert_eq!(h.order_count().await, 1);
    assert_eq!(h.stock("X").await, 5);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_key_is_taken_over_after_lease() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;

    let key = "crashed-request";
    h.reserve_key(IdempotencyScope::OrderCreation, key).await;
    let err = h
        .workflow
        .create_order(
            &Actor::Anonymous,
            delivery(vec![item("X", 1)]),
            Some(key.to_string()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Conflict(_)));
    assert_eq!(h.order_count().await, 0);

    tokio::time::advance(DEFAULT_IDEMPOTENCY_LEASE + Duration::from_secs(1)).await;
    let outcome = h
        .workflow
        .create_order(
            &Actor::Anonymous,
            delivery(vec![item("X", 1)]),
            Some(key.to_string()),
        )
        .await
        .unwrap();
    assert!(!outcome.replayed);
    assert_eq!(h.stock("X").await, 4);
}

#[tokio::test]
async fn test_overflowing_total_is_rejected_before_stock_moves() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;

    let huge = OrderItem::new(PRODUCT, "X", 2, Money::from_cents(i64::MAX / 2 + 1));
    let err = h
        .workflow
        .create_order(&Actor::Anonymous, delivery(vec![huge]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));
    assert_eq!(h.stock("X").await, 5);
    assert_eq!(h.order_count().await, 0);
}

#[tokio::test]
async fn test_transfer_order_stores_proof() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;

    let mut request = delivery(vec![item("X", 1)]);
    request.payment_method = PaymentMethod::Transfer;
    request.payment_proof = Some("data:image/png;base64,aGVsbG8=".to_string());

    let order_id = h.place(&Actor::Anonymous, request).await;
    let order = h.order(order_id).await;
    let proof = order.payment.unwrap().proof.unwrap();

    assert_eq!(proof.image_ref, "IMG-0001");
    assert!(proof.filename.starts_with("payment-proof-"));
    let (filename, upload) = h.proofs.image("IMG-0001").await.unwrap();
    assert_eq!(filename, proof.filename);
    assert_eq!(upload.bytes, b"hello");
}

#[tokio::test]
async fn test_proof_upload_failure_leaves_stock_untouched() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    h.proofs.set_fail_on_store(true).await;

    let mut request = delivery(vec![item("X", 2)]);
    request.payment_method = PaymentMethod::Transfer;
    request.payment_proof = Some("aGVsbG8=".to_string());

    let err = h
        .workflow
        .create_order(&Actor::Anonymous, request, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Upstream { .. }));
    assert_eq!(h.stock("X").await, 5);
    assert_eq!(h.order_count().await, 0);
}

#[tokio::test]
async fn test_registered_user_gets_profile_and_cart_cleared() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5), ("Y", 5, 5)]).await;
    let user_id = UserId::new("user-1");
    let mut profile = info();
    profile.email = "profile@example.com".into();
    h.auth.add_profile(user_id.clone(), profile).await;
    h.cart.add_item(&user_id, "X").await;
    h.cart.add_item(&user_id, "Y").await;

    let mut request = delivery(vec![item("X", 1)]);
    request.customer_info = None;
    let order_id = h.place(&customer(), request).await;

    let order = h.order(order_id).await;
    assert!(order.is_owned_by(&user_id));
    assert_eq!(order.customer_info.unwrap().email, "profile@example.com");
    assert_eq!(h.cart.cart(&user_id).await, vec![Sku::new("Y")]);

    let mine = h.workflow.list_mine(&customer()).await.unwrap();
    assert_eq!(mine.len(), 1);
}

#[tokio::test]
async fn test_cart_failure_does_not_fail_the_order() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    h.cart.set_fail_on_remove(true).await;

    let outcome = h
        .workflow
        .create_order(&customer(), delivery(vec![item("X", 1)]), None)
        .await;
    assert!(outcome.is_ok());
    assert_eq!(h.stock("X").await, 4);
}

#[tokio::test(start_paused = true)]
async fn test_slow_profile_lookup_times_out_before_stock_moves() {
    let settings = WorkflowSettings {
        collaborator_timeout: Duration::from_millis(100),
        ..WorkflowSettings::default()
    };
    let h = TestHarness::with_ledger(None, settings);
    h.seed(&[("X", 5, 5)]).await;
    h.auth
        .set_profile_delay(Some(Duration::from_secs(30)))
        .await;

    let err = h
        .workflow
        .create_order(&customer(), delivery(vec![item("X", 1)]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Upstream { .. }));
    assert_eq!(h.stock("X").await, 5);
}

/// Delays adjustments of one sku long enough to trip the timeout.
struct SlowLedger {
    inner: InMemoryInventoryLedger,
    slow_sku: Sku,
}

#[async_trait]
impl InventoryLedger for SlowLedger {
    async fn adjust_stock(
        &self,
        product_id: &ProductId,
        sku: &Sku,
        delta: i64,
    ) -> store::Result<StockAdjustment> {
        if *sku == self.slow_sku {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.inner.adjust_stock(product_id, sku, delta).await
    }

    async fn get_item(&self, product_id: &ProductId) -> store::Result<Option<InventoryItem>> {
        self.inner.get_item(product_id).await
    }

    async fn get_variant(
        &self,
        product_id: &ProductId,
        sku: &Sku,
    ) -> store::Result<Option<InventoryVariant>> {
        self.inner.get_variant(product_id, sku).await
    }

    async fn list_items(&self) -> store::Result<Vec<InventoryItem>> {
        self.inner.list_items().await
    }

    async fn sync_catalog(
        &self,
        products: Vec<CatalogProduct>,
        mode: SyncMode,
    ) -> store::Result<SyncReport> {
        self.inner.sync_catalog(products, mode).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_ledger_timeout_releases_completed_reservations() {
    let inner = InMemoryInventoryLedger::new();
    let slow = SlowLedger {
        inner: inner.clone(),
        slow_sku: Sku::new("B"),
    };
    let settings = WorkflowSettings {
        collaborator_timeout: Duration::from_millis(100),
        ..WorkflowSettings::default()
    };
    let mut h = TestHarness::with_ledger(Some(Arc::new(slow)), settings);
    h.ledger = inner;
    h.seed(&[("A", 10, 10), ("B", 10, 10)]).await;

    let err = h
        .workflow
        .create_order(
            &Actor::Anonymous,
            delivery(vec![item("A", 2), item("B", 1)]),
            None,
        )
        .await
        .unwrap_err();

    let WorkflowError::Upstream { collaborator, .. } = err else {
        panic!("expected upstream error, got {err:?}");
    };
    assert_eq!(collaborator, "inventory ledger");
    assert_eq!(h.stock("A").await, 10);
    assert_eq!(h.stock("B").await, 10);
    assert_eq!(h.order_count().await, 0);
}

// --- Cancellation and deletion ---

async fn insert_aged_order(h: &TestHarness, age: chrono::Duration, sku: &str) -> OrderId {
    let items = vec![item(sku, 1)];
    let new = NewOrder {
        customer: CustomerRef::new_guest(Utc::now()),
        payment: Payment::initial(
            PaymentMethod::Delivery,
            order_total(&items).unwrap(),
            "NGN",
            None,
            None,
        ),
        items,
        shipping_address: Some(address()),
        customer_info: Some(info()),
        idempotency_key: None,
        stock_reserved: true,
    };
    let order = Order::create(new, Utc::now() - age).unwrap();
    h.stores.orders.create(&order).await.unwrap();
    order.id
}

#[tokio::test]
async fn test_cancel_outside_window_is_forbidden() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 4)]).await;
    let order_id = insert_aged_order(&h, chrono::Duration::days(5), "X").await;

    let err = h
        .workflow
        .cancel_order(&Actor::Anonymous, order_id)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Forbidden(_)));
    assert_eq!(h.stock("X").await, 4);
    assert_eq!(h.order(order_id).await.status, OrderStatus::Placed);

    let err = h.workflow.delete_order(&admin(), order_id).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Forbidden(_)));
    assert_eq!(h.order_count().await, 1);
}

#[tokio::test]
async fn test_cancel_inside_window_succeeds() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 4)]).await;
    let order_id = insert_aged_order(&h, chrono::Duration::days(3), "X").await;

    h.workflow
        .cancel_order(&Actor::Anonymous, order_id)
        .await
        .unwrap();
    assert_eq!(h.stock("X").await, 5);
}

#[tokio::test]
async fn test_second_cancel_conflicts_and_restores_nothing() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    let order_id = h
        .place(&Actor::Anonymous, delivery(vec![item("X", 2)]))
        .await;

    h.workflow
        .cancel_order(&Actor::Anonymous, order_id)
        .await
        .unwrap();
    let err = h
        .workflow
        .cancel_order(&Actor::Anonymous, order_id)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Conflict(_)));
    assert_eq!(h.stock("X").await, 5);
}

#[tokio::test]
async fn test_cancel_missing_order_is_not_found() {
    let h = TestHarness::new();
    let err = h
        .workflow
        .cancel_order(&admin(), OrderId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::NotFound(_)));
}

#[tokio::test]
async fn test_users_cannot_cancel_each_others_orders() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    let order_id = h.place(&customer(), delivery(vec![item("X", 1)])).await;

    let stranger = Actor::Customer(UserId::new("user-2"));
    for actor in [stranger, Actor::Anonymous] {
        let err = h.workflow.cancel_order(&actor, order_id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Forbidden(_)));
    }
    assert_eq!(h.stock("X").await, 4);

    h.workflow.cancel_order(&admin(), order_id).await.unwrap();
    assert_eq!(h.stock("X").await, 5);
}

#[tokio::test]
async fn test_delete_restores_stock_and_removes_order() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    let order_id = h
        .place(&Actor::Anonymous, delivery(vec![item("X", 3)]))
        .await;

    let err = h
        .workflow
        .delete_order(&customer(), order_id)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Forbidden(_)));

    h.workflow.delete_order(&admin(), order_id).await.unwrap();
    assert_eq!(h.stock("X").await, 5);
    assert!(matches!(
        h.workflow.get_order(&admin(), order_id).await,
        Err(WorkflowError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_deleting_cancelled_order_does_not_restore_twice() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    let order_id = h
        .place(&Actor::Anonymous, delivery(vec![item("X", 2)]))
        .await;

    h.workflow.cancel_order(&admin(), order_id).await.unwrap();
    h.inventory
        .adjust_stock(&admin(), &ProductId::new(PRODUCT), &Sku::new("X"), -1)
        .await
        .unwrap();
    h.workflow.delete_order(&admin(), order_id).await.unwrap();
    assert_eq!(h.stock("X").await, 4);
}

#[tokio::test]
async fn test_status_updates_follow_lifecycle() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    let order_id = h
        .place(&Actor::Anonymous, delivery(vec![item("X", 1)]))
        .await;

    let err = h
        .workflow
        .update_status(&admin(), order_id, OrderStatus::Shipped)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Conflict(_)));

    let err = h
        .workflow
        .update_status(&customer(), order_id, OrderStatus::Paid)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Forbidden(_)));

    let paid = h
        .workflow
        .update_status(&admin(), order_id, OrderStatus::Paid)
        .await
        .unwrap();
    assert_eq!(paid.status, OrderStatus::Paid);

    let cancelled = h
        .workflow
        .update_status(&admin(), order_id, OrderStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(h.stock("X").await, 5);
}

// --- Payment updates ---

fn payment_change(method: PaymentMethod, key: &str, email: Option<&str>) -> UpdatePaymentRequest {
    UpdatePaymentRequest {
        payment_method: method,
        idempotency_key: key.to_string(),
        payment_proof: None,
        email: email.map(String::from),
    }
}

#[tokio::test]
async fn test_guest_switches_card_order_to_transfer() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    let order_id = h.place(&Actor::Anonymous, card(vec![item("X", 1)])).await;

    let mut change = payment_change(PaymentMethod::Transfer, "pay-1", Some("ADA@example.com"));
    change.payment_proof = Some("data:image/png;base64,aGVsbG8=".to_string());
    let order = h
        .workflow
        .update_payment(&Actor::Anonymous, order_id, change.clone())
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Placed);
    assert_eq!(order.currency, "NGN");
    assert_eq!(order.total_amount, Money::from_cents(1000));
    assert_eq!(order.items, vec![item("X", 1)]);
    let payment = order.payment.clone().unwrap();
    assert_eq!(payment.method, PaymentMethod::Transfer);
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.idempotency_key.as_deref(), Some("pay-1"));
    assert_eq!(payment.proof.unwrap().image_ref, "IMG-0001");
    assert_eq!(order.payment_history.len(), 1);
    assert_eq!(h.stock("X").await, 4);

    // Same attempt again: nothing new is stored.
    let again = h
        .workflow
        .update_payment(&Actor::Anonymous, order_id, change)
        .await
        .unwrap();
    assert_eq!(again, order);
    assert_eq!(h.proofs.image_count().await, 1);
}

#[tokio::test]
async fn test_guest_payment_update_needs_matching_email() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    let order_id = h.place(&Actor::Anonymous, card(vec![item("X", 1)])).await;

    for email in [None, Some("eve@example.com")] {
        let err = h
            .workflow
            .update_payment(
                &Actor::Anonymous,
                order_id,
                payment_change(PaymentMethod::Delivery, "pay-1", email),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Forbidden(_)));
    }
    let order = h.order(order_id).await;
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment.unwrap().method, PaymentMethod::Card);
}

#[tokio::test]
async fn test_user_switches_own_order_without_email() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    let order_id = h.place(&customer(), card(vec![item("X", 1)])).await;

    let err = h
        .workflow
        .update_payment(
            &Actor::Customer(UserId::new("user-2")),
            order_id,
            payment_change(PaymentMethod::Delivery, "pay-1", None),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Forbidden(_)));

    let order = h
        .workflow
        .update_payment(
            &customer(),
            order_id,
            payment_change(PaymentMethod::Delivery, "pay-1", None),
        )
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Placed);
    assert_eq!(order.payment.unwrap().method, PaymentMethod::Delivery);
}

#[tokio::test]
async fn test_payment_update_rejections() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    let order_id = h.place(&Actor::Anonymous, card(vec![item("X", 1)])).await;
    let email = Some("ada@example.com");

    let err = h
        .workflow
        .update_payment(
            &Actor::Anonymous,
            order_id,
            payment_change(PaymentMethod::Transfer, "pay-1", email),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));

    let err = h
        .workflow
        .update_payment(
            &Actor::Anonymous,
            order_id,
            payment_change(PaymentMethod::Delivery, "  ", email),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));

    h.stripe(&checkout_completed("evt_1", "cs_1", Some(order_id)))
        .await
        .unwrap();
    let err = h
        .workflow
        .update_payment(
            &Actor::Anonymous,
            order_id,
            payment_change(PaymentMethod::Delivery, "pay-2", email),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Conflict(_)));
    assert_eq!(h.order(order_id).await.status, OrderStatus::Paid);
}

// --- Inventory ---

#[tokio::test]
async fn test_manual_adjustments_respect_bounds() {
    let h = TestHarness::new();
    h.seed(&[("LOW", 5, 0), ("FULL", 5, 5)]).await;
    let product_id = ProductId::new(PRODUCT);

    let err = h
        .inventory
        .adjust_stock(&admin(), &product_id, &Sku::new("LOW"), -1)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::StockExhausted { .. }));

    let err = h
        .inventory
        .adjust_stock(&admin(), &product_id, &Sku::new("FULL"), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::StockAtCapacity { .. }));

    let clamped = h
        .inventory
        .adjust_stock(&admin(), &product_id, &Sku::new("LOW"), 50)
        .await
        .unwrap();
    assert_eq!(clamped.variant.current_stock, 5);
}

#[tokio::test]
async fn test_stock_stays_within_bounds_under_mixed_load() {
    let h = TestHarness::new();
    h.seed(&[("X", 6, 6)]).await;

    let creates = join_all((0..10).map(|_| {
        h.workflow
            .create_order(&Actor::Anonymous, delivery(vec![item("X", 1)]), None)
    }))
    .await;
    let placed: Vec<OrderId> = creates
        .into_iter()
        .filter_map(|r| r.ok().map(|o| o.receipt.order_id))
        .collect();
    assert_eq!(placed.len(), 6);
    assert_eq!(h.stock("X").await, 0);

    join_all(
        placed
            .iter()
            .take(3)
            .map(|id| h.workflow.cancel_order(&Actor::Anonymous, *id)),
    )
    .await;
    let current = h.stock("X").await;
    assert_eq!(current, 3);

    let variant = h
        .inventory
        .get_variant(&ProductId::new(PRODUCT), &Sku::new("X"))
        .await
        .unwrap();
    assert!(variant.current_stock >= variant.stock_threshold);
    assert!(variant.current_stock <= variant.total_stock);
}

// --- Webhooks ---

#[tokio::test]
async fn test_checkout_webhook_marks_order_paid_once() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    let order_id = h.place(&Actor::Anonymous, card(vec![item("X", 3)])).await;

    let event = checkout_completed("evt_1", "cs_1", Some(order_id));
    let ack = h.stripe(&event).await.unwrap();
    assert_eq!(ack.outcome, AckOutcome::Applied);
    assert_eq!(ack.order_id, Some(order_id));

    let replay = h.stripe(&event).await.unwrap();
    assert_eq!(replay.outcome, AckOutcome::Duplicate);

    let redelivery = h
        .stripe(&checkout_completed("evt_2", "cs_1", Some(order_id)))
        .await
        .unwrap();
    assert_eq!(redelivery.outcome, AckOutcome::AlreadyApplied);

    let order = h.order(order_id).await;
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.payment_history.len(), 1);
    assert_eq!(order.payment_history[0].metadata["rawEvent"], event);
    assert_eq!(order.total_amount, Money::from_cents(3000));
    let payment = order.payment.unwrap();
    assert_eq!(payment.status, PaymentStatus::Paid);
    assert_eq!(payment.provider_checkout_session_id.as_deref(), Some("cs_1"));
    assert_eq!(payment.provider_payment_id.as_deref(), Some("pi_1"));
    assert!(payment.paid_at.is_some());
    assert_eq!(h.stock("X").await, 2);
}

#[tokio::test]
async fn test_tampered_webhook_changes_nothing() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    let order_id = h.place(&Actor::Anonymous, card(vec![item("X", 1)])).await;

    let body = serde_json::to_vec(&checkout_completed("evt_1", "cs_1", Some(order_id))).unwrap();
    let signature = sign_stripe(&body, STRIPE_SECRET, Utc::now().timestamp()).unwrap();
    let mut tampered = body.clone();
    tampered.extend_from_slice(b" ");
    let headers: WebhookHeaders = [(STRIPE_SIGNATURE_HEADER, signature)].into_iter().collect();

    let err = h
        .reconciler
        .handle_webhook(WebhookProvider::Stripe, &tampered, &headers)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidSignature(_)));

    let err = h
        .reconciler
        .handle_webhook(WebhookProvider::Stripe, &body, &WebhookHeaders::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidSignature(_)));

    assert_eq!(h.order(order_id).await.status, OrderStatus::Pending);

    // The rejected deliveries did not consume the event id.
    let ack = h
        .stripe(&checkout_completed("evt_1", "cs_1", Some(order_id)))
        .await
        .unwrap();
    assert_eq!(ack.outcome, AckOutcome::Applied);
}

#[tokio::test]
async fn test_checkout_for_cancelled_order_is_ignored() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    let order_id = h.place(&Actor::Anonymous, card(vec![item("X", 1)])).await;
    h.workflow
        .cancel_order(&Actor::Anonymous, order_id)
        .await
        .unwrap();

    let ack = h
        .stripe(&checkout_completed("evt_1", "cs_1", Some(order_id)))
        .await
        .unwrap();
    assert_eq!(ack.outcome, AckOutcome::Ignored);
    assert_eq!(h.order(order_id).await.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn test_unmatched_checkout_creates_paid_guest_order() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;

    let event = with_line_items(checkout_completed("evt_1", "cs_new", None), "X", 2);
    let ack = h.stripe(&event).await.unwrap();
    assert_eq!(ack.outcome, AckOutcome::Created);

    let order = h.order(ack.order_id.unwrap()).await;
    assert_eq!(order.status, OrderStatus::Paid);
    assert!(order.customer.is_guest());
    assert!(order.stock_reserved);
    assert_eq!(order.total_amount, Money::from_cents(3000));
    assert_eq!(order.payment_history.len(), 1);
    assert_eq!(order.customer_info.unwrap().email, "ada@example.com");
    assert_eq!(h.stock("X").await, 3);

    let again = with_line_items(checkout_completed("evt_2", "cs_new", None), "X", 2);
    let ack = h.stripe(&again).await.unwrap();
    assert_eq!(ack.outcome, AckOutcome::AlreadyApplied);
    assert_eq!(h.order_count().await, 1);
    assert_eq!(h.stock("X").await, 3);
}

#[tokio::test]
async fn test_fallback_order_prefers_provider_line_items() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5), ("Y", 5, 5)]).await;
    h.provider
        .add_session(
            "cs_lookup",
            vec![LineItem {
                product_id: Some(ProductId::new(PRODUCT)),
                variant_sku: Some(Sku::new("Y")),
                quantity: 1,
                amount_total: Money::from_cents(3000),
            }],
        )
        .await;

    let event = with_line_items(checkout_completed("evt_1", "cs_lookup", None), "X", 1);
    let ack = h.stripe(&event).await.unwrap();
    assert_eq!(ack.outcome, AckOutcome::Created);
    assert_eq!(h.stock("X").await, 5);
    assert_eq!(h.stock("Y").await, 4);
}

#[tokio::test]
async fn test_checkout_without_items_or_order_is_unmatched() {
    let h = TestHarness::new();

    let ack = h
        .stripe(&checkout_completed("evt_1", "cs_orphan", None))
        .await
        .unwrap();
    assert_eq!(ack.outcome, AckOutcome::Unmatched);
    assert_eq!(h.order_count().await, 0);
}

#[tokio::test]
async fn test_refund_updates_payment_but_not_status() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    let order_id = h.place(&Actor::Anonymous, card(vec![item("X", 1)])).await;
    h.stripe(&checkout_completed("evt_1", "cs_1", Some(order_id)))
        .await
        .unwrap();

    let refund = json!({
        "id": "evt_refund",
        "type": "charge.refunded",
        "data": { "object": {
            "payment_intent": "pi_1",
            "amount_refunded": 3000,
            "metadata": { "orderId": order_id.to_string() },
        } },
    });
    let ack = h.stripe(&refund).await.unwrap();
    assert_eq!(ack.outcome, AckOutcome::Applied);

    let order = h.order(order_id).await;
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.payment.unwrap().status, PaymentStatus::Refunded);
    assert_eq!(order.payment_history.len(), 2);
    assert_eq!(order.payment_history[1].status, PaymentStatus::Refunded);
    assert_eq!(order.payment_history[1].webhook_event, "charge.refunded");
}

#[tokio::test]
async fn test_unhandled_event_type_is_acknowledged() {
    let h = TestHarness::new();
    let ack = h
        .stripe(&json!({ "id": "evt_x", "type": "customer.created", "data": {} }))
        .await
        .unwrap();
    assert_eq!(ack.outcome, AckOutcome::Ignored);
}

#[tokio::test]
async fn test_checkout_keeps_items_of_reserved_order() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    let order_id = h.place(&Actor::Anonymous, card(vec![item("X", 3)])).await;
    assert_eq!(h.stock("X").await, 2);

    let event = with_line_items(checkout_completed("evt_1", "cs_1", Some(order_id)), "X", 1);
    let ack = h.stripe(&event).await.unwrap();
    assert_eq!(ack.outcome, AckOutcome::Applied);

    let order = h.order(order_id).await;
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.items, vec![item("X", 3)]);

    h.workflow
        .cancel_order(&Actor::Anonymous, order_id)
        .await
        .unwrap();
    assert_eq!(h.stock("X").await, 5);
}

#[tokio::test]
async fn test_signed_but_unusable_payload_is_acknowledged() {
    let h = TestHarness::new();
    let payloads = [
        json!({ "type": "checkout.session.completed", "data": {} }),
        json!({ "id": "evt_1", "data": {} }),
        json!({ "id": "evt_2", "type": "checkout.session.completed", "data": { "object": {} } }),
    ];
    for payload in &payloads {
        let ack = h.stripe(payload).await.unwrap();
        assert_eq!(ack.outcome, AckOutcome::Ignored);
        assert_eq!(ack.order_id, None);
    }
    let ack = h.stripe_raw(b"not json").await.unwrap();
    assert_eq!(ack.outcome, AckOutcome::Ignored);
    assert_eq!(h.order_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_webhook_in_progress_is_not_acked_until_lease_expires() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    let order_id = h.place(&Actor::Anonymous, card(vec![item("X", 1)])).await;

    // Another delivery of the same event holds the key and never finishes.
    h.reserve_key(IdempotencyScope::PaymentEvent, "stripe:evt_1").await;
    let event = checkout_completed("evt_1", "cs_1", Some(order_id));
    let err = h.stripe(&event).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Conflict(_)));
    assert_eq!(h.order(order_id).await.status, OrderStatus::Pending);

    tokio::time::advance(DEFAULT_IDEMPOTENCY_LEASE + Duration::from_secs(1)).await;
    let ack = h.stripe(&event).await.unwrap();
    assert_eq!(ack.outcome, AckOutcome::Applied);
    assert_eq!(h.order(order_id).await.status, OrderStatus::Paid);

    let replay = h.stripe(&event).await.unwrap();
    assert_eq!(replay.outcome, AckOutcome::Duplicate);
}

#[tokio::test]
async fn test_paypal_capture_marks_order_paid() {
    let h = TestHarness::new();
    h.seed(&[("X", 5, 5)]).await;
    let order_id = h.place(&Actor::Anonymous, card(vec![item("X", 1)])).await;

    let body = serde_json::to_vec(&json!({
        "id": "WH-1",
        "event_type": "PAYMENT.CAPTURE.COMPLETED",
        "resource": {
            "id": "CAP-1",
            "custom_id": order_id.to_string(),
            "amount": { "value": "10.00", "currency_code": "USD" },
            "supplementary_data": { "related_ids": { "order_id": "PP-1" } }
        }
    }))
    .unwrap();
    let time = Utc::now().to_rfc3339();
    let signature = sign_paypal(&body, "tx-1", &time, PAYPAL_SECRET).unwrap();
    let headers: WebhookHeaders = [
        (PAYPAL_TRANSMISSION_ID_HEADER, "tx-1".to_string()),
        (PAYPAL_TRANSMISSION_TIME_HEADER, time),
        (PAYPAL_TRANSMISSION_SIG_HEADER, signature),
    ]
    .into_iter()
    .collect();

    let ack = h
        .reconciler
        .handle_webhook(WebhookProvider::Paypal, &body, &headers)
        .await
        .unwrap();
    assert_eq!(ack.outcome, AckOutcome::Applied);

    let order = h.order(order_id).await;
    assert_eq!(order.status, OrderStatus::Paid);
    let payment = order.payment.unwrap();
    assert_eq!(payment.provider_checkout_session_id.as_deref(), Some("PP-1"));
    assert_eq!(payment.amount, Money::from_cents(1000));
}

#[tokio::test]
async fn test_session_callers_resolve_to_actors() {
    let h = TestHarness::new();
    h.auth.add_session("tok-admin", Caller::admin("admin-1")).await;

    let caller = h.auth.authenticate("tok-admin").await.unwrap();
    assert!(Actor::from(caller).is_admin());
    let nobody = h.auth.authenticate("unknown").await.unwrap();
    assert_eq!(Actor::from(nobody), Actor::Anonymous);
}
