//! HTTP API server for the storefront order engine.
//!
//! Provides REST endpoints for orders, inventory and payment webhooks,
//! with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod extract;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, patch, post};
use metrics_exporter_prometheus::PrometheusHandle;
use store::Stores;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use workflow::{
    AuthService, CartService, Caller, CheckoutProvider, InMemoryAuthService, InMemoryCartService,
    InMemoryProofStore, InventoryManager, OrderWorkflow, PaymentReconciler, ProofStore,
};

use config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub workflow: OrderWorkflow,
    pub inventory: InventoryManager,
    pub reconciler: PaymentReconciler,
    pub auth: Arc<dyn AuthService>,
}

impl AppState {
    pub fn new(
        stores: Stores,
        auth: Arc<dyn AuthService>,
        cart: Arc<dyn CartService>,
        proofs: Arc<dyn ProofStore>,
        provider: Option<Arc<dyn CheckoutProvider>>,
        config: &Config,
    ) -> Self {
        let workflow = OrderWorkflow::new(
            stores.clone(),
            auth.clone(),
            cart,
            proofs,
            config.workflow_settings(),
        );
        let inventory = InventoryManager::new(stores.ledger.clone());
        let reconciler = PaymentReconciler::new(stores, provider, config.reconciler_settings());
        Self {
            workflow,
            inventory,
            reconciler,
            auth,
        }
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route(
            "/orders",
            post(routes::orders::create).get(routes::orders::list),
        )
        .route("/orders/mine", get(routes::orders::mine))
        .route(
            "/orders/{id}",
            get(routes::orders::get).delete(routes::orders::delete),
        )
        .route("/orders/{id}/cancel", delete(routes::orders::cancel))
        .route("/orders/{id}/status", patch(routes::orders::update_status))
        .route("/orders/{id}/payment", patch(routes::orders::update_payment))
        .route("/inventory", get(routes::inventory::list))
        .route("/inventory/sync", post(routes::inventory::sync))
        .route("/inventory/{product_id}", get(routes::inventory::item))
        .route(
            "/inventory/{product_id}/{sku}",
            get(routes::inventory::variant),
        )
        .route(
            "/inventory/{product_id}/{sku}/stock",
            patch(routes::inventory::adjust_stock),
        )
        .route(
            "/payments/{provider}/webhook",
            post(routes::payments::webhook),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates state over in-memory stores and collaborators.
///
/// Returns the auth service too so callers can register sessions. When
/// `config.admin_token` is set it is registered as an admin session.
pub async fn create_default_state(config: &Config) -> (Arc<AppState>, InMemoryAuthService) {
    create_state(Stores::in_memory(), None, config).await
}

/// Creates state over `stores` with in-memory collaborators.
pub async fn create_state(
    stores: Stores,
    provider: Option<Arc<dyn CheckoutProvider>>,
    config: &Config,
) -> (Arc<AppState>, InMemoryAuthService) {
    let auth = InMemoryAuthService::new();
    if let Some(ref token) = config.admin_token {
        auth.add_session(token.clone(), Caller::admin("admin")).await;
    }
    let state = AppState::new(
        stores,
        Arc::new(auth.clone()),
        Arc::new(InMemoryCartService::new()),
        Arc::new(InMemoryProofStore::new()),
        provider,
        config,
    );
    (Arc::new(state), auth)
}
