//! Order lifecycle and payment reconciliation for the storefront.
//!
//! Two entry points sit on top of the stores:
//! - [`OrderWorkflow`]: order creation (stock reservation with compensation,
//!   idempotency keys), cancellation and deletion (stock restitution inside
//!   the modification window)
//! - [`PaymentReconciler`]: signed provider webhooks mapped onto orders,
//!   applied at most once per event
//!
//! External collaborators (auth, cart, image store, provider API) are traits
//! in [`services`] with in-memory implementations for tests.

pub mod error;
pub mod inventory;
pub mod order_workflow;
pub mod reconciler;
pub mod services;
pub mod settings;
pub mod signature;
mod stock;
pub mod webhook;

pub use error::{Result, WorkflowError};
pub use inventory::InventoryManager;
pub use order_workflow::{
    Actor, CreateOrderRequest, CreateOutcome, OrderReceipt, OrderWorkflow, UpdatePaymentRequest,
};
pub use reconciler::{AckOutcome, PaymentReconciler, WebhookAck, WebhookHeaders};
pub use services::{
    AuthService, CartService, Caller, CheckoutProvider, InMemoryAuthService, InMemoryCartService,
    InMemoryCheckoutProvider, InMemoryProofStore, ProofStore, Role, StripeClient,
};
pub use settings::{ReconcilerSettings, WorkflowSettings};
pub use signature::SignatureError;
pub use webhook::{LineItem, WebhookProvider};
