//! Workflow error types.

use common::{OrderId, ProductId, Sku};
use domain::OrderError;
use store::StoreError;
use thiserror::Error;

/// Errors surfaced by the order workflow and the payment reconciler.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The request is malformed or incomplete. Nothing was mutated.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The target changed underneath the caller, or the requested transition
    /// is not allowed from its current status.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Stock exhausted for {product_id}/{sku}")]
    StockExhausted { product_id: ProductId, sku: Sku },

    #[error("Stock at capacity for {product_id}/{sku}")]
    StockAtCapacity { product_id: ProductId, sku: Sku },

    /// The caller may not perform this operation on this order.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),

    /// A collaborator failed or timed out.
    #[error("{collaborator} failed: {reason}")]
    Upstream {
        collaborator: &'static str,
        reason: String,
    },

    /// Restitution stopped part way. The listed skus were already restored.
    #[error("Restitution for {order_id} stopped at {failed_sku}, restored {restored:?}: {reason}")]
    PartialRestitution {
        order_id: OrderId,
        restored: Vec<Sku>,
        failed_sku: Sku,
        reason: String,
    },

    /// Persistence failed in a way the caller cannot fix.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkflowError {
    pub(crate) fn upstream(collaborator: &'static str, reason: impl ToString) -> Self {
        WorkflowError::Upstream {
            collaborator,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn timeout(collaborator: &'static str) -> Self {
        Self::upstream(collaborator, "timed out")
    }
}

impl From<OrderError> for WorkflowError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::InvalidStateTransition { .. } => WorkflowError::Conflict(err.to_string()),
            other => WorkflowError::Validation(other.to_string()),
        }
    }
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ProductNotFound(_)
            | StoreError::VariantNotFound { .. }
            | StoreError::OrderNotFound(_) => WorkflowError::NotFound(err.to_string()),
            StoreError::StockExhausted { product_id, sku } => {
                WorkflowError::StockExhausted { product_id, sku }
            }
            StoreError::StockAtCapacity { product_id, sku } => {
                WorkflowError::StockAtCapacity { product_id, sku }
            }
            StoreError::ConcurrencyConflict { .. } | StoreError::DuplicateIdempotencyKey(_) => {
                WorkflowError::Conflict(err.to_string())
            }
            StoreError::OutsideModificationWindow(_) => WorkflowError::Forbidden(err.to_string()),
            StoreError::Order(order_err) => order_err.into(),
            StoreError::Inventory(inventory_err) => {
                WorkflowError::Validation(inventory_err.to_string())
            }
            StoreError::Corrupt(_)
            | StoreError::Database(_)
            | StoreError::Migration(_)
            | StoreError::Serialization(_) => WorkflowError::Internal(err.to_string()),
        }
    }
}

/// Convenience type alias for workflow results.
pub type Result<T> = std::result::Result<T, WorkflowError>;
