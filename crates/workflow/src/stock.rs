//! Multi-item stock moves on top of the single-variant ledger.
//!
//! The ledger adjusts one variant atomically. Reserving or restoring a whole
//! order is a sequence of such calls; these helpers apply the sequence and
//! undo the applied prefix when a later step fails.

use std::time::Duration;

use common::{OrderId, ProductId, Sku};
use domain::OrderItem;
use store::InventoryLedger;

use crate::error::{Result, WorkflowError};

/// Units moved for one variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StockMove {
    pub product_id: ProductId,
    pub sku: Sku,
    pub units: i64,
}

pub(crate) struct StockMover<'a> {
    ledger: &'a dyn InventoryLedger,
    timeout: Duration,
}

impl<'a> StockMover<'a> {
    pub fn new(ledger: &'a dyn InventoryLedger, timeout: Duration) -> Self {
        Self { ledger, timeout }
    }

    /// Applies `delta` and returns the units that actually moved.
    async fn adjust(&self, product_id: &ProductId, sku: &Sku, delta: i64) -> Result<i64> {
        let adjustment =
            tokio::time::timeout(self.timeout, self.ledger.adjust_stock(product_id, sku, delta))
                .await
                .map_err(|_| {
                    // The write may still land after we stop waiting for it.
                    tracing::error!(
                        %product_id,
                        %sku,
                        delta,
                        reconciliation_required = true,
                        "stock adjustment timed out with unknown outcome"
                    );
                    WorkflowError::timeout("inventory ledger")
                })??;
        Ok(adjustment.applied_delta())
    }

    /// Deducts every item's quantity.
    ///
    /// On failure at item k the deductions for items before k are reversed
    /// before the error is returned. A deduction the clamp cut short counts as
    /// exhausted stock.
    pub async fn reserve(&self, items: &[OrderItem]) -> Result<Vec<StockMove>> {
        let mut reserved: Vec<StockMove> = Vec::with_capacity(items.len());

        for item in items {
            let wanted = i64::from(item.quantity);
            let failure = match self.adjust(&item.product_id, &item.variant_sku, -wanted).await {
                Ok(applied) if -applied == wanted => {
                    reserved.push(StockMove {
                        product_id: item.product_id.clone(),
                        sku: item.variant_sku.clone(),
                        units: wanted,
                    });
                    continue;
                }
                Ok(applied) => {
                    reserved.push(StockMove {
                        product_id: item.product_id.clone(),
                        sku: item.variant_sku.clone(),
                        units: -applied,
                    });
                    WorkflowError::StockExhausted {
                        product_id: item.product_id.clone(),
                        sku: item.variant_sku.clone(),
                    }
                }
                Err(err) => err,
            };

            tracing::warn!(
                product_id = %item.product_id,
                sku = %item.variant_sku,
                quantity = item.quantity,
                error = %failure,
                "stock reservation failed, compensating"
            );
            self.release(&reserved).await;
            return Err(failure);
        }

        Ok(reserved)
    }

    /// Returns reserved units to the ledger in reverse order. Failures are
    /// logged for manual reconciliation and otherwise ignored.
    pub async fn release(&self, reserved: &[StockMove]) {
        if reserved.is_empty() {
            return;
        }
        metrics::counter!("order_compensations_total").increment(1);

        for stock_move in reserved.iter().rev().filter(|m| m.units > 0) {
            if let Err(err) = self
                .adjust(&stock_move.product_id, &stock_move.sku, stock_move.units)
                .await
            {
                tracing::error!(
                    product_id = %stock_move.product_id,
                    sku = %stock_move.sku,
                    units = stock_move.units,
                    error = %err,
                    reconciliation_required = true,
                    "compensating stock release failed"
                );
            }
        }
    }

    /// Adds every item's quantity back, stopping at the first failure.
    pub async fn restitute(
        &self,
        order_id: OrderId,
        items: &[OrderItem],
    ) -> Result<Vec<StockMove>> {
        let mut restored: Vec<StockMove> = Vec::with_capacity(items.len());

        for item in items {
            let wanted = i64::from(item.quantity);
            match self.adjust(&item.product_id, &item.variant_sku, wanted).await {
                Ok(applied) => {
                    if applied != wanted {
                        tracing::warn!(
                            %order_id,
                            sku = %item.variant_sku,
                            wanted,
                            applied,
                            "restitution clamped at total stock"
                        );
                    }
                    restored.push(StockMove {
                        product_id: item.product_id.clone(),
                        sku: item.variant_sku.clone(),
                        units: applied,
                    });
                }
                Err(err) => {
                    tracing::error!(
                        %order_id,
                        sku = %item.variant_sku,
                        restored = restored.len(),
                        error = %err,
                        reconciliation_required = true,
                        "stock restitution stopped"
                    );
                    return Err(WorkflowError::PartialRestitution {
                        order_id,
                        restored: restored.into_iter().map(|m| m.sku).collect(),
                        failed_sku: item.variant_sku.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        Ok(restored)
    }

    /// Takes restored units out again after the order write lost a race.
    pub async fn retake(&self, restored: &[StockMove]) {
        for stock_move in restored.iter().rev().filter(|m| m.units > 0) {
            if let Err(err) = self
                .adjust(&stock_move.product_id, &stock_move.sku, -stock_move.units)
                .await
            {
                tracing::error!(
                    product_id = %stock_move.product_id,
                    sku = %stock_move.sku,
                    units = stock_move.units,
                    error = %err,
                    reconciliation_required = true,
                    "reverting restitution failed"
                );
            }
        }
    }
}
