//! Inventory reads and admin writes over the ledger.

use std::sync::Arc;

use common::{ProductId, Sku};
use domain::{CatalogProduct, InventoryItem, InventoryVariant, SyncMode, SyncReport};
use store::{InventoryLedger, StockAdjustment};

use crate::error::{Result, WorkflowError};
use crate::order_workflow::Actor;

#[derive(Clone)]
pub struct InventoryManager {
    ledger: Arc<dyn InventoryLedger>,
}

impl InventoryManager {
    pub fn new(ledger: Arc<dyn InventoryLedger>) -> Self {
        Self { ledger }
    }

    fn require_admin(actor: &Actor, action: &str) -> Result<()> {
        if actor.is_admin() {
            Ok(())
        } else {
            Err(WorkflowError::Forbidden(format!("only admins may {action}")))
        }
    }

    /// Applies a manual stock correction through the ledger.
    #[tracing::instrument(skip(self))]
    pub async fn adjust_stock(
        &self,
        actor: &Actor,
        product_id: &ProductId,
        sku: &Sku,
        delta: i64,
    ) -> Result<StockAdjustment> {
        Self::require_admin(actor, "adjust stock")?;
        let adjustment = self.ledger.adjust_stock(product_id, sku, delta).await?;
        tracing::info!(
            %product_id,
            %sku,
            delta,
            previous = adjustment.previous_stock,
            current = adjustment.variant.current_stock,
            "stock adjusted"
        );
        Ok(adjustment)
    }

    /// Merges catalog products into the inventory.
    #[tracing::instrument(skip(self, products), fields(products = products.len()))]
    pub async fn sync_catalog(
        &self,
        actor: &Actor,
        products: Vec<CatalogProduct>,
        mode: SyncMode,
    ) -> Result<SyncReport> {
        Self::require_admin(actor, "sync the catalog")?;
        let report = self.ledger.sync_catalog(products, mode).await?;
        tracing::info!(
            created = report.created,
            updated = report.updated,
            "catalog synced"
        );
        Ok(report)
    }

    pub async fn list_items(&self) -> Result<Vec<InventoryItem>> {
        Ok(self.ledger.list_items().await?)
    }

    pub async fn get_item(&self, product_id: &ProductId) -> Result<InventoryItem> {
        self.ledger
            .get_item(product_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("product {product_id}")))
    }

    pub async fn get_variant(&self, product_id: &ProductId, sku: &Sku) -> Result<InventoryVariant> {
        self.ledger
            .get_variant(product_id, sku)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("variant {product_id}/{sku}")))
    }
}
