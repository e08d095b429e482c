//! Catalog resync: merging an upstream product list into the inventory.

use common::{ProductId, Sku};
use serde::{Deserialize, Serialize};

use super::{InventoryError, InventoryItem, InventoryVariant};
use crate::Money;

/// How a catalog sync treats products that already have inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Insert unknown products only.
    #[default]
    New,
    /// Also replace known products whose catalog data changed.
    Full,
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(SyncMode::New),
            "full" => Ok(SyncMode::Full),
            other => Err(format!("unknown sync mode '{other}'")),
        }
    }
}

/// Variant as published by the catalog, without live stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogVariant {
    pub sku: Sku,
    pub total_stock: i64,
    #[serde(default)]
    pub stock_threshold: i64,
    pub price: Money,
}

/// Product as published by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogProduct {
    pub product_id: ProductId,
    pub label: String,
    pub slug: String,
    pub variants: Vec<CatalogVariant>,
}

impl CatalogProduct {
    /// Builds the inventory record, carrying the units already sold per sku
    /// over from `existing` so restocks do not resurrect sold units.
    pub fn to_inventory(&self, existing: Option<&InventoryItem>) -> InventoryItem {
        let variants = self
            .variants
            .iter()
            .map(|v| {
                let sold = existing
                    .and_then(|item| item.variant(&v.sku))
                    .map(InventoryVariant::sold)
                    .unwrap_or(0);
                let floor = v.stock_threshold.min(v.total_stock).max(0);
                let current = (v.total_stock - sold).clamp(floor, v.total_stock.max(floor));
                InventoryVariant {
                    sku: v.sku.clone(),
                    total_stock: v.total_stock,
                    stock_threshold: v.stock_threshold,
                    current_stock: current,
                    price: v.price,
                }
            })
            .collect();

        InventoryItem {
            product_id: self.product_id.clone(),
            label: self.label.clone(),
            slug: self.slug.clone(),
            variants,
        }
    }
}

/// What a sync should do with one catalog product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    Create(InventoryItem),
    Replace(InventoryItem),
    Skip,
}

/// Counts returned to the caller of a sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
}

impl SyncReport {
    pub fn record(&mut self, action: &SyncAction) {
        match action {
            SyncAction::Create(_) => self.created += 1,
            SyncAction::Replace(_) => self.updated += 1,
            SyncAction::Skip => {}
        }
    }
}

/// Decides how to merge `incoming` given the current inventory record.
pub fn plan_sync(
    existing: Option<&InventoryItem>,
    incoming: &CatalogProduct,
    mode: SyncMode,
) -> Result<SyncAction, InventoryError> {
    let merged = incoming.to_inventory(existing);
    merged.validate()?;

    let Some(existing) = existing else {
        return Ok(SyncAction::Create(merged));
    };
    if mode == SyncMode::New || existing == &merged {
        return Ok(SyncAction::Skip);
    }
    Ok(SyncAction::Replace(merged))
}
