//! Inventory records and the bounded stock adjustment rule.

mod catalog;

pub use catalog::{CatalogProduct, CatalogVariant, SyncAction, SyncMode, SyncReport, plan_sync};

use common::{ProductId, Sku};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Money;

/// Errors raised while validating inventory records.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Product {product_id} has no variants")]
    NoVariants { product_id: String },

    #[error("Product {product_id} lists sku {sku} more than once")]
    DuplicateSku { product_id: String, sku: String },

    #[error("Variant {sku} is invalid: {reason}")]
    InvalidVariant { sku: String, reason: &'static str },

    #[error("Product id is required")]
    MissingProductId,

    #[error("Product {product_id} has no slug")]
    MissingSlug { product_id: String },
}

/// Why a stock adjustment was refused without touching the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockRejection {
    /// Decrement requested while stock sits at its threshold.
    Exhausted,
    /// Increment requested while stock sits at its total.
    AtCapacity,
}

/// Stock counters for one sellable variant.
///
/// Invariant: `0 <= stock_threshold <= current_stock <= total_stock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryVariant {
    pub sku: Sku,
    pub total_stock: i64,
    pub stock_threshold: i64,
    pub current_stock: i64,
    pub price: Money,
}

impl InventoryVariant {
    /// A fully stocked variant.
    pub fn new(sku: impl Into<Sku>, total_stock: i64, stock_threshold: i64, price: Money) -> Self {
        Self {
            sku: sku.into(),
            total_stock,
            stock_threshold,
            current_stock: total_stock,
            price,
        }
    }

    pub fn with_current_stock(mut self, current_stock: i64) -> Self {
        self.current_stock = current_stock;
        self
    }

    pub fn validate(&self) -> Result<(), InventoryError> {
        let reason = if self.sku.is_blank() {
            Some("sku is required")
        } else if self.total_stock < 0 {
            Some("total stock must not be negative")
        } else if self.stock_threshold < 0 {
            Some("stock threshold must not be negative")
        } else if self.stock_threshold > self.total_stock {
            Some("stock threshold exceeds total stock")
        } else if self.current_stock < self.stock_threshold || self.current_stock > self.total_stock
        {
            Some("current stock is outside threshold and total")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(InventoryError::InvalidVariant {
                sku: self.sku.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Computes the stock level after applying `delta`.
    ///
    /// Decrements at the threshold and increments at capacity are refused.
    /// Anything else is clamped into `[stock_threshold, total_stock]`, so a
    /// large delta may be applied only partially.
    pub fn plan_adjustment(&self, delta: i64) -> Result<i64, StockRejection> {
        if delta < 0 && self.current_stock <= self.stock_threshold {
            return Err(StockRejection::Exhausted);
        }
        if delta > 0 && self.current_stock >= self.total_stock {
            return Err(StockRejection::AtCapacity);
        }
        let candidate = self.current_stock.saturating_add(delta);
        Ok(candidate.clamp(self.stock_threshold, self.total_stock))
    }

    /// Applies `delta` in place, returning the previous stock level.
    pub fn adjust(&mut self, delta: i64) -> Result<i64, StockRejection> {
        let next = self.plan_adjustment(delta)?;
        let previous = self.current_stock;
        self.current_stock = next;
        Ok(previous)
    }

    /// Units that can still be sold before hitting the threshold.
    pub fn available(&self) -> i64 {
        self.current_stock - self.stock_threshold
    }

    /// Units sold since the last restock.
    pub fn sold(&self) -> i64 {
        self.total_stock - self.current_stock
    }
}

/// Inventory record of one catalog product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItem {
    pub product_id: ProductId,
    pub label: String,
    pub slug: String,
    pub variants: Vec<InventoryVariant>,
}

impl InventoryItem {
    pub fn validate(&self) -> Result<(), InventoryError> {
        if self.product_id.is_blank() {
            return Err(InventoryError::MissingProductId);
        }
        if self.slug.trim().is_empty() {
            return Err(InventoryError::MissingSlug {
                product_id: self.product_id.to_string(),
            });
        }
        if self.variants.is_empty() {
            return Err(InventoryError::NoVariants {
                product_id: self.product_id.to_string(),
            });
        }
        for (index, variant) in self.variants.iter().enumerate() {
            variant.validate()?;
            if self.variants[..index].iter().any(|v| v.sku == variant.sku) {
                return Err(InventoryError::DuplicateSku {
                    product_id: self.product_id.to_string(),
                    sku: variant.sku.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn variant(&self, sku: &Sku) -> Option<&InventoryVariant> {
        self.variants.iter().find(|v| &v.sku == sku)
    }

    pub fn variant_mut(&mut self, sku: &Sku) -> Option<&mut InventoryVariant> {
        self.variants.iter_mut().find(|v| &v.sku == sku)
    }
}
