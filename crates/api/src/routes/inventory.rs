//! Inventory reads and admin stock writes.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use common::{ProductId, Sku};
use domain::{CatalogProduct, InventoryItem, InventoryVariant, SyncMode, SyncReport};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;
use crate::extract::CurrentActor;

#[derive(Debug, Deserialize)]
pub struct StockUpdate {
    pub delta: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockResponse {
    pub product_id: ProductId,
    pub sku: Sku,
    pub previous_stock: i64,
    pub current_stock: i64,
    /// Differs from the requested delta when the result was clamped.
    pub applied_delta: i64,
}

#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    pub mode: Option<String>,
}

/// GET /inventory
pub async fn list(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<InventoryItem>>, ApiError> {
    Ok(Json(state.inventory.list_items().await?))
}

/// GET /inventory/{product_id}
pub async fn item(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<String>,
) -> Result<Json<InventoryItem>, ApiError> {
    let product_id = ProductId::new(product_id);
    Ok(Json(state.inventory.get_item(&product_id).await?))
}

/// GET /inventory/{product_id}/{sku}
pub async fn variant(
    State(state): State<Arc<AppState>>,
    Path((product_id, sku)): Path<(String, String)>,
) -> Result<Json<InventoryVariant>, ApiError> {
    let (product_id, sku) = (ProductId::new(product_id), Sku::new(sku));
    Ok(Json(state.inventory.get_variant(&product_id, &sku).await?))
}

/// PATCH /inventory/{product_id}/{sku}/stock: relative adjustment. Admin only.
#[tracing::instrument(skip(state, actor, update))]
pub async fn adjust_stock(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path((product_id, sku)): Path<(String, String)>,
    Json(update): Json<StockUpdate>,
) -> Result<Json<StockResponse>, ApiError> {
    let (product_id, sku) = (ProductId::new(product_id), Sku::new(sku));
    let adjustment = state
        .inventory
        .adjust_stock(&actor, &product_id, &sku, update.delta)
        .await?;
    Ok(Json(StockResponse {
        applied_delta: adjustment.applied_delta(),
        previous_stock: adjustment.previous_stock,
        current_stock: adjustment.variant.current_stock,
        product_id: adjustment.product_id,
        sku: adjustment.variant.sku,
    }))
}

/// POST /inventory/sync?mode=new|full. Admin only.
#[tracing::instrument(skip(state, actor, products))]
pub async fn sync(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Query(query): Query<SyncQuery>,
    Json(products): Json<Vec<CatalogProduct>>,
) -> Result<Json<SyncReport>, ApiError> {
    let mode = query
        .mode
        .as_deref()
        .map(str::parse::<SyncMode>)
        .transpose()
        .map_err(ApiError::BadRequest)?
        .unwrap_or_default();
    Ok(Json(
        state.inventory.sync_catalog(&actor, products, mode).await?,
    ))
}
