//! Order endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use common::OrderId;
use domain::{Order, OrderStatus};
use serde::Deserialize;
use store::OrderFilter;
use workflow::{CreateOrderRequest, OrderReceipt, UpdatePaymentRequest};

use crate::AppState;
use crate::error::ApiError;
use crate::extract::CurrentActor;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: OrderStatus,
}

/// POST /orders: 201 for a new order, 200 when an earlier request with the
/// same `Idempotency-Key` already created it.
#[tracing::instrument(skip(state, actor, headers, req))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    headers: HeaderMap,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderReceipt>), ApiError> {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .map(|v| {
            v.to_str()
                .map(str::to_string)
                .map_err(|_| ApiError::BadRequest("invalid Idempotency-Key header".to_string()))
        })
        .transpose()?;

    let outcome = state.workflow.create_order(&actor, req, key).await?;
    let status = if outcome.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome.receipt)))
}

/// GET /orders: every order, newest first. Admin only.
#[tracing::instrument(skip(state, actor))]
pub async fn list(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Order>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<OrderStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let filter = OrderFilter {
        user_id: None,
        status,
        limit: query.limit,
    };
    Ok(Json(state.workflow.list_orders(&actor, filter).await?))
}

/// GET /orders/mine
#[tracing::instrument(skip(state, actor))]
pub async fn mine(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
) -> Result<Json<Vec<Order>>, ApiError> {
    Ok(Json(state.workflow.list_mine(&actor).await?))
}

/// GET /orders/{id}
#[tracing::instrument(skip(state, actor))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let order_id = parse_order_id(&id)?;
    Ok(Json(state.workflow.get_order(&actor, order_id).await?))
}

/// DELETE /orders/{id}/cancel: cancels and returns the stock.
#[tracing::instrument(skip(state, actor))]
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let order_id = parse_order_id(&id)?;
    Ok(Json(state.workflow.cancel_order(&actor, order_id).await?))
}

/// DELETE /orders/{id}: permanent removal. Admin only.
#[tracing::instrument(skip(state, actor))]
pub async fn delete(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let order_id = parse_order_id(&id)?;
    state.workflow.delete_order(&actor, order_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /orders/{id}/status. Admin only.
#[tracing::instrument(skip(state, actor, update))]
pub async fn update_status(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<Order>, ApiError> {
    let order_id = parse_order_id(&id)?;
    Ok(Json(
        state
            .workflow
            .update_status(&actor, order_id, update.status)
            .await?,
    ))
}

/// PATCH /orders/{id}/payment: switches an unpaid order's payment method.
#[tracing::instrument(skip(state, actor, req))]
pub async fn update_payment(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<String>,
    Json(req): Json<UpdatePaymentRequest>,
) -> Result<Json<OrderReceipt>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let order = state.workflow.update_payment(&actor, order_id, req).await?;
    Ok(Json(OrderReceipt::from(&order)))
}

fn parse_order_id(id: &str) -> Result<OrderId, ApiError> {
    OrderId::parse(id).map_err(|e| ApiError::BadRequest(format!("Invalid order id: {e}")))
}
