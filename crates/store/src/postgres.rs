use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, Sku, UserId};
use domain::{
    CatalogProduct, CustomerRef, InventoryItem, InventoryVariant, Money, Order, OrderStatus,
    PaymentApplication, SyncAction, SyncMode, SyncReport, plan_sync,
};
use serde::de::DeserializeOwned;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Result, StoreError,
    store::{
        IdempotencyGuard, IdempotencyOutcome, IdempotencyScope, InventoryLedger, OrderFilter,
        OrderStore, StockAdjustment, record_adjustment,
    },
};

/// Runs the database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

fn row_to_variant(row: &PgRow) -> Result<InventoryVariant> {
    Ok(InventoryVariant {
        sku: Sku::new(row.try_get::<String, _>("sku")?),
        total_stock: row.try_get("total_stock")?,
        stock_threshold: row.try_get("stock_threshold")?,
        current_stock: row.try_get("current_stock")?,
        price: Money::from_cents(row.try_get("price")?),
    })
}

/// PostgreSQL-backed inventory ledger.
#[derive(Clone)]
pub struct PostgresInventoryLedger {
    pool: PgPool,
}

impl PostgresInventoryLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn adjust(
        &self,
        product_id: &ProductId,
        sku: &Sku,
        delta: i64,
    ) -> Result<StockAdjustment> {
        // The guards in WHERE refuse the exhausted and at-capacity cases; the
        // numeric cast keeps huge deltas from overflowing before the clamp.
        let row: Option<PgRow> = sqlx::query(
            r#"
            WITH prev AS (
                SELECT product_id, sku, current_stock
                FROM inventory_variants
                WHERE product_id = $1 AND sku = $2
                FOR UPDATE
            )
            UPDATE inventory_variants v
            SET current_stock = LEAST(
                GREATEST(v.current_stock::numeric + $3::bigint, v.stock_threshold),
                v.total_stock
            )::bigint
            FROM prev
            WHERE v.product_id = prev.product_id
              AND v.sku = prev.sku
              AND NOT ($3 < 0 AND v.current_stock <= v.stock_threshold)
              AND NOT ($3 > 0 AND v.current_stock >= v.total_stock)
            RETURNING v.sku, v.total_stock, v.stock_threshold, v.current_stock, v.price,
                      prev.current_stock AS previous_stock
            "#,
        )
        .bind(product_id.as_str())
        .bind(sku.as_str())
        .bind(delta)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(StockAdjustment {
                product_id: product_id.clone(),
                variant: row_to_variant(&row)?,
                previous_stock: row.try_get("previous_stock")?,
            });
        }

        // Nothing was written: work out why.
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT current_stock FROM inventory_variants WHERE product_id = $1 AND sku = $2",
        )
        .bind(product_id.as_str())
        .bind(sku.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match exists {
            Some(_) if delta < 0 => Err(StoreError::StockExhausted {
                product_id: product_id.clone(),
                sku: sku.clone(),
            }),
            Some(_) => Err(StoreError::StockAtCapacity {
                product_id: product_id.clone(),
                sku: sku.clone(),
            }),
            None => {
                let product_exists: bool = sqlx::query_scalar(
                    "SELECT EXISTS (SELECT 1 FROM inventory_items WHERE product_id = $1)",
                )
                .bind(product_id.as_str())
                .fetch_one(&self.pool)
                .await?;
                if product_exists {
                    Err(StoreError::VariantNotFound {
                        product_id: product_id.clone(),
                        sku: sku.clone(),
                    })
                } else {
                    Err(StoreError::ProductNotFound(product_id.clone()))
                }
            }
        }
    }

    /// Loads a record inside `tx`, locking its rows when `for_update` is set.
    async fn load_item(
        tx: &mut Transaction<'_, Postgres>,
        product_id: &ProductId,
        for_update: bool,
    ) -> Result<Option<InventoryItem>> {
        let lock = if for_update { " FOR UPDATE" } else { "" };
        let item: Option<PgRow> = sqlx::query(&format!(
            "SELECT product_id, label, slug FROM inventory_items WHERE product_id = $1{lock}"
        ))
        .bind(product_id.as_str())
        .fetch_optional(&mut **tx)
        .await?;
        let Some(item) = item else {
            return Ok(None);
        };

        let rows = sqlx::query(&format!(
            "SELECT sku, total_stock, stock_threshold, current_stock, price \
             FROM inventory_variants WHERE product_id = $1 ORDER BY position ASC{lock}"
        ))
        .bind(product_id.as_str())
        .fetch_all(&mut **tx)
        .await?;

        Ok(Some(InventoryItem {
            product_id: product_id.clone(),
            label: item.try_get("label")?,
            slug: item.try_get("slug")?,
            variants: rows.iter().map(row_to_variant).collect::<Result<_>>()?,
        }))
    }

    async fn write_item(tx: &mut Transaction<'_, Postgres>, item: &InventoryItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO inventory_items (product_id, label, slug)
            VALUES ($1, $2, $3)
            ON CONFLICT (product_id) DO UPDATE SET
                label = EXCLUDED.label,
                slug = EXCLUDED.slug,
                updated_at = NOW()
            "#,
        )
        .bind(item.product_id.as_str())
        .bind(&item.label)
        .bind(&item.slug)
        .execute(&mut **tx)
        .await?;

        let skus: Vec<String> = item.variants.iter().map(|v| v.sku.to_string()).collect();
        sqlx::query("DELETE FROM inventory_variants WHERE product_id = $1 AND NOT (sku = ANY($2))")
            .bind(item.product_id.as_str())
            .bind(&skus)
            .execute(&mut **tx)
            .await?;

        for (position, variant) in item.variants.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO inventory_variants
                    (product_id, sku, position, total_stock, stock_threshold, current_stock, price)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (product_id, sku) DO UPDATE SET
                    position = EXCLUDED.position,
                    total_stock = EXCLUDED.total_stock,
                    stock_threshold = EXCLUDED.stock_threshold,
                    current_stock = EXCLUDED.current_stock,
                    price = EXCLUDED.price
                "#,
            )
            .bind(item.product_id.as_str())
            .bind(variant.sku.as_str())
            .bind(position as i32)
            .bind(variant.total_stock)
            .bind(variant.stock_threshold)
            .bind(variant.current_stock)
            .bind(variant.price.cents())
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl InventoryLedger for PostgresInventoryLedger {
    #[tracing::instrument(skip(self))]
    async fn adjust_stock(
        &self,
        product_id: &ProductId,
        sku: &Sku,
        delta: i64,
    ) -> Result<StockAdjustment> {
        let result = self.adjust(product_id, sku, delta).await;
        record_adjustment(&result);
        result
    }

    async fn get_item(&self, product_id: &ProductId) -> Result<Option<InventoryItem>> {
        let mut tx = self.pool.begin().await?;
        let item = Self::load_item(&mut tx, product_id, false).await?;
        tx.commit().await?;
        Ok(item)
    }

    async fn get_variant(
        &self,
        product_id: &ProductId,
        sku: &Sku,
    ) -> Result<Option<InventoryVariant>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT sku, total_stock, stock_threshold, current_stock, price
            FROM inventory_variants
            WHERE product_id = $1 AND sku = $2
            "#,
        )
        .bind(product_id.as_str())
        .bind(sku.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_variant).transpose()
    }

    async fn list_items(&self) -> Result<Vec<InventoryItem>> {
        let items = sqlx::query(
            "SELECT product_id, label, slug FROM inventory_items ORDER BY product_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        let variants = sqlx::query(
            r#"
            SELECT product_id, sku, total_stock, stock_threshold, current_stock, price
            FROM inventory_variants
            ORDER BY product_id ASC, position ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: BTreeMap<String, Vec<InventoryVariant>> = BTreeMap::new();
        for row in &variants {
            grouped
                .entry(row.try_get("product_id")?)
                .or_default()
                .push(row_to_variant(row)?);
        }

        items
            .iter()
            .map(|row| -> Result<InventoryItem> {
                let product_id: String = row.try_get("product_id")?;
                Ok(InventoryItem {
                    variants: grouped.remove(&product_id).unwrap_or_default(),
                    product_id: ProductId::new(product_id),
                    label: row.try_get("label")?,
                    slug: row.try_get("slug")?,
                })
            })
            .collect()
    }

    #[tracing::instrument(skip(self, products), fields(count = products.len()))]
    async fn sync_catalog(
        &self,
        products: Vec<CatalogProduct>,
        mode: SyncMode,
    ) -> Result<SyncReport> {
        let mut tx = self.pool.begin().await?;
        let mut report = SyncReport::default();

        for product in &products {
            let existing = Self::load_item(&mut tx, &product.product_id, true).await?;
            let action = plan_sync(existing.as_ref(), product, mode)?;
            report.record(&action);
            match action {
                SyncAction::Create(item) | SyncAction::Replace(item) => {
                    Self::write_item(&mut tx, &item).await?;
                }
                SyncAction::Skip => {}
            }
        }

        tx.commit().await?;
        tracing::info!(created = report.created, updated = report.updated, "catalog synced");
        Ok(report)
    }
}

/// PostgreSQL-backed idempotency guard.
#[derive(Clone)]
pub struct PostgresIdempotencyGuard {
    pool: PgPool,
}

impl PostgresIdempotencyGuard {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyGuard for PostgresIdempotencyGuard {
    async fn check_and_reserve(
        &self,
        scope: IdempotencyScope,
        key: &str,
        lease: Duration,
    ) -> Result<IdempotencyOutcome> {
        // Inserts a new reservation, or takes over an unfinished one made more
        // than `lease` ago.
        let reserved = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (scope, key, state)
            VALUES ($1, $2, 'in_flight')
            ON CONFLICT (scope, key) DO UPDATE SET
                created_at = NOW(),
                updated_at = NOW()
            WHERE idempotency_keys.state = 'in_flight'
              AND idempotency_keys.updated_at < NOW() - make_interval(secs => $3)
            "#,
        )
        .bind(scope.as_str())
        .bind(key)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if reserved == 1 {
            return Ok(IdempotencyOutcome::Fresh);
        }

        let row: Option<PgRow> =
            sqlx::query("SELECT state, result FROM idempotency_keys WHERE scope = $1 AND key = $2")
                .bind(scope.as_str())
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        // A row released between the insert and the read is still owned by
        // someone else's retry, so it counts as in flight.
        match row {
            Some(row) if row.try_get::<String, _>("state")? == "completed" => {
                let result: Option<serde_json::Value> = row.try_get("result")?;
                Ok(IdempotencyOutcome::Completed(result.unwrap_or_default()))
            }
            _ => Ok(IdempotencyOutcome::InFlight),
        }
    }

    async fn complete(
        &self,
        scope: IdempotencyScope,
        key: &str,
        result: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO idempotency_keys (scope, key, state, result)
            VALUES ($1, $2, 'completed', $3)
            ON CONFLICT (scope, key) DO UPDATE SET
                state = 'completed',
                result = EXCLUDED.result,
                updated_at = NOW()
            "#,
        )
        .bind(scope.as_str())
        .bind(key)
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(&self, scope: IdempotencyScope, key: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM idempotency_keys WHERE scope = $1 AND key = $2 AND state = 'in_flight'",
        )
        .bind(scope.as_str())
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

const ORDER_COLUMNS: &str = "id, user_id, guest_id, status, items, payment, payment_history, \
    shipping_address, customer_info, total_amount, currency, idempotency_key, stock_reserved, \
    created_at, updated_at";

fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

fn from_optional_json<T: DeserializeOwned>(value: Option<serde_json::Value>) -> Result<Option<T>> {
    value.map(from_json).transpose()
}

fn to_optional_json<T: serde::Serialize>(value: Option<&T>) -> Result<Option<serde_json::Value>> {
    Ok(value.map(serde_json::to_value).transpose()?)
}

/// PostgreSQL-backed order store.
///
/// Nested parts of the aggregate (items, payment, audit trail, addresses) are
/// stored as JSONB; status and lookup keys are plain columns.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_order(row: PgRow) -> Result<Order> {
        let user_id: Option<String> = row.try_get("user_id")?;
        let guest_id: Option<String> = row.try_get("guest_id")?;
        let customer = match (user_id, guest_id) {
            (Some(user_id), None) => CustomerRef::User(UserId::new(user_id)),
            (None, Some(guest_id)) => CustomerRef::Guest(guest_id),
            _ => return Err(StoreError::Corrupt("order must have exactly one customer".into())),
        };
        let status: String = row.try_get("status")?;

        Ok(Order {
            id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
            customer,
            status: status.parse().map_err(StoreError::Corrupt)?,
            items: from_json(row.try_get("items")?)?,
            payment: from_optional_json(row.try_get("payment")?)?,
            payment_history: from_json(row.try_get("payment_history")?)?,
            shipping_address: from_optional_json(row.try_get("shipping_address")?)?,
            customer_info: from_optional_json(row.try_get("customer_info")?)?,
            total_amount: Money::from_cents(row.try_get("total_amount")?),
            currency: row.try_get("currency")?,
            idempotency_key: row.try_get("idempotency_key")?,
            stock_reserved: row.try_get("stock_reserved")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn fetch(&self, id: OrderId) -> Result<Option<Order>> {
        let row: Option<PgRow> =
            sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        row.map(Self::row_to_order).transpose()
    }

    /// Explains why a conditional write on `id` matched no row. Returns `None`
    /// when the order exists in the expected status.
    async fn write_miss(&self, id: OrderId, expected: OrderStatus) -> Result<Option<StoreError>> {
        Ok(match self.fetch(id).await? {
            Some(order) if order.status != expected => Some(StoreError::ConcurrencyConflict {
                order_id: id,
                expected,
                actual: order.status,
            }),
            Some(_) => None,
            None => Some(StoreError::OrderNotFound(id)),
        })
    }

    async fn status_write_miss(&self, id: OrderId, expected: OrderStatus) -> StoreError {
        match self.write_miss(id, expected).await {
            Ok(Some(err)) | Err(err) => err,
            Ok(None) => StoreError::ConcurrencyConflict {
                order_id: id,
                expected,
                actual: expected,
            },
        }
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    #[tracing::instrument(skip(self, order), fields(order_id = %order.id))]
    async fn create(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, user_id, guest_id, status, items, payment, payment_history,
                shipping_address, customer_info, total_amount, currency, idempotency_key,
                provider_session_id, stock_reserved, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.customer.user_id().map(UserId::as_str))
        .bind(order.customer.guest_id())
        .bind(order.status.as_str())
        .bind(serde_json::to_value(&order.items)?)
        .bind(to_optional_json(order.payment.as_ref())?)
        .bind(serde_json::to_value(&order.payment_history)?)
        .bind(to_optional_json(order.shipping_address.as_ref())?)
        .bind(to_optional_json(order.customer_info.as_ref())?)
        .bind(order.total_amount.cents())
        .bind(&order.currency)
        .bind(order.idempotency_key.as_deref())
        .bind(
            order
                .payment
                .as_ref()
                .and_then(|p| p.provider_checkout_session_id.as_deref()),
        )
        .bind(order.stock_reserved)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("unique_order_idempotency_key")
            {
                return StoreError::DuplicateIdempotencyKey(
                    order.idempotency_key.clone().unwrap_or_default(),
                );
            }
            StoreError::Database(e)
        })?;
        Ok(())
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>> {
        self.fetch(id).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Order>> {
        let row: Option<PgRow> = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_order).transpose()
    }

    async fn find_by_provider_session(&self, session_id: &str) -> Result<Option<Order>> {
        let row: Option<PgRow> = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE provider_session_id = $1 \
             ORDER BY created_at ASC LIMIT 1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_order).transpose()
    }

    async fn list(&self, filter: OrderFilter) -> Result<Vec<Order>> {
        let mut sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE 1=1");
        let mut param_count = 0;

        if filter.user_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND user_id = ${param_count}"));
        }
        if filter.status.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ${param_count}"));
        }
        sql.push_str(" ORDER BY created_at DESC");
        if filter.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }

        let mut query = sqlx::query(&sql);
        if let Some(ref user_id) = filter.user_id {
            query = query.bind(user_id.as_str());
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_order).collect()
    }

    #[tracing::instrument(skip(self))]
    async fn update_status(
        &self,
        id: OrderId,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<Order> {
        if !expected.can_transition_to(next) {
            return Err(domain::OrderError::InvalidStateTransition {
                from: expected,
                to: next,
            }
            .into());
        }

        let row: Option<PgRow> = sqlx::query(&format!(
            "UPDATE orders SET status = $3, updated_at = $4 \
             WHERE id = $1 AND status = $2 RETURNING {ORDER_COLUMNS}"
        ))
        .bind(id.as_uuid())
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_order(row),
            None => Err(self.status_write_miss(id, expected).await),
        }
    }

    #[tracing::instrument(skip(self, application))]
    async fn apply_payment(
        &self,
        id: OrderId,
        expected: OrderStatus,
        application: PaymentApplication,
    ) -> Result<Order> {
        let mut order = self.fetch(id).await?.ok_or(StoreError::OrderNotFound(id))?;
        if order.status != expected {
            return Err(StoreError::ConcurrencyConflict {
                order_id: id,
                expected,
                actual: order.status,
            });
        }
        let entry = serde_json::to_value(&application.history_entry)?;
        order.apply_payment(application, Utc::now())?;

        // The audit entry is appended in SQL so concurrent writers never drop one.
        let row: Option<PgRow> = sqlx::query(&format!(
            r#"
            UPDATE orders SET
                status = $3,
                payment = $4,
                payment_history = payment_history || jsonb_build_array($5::jsonb),
                total_amount = $6,
                currency = $7,
                items = $8,
                provider_session_id = $9,
                updated_at = $10
            WHERE id = $1 AND status = $2
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(expected.as_str())
        .bind(order.status.as_str())
        .bind(to_optional_json(order.payment.as_ref())?)
        .bind(entry)
        .bind(order.total_amount.cents())
        .bind(&order.currency)
        .bind(serde_json::to_value(&order.items)?)
        .bind(
            order
                .payment
                .as_ref()
                .and_then(|p| p.provider_checkout_session_id.as_deref()),
        )
        .bind(order.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_order(row),
            None => Err(self.status_write_miss(id, expected).await),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn delete(
        &self,
        id: OrderId,
        expected: OrderStatus,
        created_after: DateTime<Utc>,
    ) -> Result<()> {
        let deleted = sqlx::query(
            "DELETE FROM orders WHERE id = $1 AND status = $2 AND created_at >= $3",
        )
        .bind(id.as_uuid())
        .bind(expected.as_str())
        .bind(created_after)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if deleted == 0 {
            return Err(self
                .write_miss(id, expected)
                .await?
                .unwrap_or(StoreError::OutsideModificationWindow(id)));
        }
        Ok(())
    }
}
