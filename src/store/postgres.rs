//! Postgres-backed store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::aggregates::{LineItem, Order, OrderStatusRecord, PaymentAttempt, PaymentStatus};
use crate::domain::value_objects::Money;
use crate::{CoreError, Result};

use super::{NewOrder, NewStatusRecord, OrderStore, ShippingPriceLookup};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage(err: sqlx::Error) -> CoreError {
    CoreError::Storage(err.to_string())
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: i64,
    user_id: i64,
    shipping_method_id: Option<i64>,
    total: Decimal,
    currency: String,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct LineRow {
    id: Uuid,
    product_item_id: i64,
    name: String,
    qty: i32,
    unit_price: Decimal,
    line_total: Decimal,
}

#[derive(sqlx::FromRow)]
struct StatusRow {
    id: i64,
    order_id: i64,
    status: i32,
    note: String,
    detail: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<StatusRow> for OrderStatusRecord {
    fn from(row: StatusRow) -> Self {
        OrderStatusRecord {
            id: row.id,
            order_id: row.order_id,
            status_code: row.status,
            note: row.note,
            detail: row.detail,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: i64,
    order_id: i64,
    correlation_id: Option<String>,
    gateway_token: Option<String>,
    status: String,
    updated_at: DateTime<Utc>,
}

impl PaymentRow {
    fn into_attempt(self) -> Result<PaymentAttempt> {
        let status = PaymentStatus::from_code(&self.status).ok_or_else(|| {
            CoreError::Storage(format!("unknown payment status code: {}", self.status))
        })?;
        Ok(PaymentAttempt {
            id: self.id,
            order_id: self.order_id,
            correlation_id: self.correlation_id,
            gateway_token: self.gateway_token,
            status,
            updated_at: self.updated_at,
        })
    }
}

fn assemble_order(row: OrderRow, lines: Vec<LineRow>) -> Order {
    let currency = row.currency;
    Order {
        id: row.id,
        user_id: row.user_id,
        shipping_method_id: row.shipping_method_id,
        total: Money::new(row.total, &currency),
        lines: lines
            .into_iter()
            .map(|l| LineItem {
                id: l.id,
                product_item_id: l.product_item_id,
                name: l.name,
                qty: l.qty.max(0) as u32,
                unit_price: Money::new(l.unit_price, &currency),
                total: Money::new(l.line_total, &currency),
            })
            .collect(),
        created_at: row.created_at,
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn insert_order(&self, order: NewOrder) -> Result<Order> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let row: OrderRow = sqlx::query_as(
            "INSERT INTO shop_order (user_id, shipping_method_id, total, currency, created_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(order.user_id)
        .bind(order.shipping_method_id)
        .bind(order.total.amount())
        .bind(order.total.currency())
        .bind(order.created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;

        for line in &order.lines {
            sqlx::query(
                "INSERT INTO order_line (id, order_id, product_item_id, name, qty, unit_price, line_total) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(line.id)
            .bind(row.id)
            .bind(line.product_item_id)
            .bind(&line.name)
            .bind(line.qty as i32)
            .bind(line.unit_price.amount())
            .bind(line.total.amount())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        sqlx::query(
            "INSERT INTO order_payment (order_id, status, updated_at) VALUES ($1, $2, $3)",
        )
        .bind(row.id)
        .bind(PaymentStatus::Pending.code())
        .bind(order.created_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query(
            "INSERT INTO order_status (order_id, status, note, detail, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(row.id)
        .bind(order.initial_status.status_code)
        .bind(&order.initial_status.note)
        .bind(&order.initial_status.detail)
        .bind(order.initial_status.created_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;

        let lines = order.lines;
        let currency = row.currency.clone();
        Ok(Order {
            id: row.id,
            user_id: row.user_id,
            shipping_method_id: row.shipping_method_id,
            total: Money::new(row.total, &currency),
            lines,
            created_at: row.created_at,
        })
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Order>> {
        let Some(row) = sqlx::query_as::<_, OrderRow>("SELECT * FROM shop_order WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
        else {
            return Ok(None);
        };
        let lines = sqlx::query_as::<_, LineRow>(
            "SELECT id, product_item_id, name, qty, unit_price, line_total \
             FROM order_line WHERE order_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(Some(assemble_order(row, lines)))
    }

    async fn append_status(
        &self,
        order_id: i64,
        record: NewStatusRecord,
    ) -> Result<OrderStatusRecord> {
        let row: StatusRow = sqlx::query_as(
            "INSERT INTO order_status (order_id, status, note, detail, created_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(order_id)
        .bind(record.status_code)
        .bind(&record.note)
        .bind(&record.detail)
        .bind(record.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.into())
    }

    async fn current_status(&self, order_id: i64) -> Result<Option<OrderStatusRecord>> {
        let row = sqlx::query_as::<_, StatusRow>(
            "SELECT * FROM order_status WHERE order_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.map(Into::into))
    }

    async fn find_status(
        &self,
        order_id: i64,
        status_code: i32,
    ) -> Result<Option<OrderStatusRecord>> {
        let row = sqlx::query_as::<_, StatusRow>(
            "SELECT * FROM order_status WHERE order_id = $1 AND status = $2 \
             ORDER BY id LIMIT 1",
        )
        .bind(order_id)
        .bind(status_code)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.map(Into::into))
    }

    async fn payment_for(&self, order_id: i64) -> Result<Option<PaymentAttempt>> {
        let row = sqlx::query_as::<_, PaymentRow>(
            "SELECT * FROM order_payment WHERE order_id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.map(PaymentRow::into_attempt).transpose()
    }

    async fn save_payment(&self, payment: PaymentAttempt) -> Result<PaymentAttempt> {
        let row: PaymentRow = sqlx::query_as(
            "INSERT INTO order_payment (order_id, correlation_id, gateway_token, status, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (order_id) DO UPDATE SET \
               correlation_id = EXCLUDED.correlation_id, \
               gateway_token = EXCLUDED.gateway_token, \
               status = EXCLUDED.status, \
               updated_at = EXCLUDED.updated_at \
             RETURNING *",
        )
        .bind(payment.order_id)
        .bind(&payment.correlation_id)
        .bind(&payment.gateway_token)
        .bind(payment.status.code())
        .bind(payment.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        row.into_attempt()
    }
}

#[async_trait]
impl ShippingPriceLookup for PgStore {
    async fn price_for(&self, shipping_method_id: i64) -> Result<Option<Money>> {
        let row: Option<(Decimal,)> =
            sqlx::query_as("SELECT price FROM shipping_method WHERE id = $1")
                .bind(shipping_method_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        Ok(row.map(|(price,)| Money::vnd(price)))
    }
}
