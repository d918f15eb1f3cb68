//! Persistence seams consumed by the order and payment services.
//!
//! The services never touch a database directly; they speak to these
//! traits. `memory` backs tests and local development, `postgres` is the
//! production store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::aggregates::{LineItem, Order, OrderStatusRecord, PaymentAttempt};
use crate::domain::value_objects::Money;
use crate::Result;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// A fully specified order ready to persist: the row, its lines, a payment
/// placeholder and the initial status record, written as one atomic unit.
#[derive(Clone, Debug)]
pub struct NewOrder {
    pub user_id: i64,
    pub shipping_method_id: Option<i64>,
    pub total: Money,
    pub lines: Vec<LineItem>,
    pub created_at: DateTime<Utc>,
    pub initial_status: NewStatusRecord,
}

#[derive(Clone, Debug)]
pub struct NewStatusRecord {
    pub status_code: i32,
    pub note: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Persist order, lines, payment placeholder and initial status record
    /// in one transaction.
    async fn insert_order(&self, order: NewOrder) -> Result<Order>;

    async fn find_by_id(&self, id: i64) -> Result<Option<Order>>;

    /// Append one record to the order's status ledger.
    async fn append_status(&self, order_id: i64, record: NewStatusRecord)
        -> Result<OrderStatusRecord>;

    /// Latest record by creation timestamp, ties broken by highest id.
    async fn current_status(&self, order_id: i64) -> Result<Option<OrderStatusRecord>>;

    /// Any ledger record with the given status code, if one exists.
    async fn find_status(&self, order_id: i64, status_code: i32)
        -> Result<Option<OrderStatusRecord>>;

    async fn payment_for(&self, order_id: i64) -> Result<Option<PaymentAttempt>>;

    async fn save_payment(&self, payment: PaymentAttempt) -> Result<PaymentAttempt>;
}

#[async_trait]
pub trait ShippingPriceLookup: Send + Sync {
    /// Price of a shipping method, fetched fresh from the store. `None`
    /// for an unknown method id.
    async fn price_for(&self, shipping_method_id: i64) -> Result<Option<Money>>;
}
