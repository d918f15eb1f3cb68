//! In-memory store used by tests and local development.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::domain::aggregates::{Order, OrderStatusRecord, PaymentAttempt, PaymentStatus};
use crate::domain::value_objects::Money;
use crate::{CoreError, Result};

use super::{NewOrder, NewStatusRecord, OrderStore, ShippingPriceLookup};

#[derive(Default)]
struct Inner {
    orders: HashMap<i64, Order>,
    statuses: HashMap<i64, Vec<OrderStatusRecord>>,
    payments: HashMap<i64, PaymentAttempt>,
    shipping_prices: HashMap<i64, Money>,
    next_order_id: i64,
    next_status_id: i64,
    next_payment_id: i64,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shipping_price(self, method_id: i64, price: Money) -> Self {
        self.lock().shipping_prices.insert(method_id, price);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an order row without any status history or payment
    /// placeholder. Only exists so tests can stage pathological states the
    /// normal creation path refuses to produce.
    #[cfg(test)]
    pub(crate) fn seed_bare_order(&self, order: Order) {
        let mut inner = self.lock();
        inner.next_order_id = inner.next_order_id.max(order.id);
        inner.statuses.entry(order.id).or_default();
        inner.orders.insert(order.id, order);
    }

    #[cfg(test)]
    pub(crate) fn seed_payment(&self, payment: PaymentAttempt) {
        self.lock().payments.insert(payment.order_id, payment);
    }

    #[cfg(test)]
    pub(crate) fn status_history(&self, order_id: i64) -> Vec<OrderStatusRecord> {
        self.lock().statuses.get(&order_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn insert_order(&self, order: NewOrder) -> Result<Order> {
        let mut inner = self.lock();
        inner.next_order_id += 1;
        inner.next_status_id += 1;
        inner.next_payment_id += 1;
        let order_id = inner.next_order_id;
        let status_id = inner.next_status_id;
        let payment_id = inner.next_payment_id;

        let stored = Order {
            id: order_id,
            user_id: order.user_id,
            shipping_method_id: order.shipping_method_id,
            total: order.total,
            lines: order.lines,
            created_at: order.created_at,
        };
        inner.orders.insert(order_id, stored.clone());
        inner.statuses.entry(order_id).or_default().push(OrderStatusRecord {
            id: status_id,
            order_id,
            status_code: order.initial_status.status_code,
            note: order.initial_status.note,
            detail: order.initial_status.detail,
            created_at: order.initial_status.created_at,
        });
        inner.payments.insert(
            order_id,
            PaymentAttempt {
                id: payment_id,
                order_id,
                correlation_id: None,
                gateway_token: None,
                status: PaymentStatus::Pending,
                updated_at: order.created_at,
            },
        );
        Ok(stored)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Order>> {
        Ok(self.lock().orders.get(&id).cloned())
    }

    async fn append_status(
        &self,
        order_id: i64,
        record: NewStatusRecord,
    ) -> Result<OrderStatusRecord> {
        let mut inner = self.lock();
        if !inner.orders.contains_key(&order_id) {
            return Err(CoreError::Storage(format!(
                "cannot append status: order {order_id} does not exist"
            )));
        }
        inner.next_status_id += 1;
        let stored = OrderStatusRecord {
            id: inner.next_status_id,
            order_id,
            status_code: record.status_code,
            note: record.note,
            detail: record.detail,
            created_at: record.created_at,
        };
        inner.statuses.entry(order_id).or_default().push(stored.clone());
        Ok(stored)
    }

    async fn current_status(&self, order_id: i64) -> Result<Option<OrderStatusRecord>> {
        Ok(self
            .lock()
            .statuses
            .get(&order_id)
            .and_then(|records| records.iter().max_by_key(|r| (r.created_at, r.id)))
            .cloned())
    }

    async fn find_status(
        &self,
        order_id: i64,
        status_code: i32,
    ) -> Result<Option<OrderStatusRecord>> {
        Ok(self
            .lock()
            .statuses
            .get(&order_id)
            .and_then(|records| records.iter().find(|r| r.status_code == status_code))
            .cloned())
    }

    async fn payment_for(&self, order_id: i64) -> Result<Option<PaymentAttempt>> {
        Ok(self.lock().payments.get(&order_id).cloned())
    }

    async fn save_payment(&self, payment: PaymentAttempt) -> Result<PaymentAttempt> {
        self.lock().payments.insert(payment.order_id, payment.clone());
        Ok(payment)
    }
}

#[async_trait]
impl ShippingPriceLookup for InMemoryStore {
    async fn price_for(&self, shipping_method_id: i64) -> Result<Option<Money>> {
        Ok(self.lock().shipping_prices.get(&shipping_method_id).cloned())
    }
}
