//! Order lifecycle management.
//!
//! Every status mutation in the system funnels through
//! [`OrderLifecycleService::transition`]; no other code path writes to the
//! status ledger. The check-then-append for a given order runs under that
//! order's lock, so two concurrent transitions cannot both observe the
//! same current status and both append.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use crate::domain::aggregates::{Order, OrderDraft, OrderStatusRecord};
use crate::domain::events::{EventPublisher, OrderEvent};
use crate::domain::status::{OrderStateMachine, OrderStatus};
use crate::domain::value_objects::Money;
use crate::service::runtime::Clock;
use crate::store::{NewOrder, NewStatusRecord, OrderStore, ShippingPriceLookup};
use crate::{CoreError, Result};

type OrderLock = Arc<tokio::sync::Mutex<()>>;

pub struct OrderLifecycleService {
    store: Arc<dyn OrderStore>,
    shipping: Arc<dyn ShippingPriceLookup>,
    events: EventPublisher,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<i64, OrderLock>>,
}

impl OrderLifecycleService {
    pub fn new(
        store: Arc<dyn OrderStore>,
        shipping: Arc<dyn ShippingPriceLookup>,
        events: EventPublisher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            shipping,
            events,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create an order from a draft. The total is computed here, on the
    /// server, from captured line totals plus the resolved shipping price;
    /// whatever total the client sent is ignored.
    pub async fn create_order(&self, draft: OrderDraft) -> Result<Order> {
        let mut total = Money::zero("VND");
        for line in &draft.lines {
            total = total
                .add(&line.total)
                .map_err(|e| CoreError::InvalidOrder(e.to_string()))?;
        }

        let shipping_price = match draft.shipping_price {
            Some(price) => Some(price),
            None => match draft.shipping_method_id {
                Some(method_id) => {
                    let price = self.shipping.price_for(method_id).await?;
                    if price.is_none() {
                        warn!(method_id, "shipping method not found, total excludes shipping");
                    }
                    price
                }
                None => {
                    warn!("order draft has no shipping method");
                    None
                }
            },
        };
        if let Some(price) = shipping_price {
            total = total
                .add(&price)
                .map_err(|e| CoreError::InvalidOrder(e.to_string()))?;
        }

        if !total.is_positive() {
            return Err(CoreError::InvalidOrder(format!(
                "order total must be greater than 0, computed {total}"
            )));
        }

        let now = self.clock.now();
        let order = self
            .store
            .insert_order(NewOrder {
                user_id: draft.user_id,
                shipping_method_id: draft.shipping_method_id,
                total: total.clone(),
                lines: draft.lines,
                created_at: now,
                initial_status: NewStatusRecord {
                    status_code: OrderStatus::PendingPayment.rank(),
                    note: "Order created - awaiting payment".to_string(),
                    detail: None,
                    created_at: now,
                },
            })
            .await?;

        info!(order_id = order.id, total = %order.total, "order created");
        self.events
            .publish(&OrderEvent::Created { order_id: order.id, total: total.amount() })
            .await;
        Ok(order)
    }

    /// Move an order to `target`, appending a new ledger record.
    ///
    /// An order with no history yet only accepts `PendingPayment`. Every
    /// other request is validated against the transition table and rejected
    /// with the state machine's explanation.
    pub async fn transition(
        &self,
        order_id: i64,
        target: OrderStatus,
        note: Option<String>,
        detail: Option<String>,
    ) -> Result<OrderStatusRecord> {
        let _guard = self.lock_order(order_id).await;
        self.transition_locked(order_id, target, note, detail).await
    }

    /// Cancel an order. On top of the transition table this requires the
    /// current status to still be cancellable, with its own message so
    /// callers can distinguish "too late to cancel" from a generally
    /// invalid transition.
    pub async fn cancel(
        &self,
        order_id: i64,
        note: Option<String>,
        detail: Option<String>,
    ) -> Result<OrderStatusRecord> {
        let _guard = self.lock_order(order_id).await;

        self.store
            .find_by_id(order_id)
            .await?
            .ok_or(CoreError::OrderNotFound(order_id))?;
        let current = self.store.current_status(order_id).await?.ok_or_else(|| {
            CoreError::InvalidTransition {
                current: None,
                attempted: OrderStatus::Cancelled,
                reason: "Cannot cancel order: no status history found".to_string(),
            }
        })?;

        let current_status = current.status();
        if !current_status.is_some_and(OrderStatus::is_cancellable) {
            return Err(CoreError::InvalidTransition {
                current: current_status,
                attempted: OrderStatus::Cancelled,
                reason: format!(
                    "Order cannot be cancelled. Current status: {}. Orders can only be cancelled before shipping.",
                    current_status.map(OrderStatus::label).unwrap_or("UNKNOWN")
                ),
            });
        }

        self.transition_locked(order_id, OrderStatus::Cancelled, note, detail)
            .await
    }

    pub async fn current_status(&self, order_id: i64) -> Result<Option<OrderStatusRecord>> {
        self.store.current_status(order_id).await
    }

    /// Whether the order's ledger contains the given status anywhere in
    /// its history.
    pub async fn has_status(&self, order_id: i64, status: OrderStatus) -> Result<bool> {
        Ok(self.store.find_status(order_id, status.rank()).await?.is_some())
    }

    async fn transition_locked(
        &self,
        order_id: i64,
        target: OrderStatus,
        note: Option<String>,
        detail: Option<String>,
    ) -> Result<OrderStatusRecord> {
        self.store
            .find_by_id(order_id)
            .await?
            .ok_or(CoreError::OrderNotFound(order_id))?;

        let current = self.store.current_status(order_id).await?;
        let from = match &current {
            None => {
                // First record ever: the ledger must open with PENDING_PAYMENT.
                if target != OrderStatus::PendingPayment {
                    return Err(CoreError::InvalidTransition {
                        current: None,
                        attempted: target,
                        reason: format!(
                            "New order must start with {} status, got: {}",
                            OrderStatus::PendingPayment.label(),
                            target.label()
                        ),
                    });
                }
                None
            }
            Some(record) => {
                let current_status = record.status();
                if !OrderStateMachine::is_allowed(current_status, Some(target)) {
                    let reason = OrderStateMachine::explain(current_status, Some(target));
                    warn!(
                        order_id,
                        current = current_status.map(OrderStatus::code).unwrap_or("UNKNOWN"),
                        attempted = target.code(),
                        "invalid status transition attempt"
                    );
                    return Err(CoreError::InvalidTransition {
                        current: current_status,
                        attempted: target,
                        reason,
                    });
                }
                current_status
            }
        };

        let record = self
            .store
            .append_status(
                order_id,
                NewStatusRecord {
                    status_code: target.rank(),
                    note: note.unwrap_or_else(|| target.label().to_string()),
                    detail,
                    created_at: self.clock.now(),
                },
            )
            .await?;

        info!(
            order_id,
            from = from.map(OrderStatus::code).unwrap_or("-"),
            to = target.code(),
            "order status changed"
        );
        self.events
            .publish(&OrderEvent::StatusChanged {
                order_id,
                from: from.map(|s| s.code().to_string()),
                to: target.code().to_string(),
            })
            .await;
        Ok(record)
    }

    /// Per-order lock handle. The map only ever grows by one entry per
    /// distinct order id seen by this process.
    async fn lock_order(&self, order_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(order_id).or_default())
        };
        lock.lock_owned().await
    }
}
