//! Order Aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::status::OrderStatus;
use crate::domain::value_objects::Money;

/// Aggregate root. Owns its line items, an append-only sequence of status
/// records and at most one payment attempt. Status is never stored on the
/// order row itself; the latest ledger record defines it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub shipping_method_id: Option<i64>,
    /// Computed server-side from line totals plus shipping. Client-supplied
    /// totals are ignored.
    pub total: Money,
    pub lines: Vec<LineItem>,
    pub created_at: DateTime<Utc>,
}

/// One order line. `unit_price` and `total` are the prices captured at
/// add-to-cart time, not live catalog lookups.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LineItem {
    pub id: Uuid,
    pub product_item_id: i64,
    pub name: String,
    pub qty: u32,
    pub unit_price: Money,
    pub total: Money,
}

/// Input for order creation. The lifecycle service resolves the shipping
/// price and computes the total; `shipping_price` is only ever populated by
/// trusted callers that already loaded it.
#[derive(Clone, Debug)]
pub struct OrderDraft {
    pub user_id: i64,
    pub shipping_method_id: Option<i64>,
    pub shipping_price: Option<Money>,
    pub lines: Vec<LineItem>,
}

/// One entry in an order's status ledger. Immutable once created; status
/// changes append new records, they never touch old ones.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderStatusRecord {
    pub id: i64,
    pub order_id: i64,
    /// Raw rank code as stored. Decodes through [`OrderStatusRecord::status`];
    /// an unknown code surfaces as `None` and is rejected downstream.
    pub status_code: i32,
    pub note: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OrderStatusRecord {
    pub fn status(&self) -> Option<OrderStatus> {
        OrderStatus::from_rank(self.status_code)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Cancelled,
}

impl PaymentStatus {
    pub fn code(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_code(code: &str) -> Option<PaymentStatus> {
        match code {
            "PENDING" => Some(PaymentStatus::Pending),
            "PAID" => Some(PaymentStatus::Paid),
            "CANCELLED" => Some(PaymentStatus::Cancelled),
            _ => None,
        }
    }
}

/// One gateway transaction tied to an order.
///
/// An attempt that holds a gateway token blocks further payment creation
/// for its order, even after it resolved, until an administrative flow
/// reopens the order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: i64,
    pub order_id: i64,
    /// Locally generated transaction id, `{yymmdd}_{orderId}_{epochMillis}`.
    pub correlation_id: Option<String>,
    /// Token returned by the gateway on create; the transaction id after
    /// the payment settles.
    pub gateway_token: Option<String>,
    pub status: PaymentStatus,
    pub updated_at: DateTime<Utc>,
}

impl PaymentAttempt {
    /// An active attempt has been submitted to the gateway and not yet
    /// resolved either way.
    pub fn is_active(&self) -> bool {
        self.gateway_token.is_some() && self.status == PaymentStatus::Pending
    }
}
