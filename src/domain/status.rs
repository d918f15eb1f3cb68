//! Order status codes and the state machine that governs transitions.
//!
//! Business flow:
//! - COD:    PENDING_PAYMENT(skip) → CONFIRMED → PREPARING → SHIPPING → DELIVERED → COMPLETED
//! - Online: PENDING_PAYMENT → PAID → CONFIRMED → PREPARING → SHIPPING → DELIVERED → COMPLETED
//! - Cancel: PENDING_PAYMENT/PAID/CONFIRMED/PREPARING → CANCELLED
//! - Return: DELIVERED/COMPLETED → RETURNED

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of a shop order.
///
/// The numeric rank doubles as the code stored in the status ledger and
/// defines the cancellability cutoff: an order can only be cancelled while
/// its rank is strictly below `Shipping`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    PendingPayment,
    Paid,
    Confirmed,
    Preparing,
    Shipping,
    Delivered,
    Completed,
    Cancelled,
    Returned,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 9] = [
        OrderStatus::PendingPayment,
        OrderStatus::Paid,
        OrderStatus::Confirmed,
        OrderStatus::Preparing,
        OrderStatus::Shipping,
        OrderStatus::Delivered,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
        OrderStatus::Returned,
    ];

    /// Numeric rank stored in the ledger.
    pub fn rank(self) -> i32 {
        match self {
            OrderStatus::PendingPayment => 1,
            OrderStatus::Paid => 2,
            OrderStatus::Confirmed => 3,
            OrderStatus::Preparing => 4,
            OrderStatus::Shipping => 5,
            OrderStatus::Delivered => 6,
            OrderStatus::Completed => 7,
            OrderStatus::Cancelled => 8,
            OrderStatus::Returned => 9,
        }
    }

    pub fn from_rank(rank: i32) -> Option<OrderStatus> {
        OrderStatus::ALL.into_iter().find(|s| s.rank() == rank)
    }

    /// Machine-readable code used on the wire.
    pub fn code(self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "PENDING_PAYMENT",
            OrderStatus::Paid => "PAID",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Preparing => "PREPARING",
            OrderStatus::Shipping => "SHIPPING",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Returned => "RETURNED",
        }
    }

    pub fn from_code(code: &str) -> Option<OrderStatus> {
        OrderStatus::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Display label shown to customers.
    pub fn label(self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "Awaiting payment",
            OrderStatus::Paid => "Paid",
            OrderStatus::Confirmed => "Confirmed",
            OrderStatus::Preparing => "Preparing",
            OrderStatus::Shipping => "Shipping",
            OrderStatus::Delivered => "Delivered",
            OrderStatus::Completed => "Completed",
            OrderStatus::Cancelled => "Cancelled",
            OrderStatus::Returned => "Returned",
        }
    }

    /// Legal destination states from this one. Fixed at compile time.
    pub fn allowed_next(self) -> &'static [OrderStatus] {
        use OrderStatus::*;
        match self {
            PendingPayment => &[Paid, Confirmed, Cancelled],
            Paid => &[Confirmed, Cancelled],
            Confirmed => &[Preparing, Cancelled],
            Preparing => &[Shipping, Cancelled],
            Shipping => &[Delivered],
            Delivered => &[Completed, Returned],
            Completed => &[Returned],
            Cancelled | Returned => &[],
        }
    }

    /// Final means no outgoing edges. `Completed` still carries the return
    /// edge, so it is not final.
    pub fn is_final(self) -> bool {
        self.allowed_next().is_empty()
    }

    /// Orders can only be cancelled before they ship.
    pub fn is_cancellable(self) -> bool {
        self.rank() < OrderStatus::Shipping.rank() && !self.is_final()
    }

    pub fn is_returnable(self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Completed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Validates proposed status transitions against the fixed edge table.
///
/// Pure: no state, never panics. Unknown or absent statuses simply yield
/// `false` / an empty edge set / an explanatory message.
pub struct OrderStateMachine;

impl OrderStateMachine {
    /// Check whether `current → next` is a legal transition.
    pub fn is_allowed(current: Option<OrderStatus>, next: Option<OrderStatus>) -> bool {
        let (Some(current), Some(next)) = (current, next) else {
            return false;
        };
        current != next && current.allowed_next().contains(&next)
    }

    /// All legal destinations from `current`; empty for absent input.
    pub fn allowed_next(current: Option<OrderStatus>) -> &'static [OrderStatus] {
        current.map(OrderStatus::allowed_next).unwrap_or(&[])
    }

    /// Human-readable reason why `current → next` is rejected. Surfaced to
    /// API callers as the body of a 409 response, so it is never empty for
    /// a disallowed transition.
    pub fn explain(current: Option<OrderStatus>, next: Option<OrderStatus>) -> String {
        match (current, next) {
            (None, _) | (_, None) => {
                "Invalid status: current or requested status is unknown".to_string()
            }
            (Some(c), Some(n)) if c == n => {
                format!("Order is already in {} status", c.label())
            }
            (Some(c), Some(_)) if c.is_final() => {
                format!("Cannot change status: order is in final state {}", c.label())
            }
            (Some(c), Some(n)) => {
                let allowed = c
                    .allowed_next()
                    .iter()
                    .map(|s| s.label())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "Cannot transition from {} to {}. Allowed transitions: {}",
                    c.label(),
                    n.label(),
                    allowed
                )
            }
        }
    }
}
