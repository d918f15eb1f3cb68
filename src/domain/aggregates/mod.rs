//! Aggregates module
pub mod order;

pub use order::{LineItem, Order, OrderDraft, OrderStatusRecord, PaymentAttempt, PaymentStatus};
