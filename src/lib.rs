//! Storefront Order & Payment Service
//!
//! Self-hosted order backend with ZaloPay payment reconciliation.
//!
//! ## Features
//! - Order lifecycle managed through an append-only status ledger
//! - State-machine validation of every status transition
//! - ZaloPay order creation, callback verification and refunds
//! - Polling fallback that reconciles pending payments when the
//!   gateway cannot reach the callback URL

use thiserror::Error;

use crate::domain::status::OrderStatus;

pub mod api;
pub mod config;
pub mod domain;
pub mod gateway;
pub mod service;
pub mod store;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Order {0} not found")]
    OrderNotFound(i64),

    #[error("Invalid status transition: {reason}")]
    InvalidTransition {
        current: Option<OrderStatus>,
        attempted: OrderStatus,
        reason: String,
    },

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Duplicate payment: {0}")]
    DuplicatePayment(String),

    #[error("Callback verification failed: {0}")]
    CallbackVerificationFailed(String),

    #[error("Payment gateway unreachable: {0}")]
    GatewayTransport(String),

    #[error("Payment gateway protocol error: {0}")]
    GatewayProtocol(String),

    #[error("Not authorized: {0}")]
    Forbidden(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
