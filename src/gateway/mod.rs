//! Payment gateway seam and ZaloPay wire types.
//!
//! Every mutating request is signed with `key1` over a documented
//! pipe-joined field order; inbound callbacks are verified with `key2`
//! before their payload is trusted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::CoreError;

pub mod signing;
pub mod zalopay;

pub use zalopay::ZaloPayClient;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Network-level failure: connect, timeout, interrupted body.
    #[error("gateway transport failure: {0}")]
    Transport(String),
    /// The gateway answered, but with something we cannot interpret.
    #[error("gateway protocol error: {0}")]
    Protocol(String),
}

impl From<GatewayError> for CoreError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Transport(msg) => CoreError::GatewayTransport(msg),
            GatewayError::Protocol(msg) => CoreError::GatewayProtocol(msg),
        }
    }
}

/// ZaloPay v2 create-order request, form-encoded on the wire.
#[derive(Clone, Debug, Serialize)]
pub struct CreateOrderRequest {
    pub app_id: i64,
    pub app_user: String,
    pub app_trans_id: String,
    pub app_time: i64,
    pub amount: i64,
    pub description: String,
    pub bank_code: String,
    pub item: String,
    pub embed_data: String,
    pub callback_url: String,
    pub mac: String,
}

impl CreateOrderRequest {
    /// Field order is fixed by the gateway spec; changing it breaks the MAC.
    pub fn mac_input(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.app_id,
            self.app_trans_id,
            self.app_user,
            self.amount,
            self.app_time,
            self.embed_data,
            self.item
        )
    }
}

/// v2 create-order response. Fields are optional because the sandbox has
/// been observed to omit them; missing `return_code` is a protocol error
/// handled by the caller.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GatewayCreateResult {
    #[serde(default)]
    pub return_code: Option<i32>,
    #[serde(default)]
    pub return_message: Option<String>,
    #[serde(default)]
    pub sub_return_code: Option<i32>,
    #[serde(default)]
    pub sub_return_message: Option<String>,
    #[serde(default)]
    pub zp_trans_token: Option<String>,
    #[serde(default)]
    pub order_url: Option<String>,
    #[serde(default)]
    pub order_token: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusQueryRequest {
    pub app_id: i64,
    pub app_trans_id: String,
    pub mac: String,
}

impl StatusQueryRequest {
    pub fn mac_input(&self, key1: &str) -> String {
        format!("{}|{}|{}", self.app_id, self.app_trans_id, key1)
    }
}

/// Status query response. `return_code` is tri-state when present:
/// 1 = paid, 2 = definitively failed, 3 = still processing.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GatewayStatusResult {
    #[serde(default)]
    pub return_code: Option<i32>,
    #[serde(default)]
    pub return_message: Option<String>,
    #[serde(default)]
    pub zp_trans_id: Option<serde_json::Value>,
    #[serde(default)]
    pub amount: Option<i64>,
}

impl GatewayStatusResult {
    /// The settled transaction id as text, whichever JSON type the gateway
    /// chose to send it as.
    pub fn transaction_id(&self) -> Option<String> {
        match &self.zp_trans_id {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RefundRequest {
    pub app_id: i64,
    pub zp_trans_id: String,
    pub m_refund_id: String,
    pub timestamp: i64,
    pub amount: i64,
    pub description: String,
    pub mac: String,
}

impl RefundRequest {
    pub fn mac_input(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.app_id, self.zp_trans_id, self.amount, self.description, self.timestamp
        )
    }
}

/// Refund endpoints are v001 legacy: result keys carry no underscores.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GatewayRefundResult {
    #[serde(default, rename = "returncode")]
    pub return_code: Option<i32>,
    #[serde(default, rename = "returnmessage")]
    pub return_message: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RefundStatusRequest {
    pub appid: i64,
    pub mrefundid: String,
    pub timestamp: i64,
    pub mac: String,
}

impl RefundStatusRequest {
    pub fn mac_input(&self) -> String {
        format!("{}|{}|{}", self.appid, self.mrefundid, self.timestamp)
    }
}

/// The external payment processor. Synchronous request/response over HTTP;
/// any call may fail at the transport or protocol level.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(
        &self,
        req: &CreateOrderRequest,
    ) -> Result<GatewayCreateResult, GatewayError>;

    async fn query_status(
        &self,
        req: &StatusQueryRequest,
    ) -> Result<GatewayStatusResult, GatewayError>;

    async fn refund(&self, req: &RefundRequest) -> Result<GatewayRefundResult, GatewayError>;

    async fn refund_status(
        &self,
        req: &RefundStatusRequest,
    ) -> Result<GatewayRefundResult, GatewayError>;
}
