//! ZaloPay v2 sandbox client.
//!
//! All endpoints take form-encoded POSTs and answer JSON. Responses are
//! logged raw before parsing; the sandbox is known to drift from its own
//! documentation.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::ZaloPayConfig;

use super::{
    CreateOrderRequest, GatewayCreateResult, GatewayError, GatewayRefundResult,
    GatewayStatusResult, PaymentGateway, RefundRequest, RefundStatusRequest, StatusQueryRequest,
};

pub struct ZaloPayClient {
    http: Client,
    create_endpoint: String,
    query_endpoint: String,
    refund_endpoint: String,
    refund_status_endpoint: String,
}

impl ZaloPayClient {
    pub fn new(cfg: &ZaloPayConfig) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(cfg.http_timeout)
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            create_endpoint: cfg.create_endpoint.clone(),
            query_endpoint: cfg.query_endpoint.clone(),
            refund_endpoint: cfg.refund_endpoint.clone(),
            refund_status_endpoint: cfg.refund_status_endpoint.clone(),
        })
    }

    async fn post_form<Req: Serialize, Res: DeserializeOwned>(
        &self,
        endpoint: &str,
        req: &Req,
    ) -> Result<Res, GatewayError> {
        let response = self
            .http
            .post(endpoint)
            .form(req)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        debug!(endpoint, raw = %body, "gateway response");
        serde_json::from_str(&body)
            .map_err(|e| GatewayError::Protocol(format!("unparseable gateway response: {e}")))
    }
}

#[async_trait]
impl PaymentGateway for ZaloPayClient {
    async fn create_order(
        &self,
        req: &CreateOrderRequest,
    ) -> Result<GatewayCreateResult, GatewayError> {
        self.post_form(&self.create_endpoint, req).await
    }

    async fn query_status(
        &self,
        req: &StatusQueryRequest,
    ) -> Result<GatewayStatusResult, GatewayError> {
        self.post_form(&self.query_endpoint, req).await
    }

    async fn refund(&self, req: &RefundRequest) -> Result<GatewayRefundResult, GatewayError> {
        self.post_form(&self.refund_endpoint, req).await
    }

    async fn refund_status(
        &self,
        req: &RefundStatusRequest,
    ) -> Result<GatewayRefundResult, GatewayError> {
        self.post_form(&self.refund_status_endpoint, req).await
    }
}
