//! Payment reconciliation against the ZaloPay gateway.
//!
//! The gateway is eventually consistent and delivers results at least
//! once, through two independent channels: a server-to-server callback and
//! a client-driven polling fallback for environments the callback cannot
//! reach. Both channels converge on one idempotent finalization path, so a
//! payment settles exactly once no matter how many events arrive.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::ZaloPayConfig;
use crate::domain::aggregates::{Order, OrderStatusRecord, PaymentAttempt, PaymentStatus};
use crate::domain::events::{EventPublisher, OrderEvent};
use crate::domain::status::OrderStatus;
use crate::domain::value_objects::Money;
use crate::gateway::{
    signing, CreateOrderRequest, GatewayCreateResult, GatewayError, GatewayRefundResult,
    GatewayStatusResult, PaymentGateway, RefundRequest, RefundStatusRequest, StatusQueryRequest,
};
use crate::service::idempotency::IdempotencyGuard;
use crate::service::lifecycle::OrderLifecycleService;
use crate::service::runtime::{Clock, Scheduler};
use crate::store::OrderStore;
use crate::{CoreError, Result};

/// Body returned by the payment-creation endpoint. Business failures ride
/// in here with a normal HTTP status; the gateway's code and message are
/// passed through for the client to display.
#[derive(Clone, Debug, Serialize)]
pub struct PaymentResponse {
    pub return_code: i32,
    pub return_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zp_trans_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_trans_id: Option<String>,
}

impl PaymentResponse {
    pub fn success(result: GatewayCreateResult, app_trans_id: String) -> Self {
        Self {
            return_code: 1,
            return_message: result.return_message.unwrap_or_else(|| "success".to_string()),
            order_url: result.order_url,
            zp_trans_token: result.zp_trans_token,
            order_token: result.order_token,
            app_trans_id: Some(app_trans_id),
        }
    }

    pub fn error(return_code: i32, return_message: impl Into<String>) -> Self {
        Self {
            return_code,
            return_message: return_message.into(),
            order_url: None,
            zp_trans_token: None,
            order_token: None,
            app_trans_id: None,
        }
    }
}

/// Raw callback envelope: the payload bytes exactly as signed, plus the MAC.
#[derive(Clone, Debug, Deserialize)]
pub struct CallbackPayload {
    pub data: String,
    pub mac: String,
}

/// Parsed contents of the callback `data` field.
#[derive(Clone, Debug, Deserialize)]
struct CallbackData {
    app_trans_id: String,
    #[serde(default)]
    zp_trans_id: Option<serde_json::Value>,
}

impl CallbackData {
    fn transaction_id(&self) -> Option<String> {
        match &self.zp_trans_id {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Acknowledgement body sent back to the gateway.
#[derive(Clone, Debug, Serialize)]
pub struct CallbackAck {
    pub return_code: i32,
    pub return_message: String,
}

impl CallbackAck {
    fn ok(message: &str) -> Self {
        Self { return_code: 1, return_message: message.to_string() }
    }
}

/// The authenticated principal asking for a refund. Produced by the auth
/// layer; only ownership and privilege matter here.
#[derive(Clone, Debug)]
pub struct Requester {
    pub user_id: i64,
    pub is_admin: bool,
}

/// Current payment state of an order, looked up by transaction id after
/// the gateway redirects the customer back to the storefront.
#[derive(Clone, Debug, Serialize)]
pub struct PaymentResultView {
    pub order_id: i64,
    pub total: Money,
    pub status: Option<String>,
    pub paid: bool,
}

enum FinalizeOutcome {
    Marked,
    AlreadyProcessing,
    AlreadyPaid,
}

/// Extract the order id from a `{yymmdd}_{orderId}_{epochMillis}`
/// transaction id. A malformed id is a hard failure.
pub fn parse_correlation_id(app_trans_id: &str) -> Result<i64> {
    let trimmed = app_trans_id.trim();
    if trimmed.is_empty() {
        return Err(CoreError::GatewayProtocol("transaction id is empty".to_string()));
    }
    let mut parts = trimmed.split('_');
    let date_prefix = parts.next().unwrap_or_default();
    if date_prefix.len() != 6 || !date_prefix.chars().all(|c| c.is_ascii_digit()) {
        warn!(app_trans_id, "transaction id has unexpected date prefix");
    }
    let order_part = parts.next().ok_or_else(|| {
        CoreError::GatewayProtocol(format!(
            "invalid transaction id format: {trimmed}, expected {{yymmdd}}_{{orderId}}_{{timestamp}}"
        ))
    })?;
    order_part.parse::<i64>().map_err(|_| {
        CoreError::GatewayProtocol(format!("cannot parse order id from transaction id: {trimmed}"))
    })
}

/// Transaction ids and refund ids are dated in the gateway's timezone
/// (GMT+7), independent of server locale.
fn date_prefix(now: DateTime<Utc>) -> String {
    let gmt7 = FixedOffset::east_opt(7 * 3600).expect("fixed offset in range");
    now.with_timezone(&gmt7).format("%y%m%d").to_string()
}

fn describe_return_code(code: i32) -> String {
    match code {
        -2 => "Invalid request or MAC verification failed".to_string(),
        -1 => "Request failed, please try again".to_string(),
        2 => "Payment failed or order was cancelled".to_string(),
        3 => "Payment is still processing".to_string(),
        other => format!("Gateway error (code: {other})"),
    }
}

#[derive(Clone)]
pub struct PaymentReconciler {
    cfg: ZaloPayConfig,
    gateway: Arc<dyn PaymentGateway>,
    lifecycle: Arc<OrderLifecycleService>,
    store: Arc<dyn OrderStore>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    events: EventPublisher,
    guard: IdempotencyGuard,
}

impl PaymentReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: ZaloPayConfig,
        gateway: Arc<dyn PaymentGateway>,
        lifecycle: Arc<OrderLifecycleService>,
        store: Arc<dyn OrderStore>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        events: EventPublisher,
    ) -> Self {
        Self {
            cfg,
            gateway,
            lifecycle,
            store,
            scheduler,
            clock,
            events,
            guard: IdempotencyGuard::new(),
        }
    }

    /// Create a gateway payment for an order.
    ///
    /// Gateway-side failures, including transport errors, come back as an
    /// error-shaped [`PaymentResponse`] rather than an `Err`: the HTTP
    /// layer always answers 200 and the body carries the business result.
    pub async fn initiate(&self, order_id: i64) -> Result<PaymentResponse> {
        info!(order_id, "creating gateway payment");
        let order = self
            .store
            .find_by_id(order_id)
            .await?
            .ok_or(CoreError::OrderNotFound(order_id))?;

        let amount = order
            .total
            .to_minor_units()
            .filter(|a| *a > 0)
            .ok_or_else(|| {
                CoreError::InvalidOrder(format!(
                    "Cannot create payment: order #{order_id} has invalid total ({}); total must be greater than 0",
                    order.total
                ))
            })?;

        if self.lifecycle.has_status(order_id, OrderStatus::Paid).await? {
            return Err(CoreError::DuplicatePayment(format!(
                "Order #{order_id} has already been paid"
            )));
        }

        let existing = self.store.payment_for(order_id).await?;
        if let Some(payment) = &existing {
            if payment.gateway_token.as_deref().is_some_and(|t| !t.trim().is_empty()) {
                return Err(CoreError::DuplicatePayment(format!(
                    "Order #{order_id} already has an active gateway transaction"
                )));
            }
        }

        let item = item_manifest(&order)?;
        let now = self.clock.now();
        // Globally unique across retries: even two creates for the same
        // order land on different millisecond timestamps.
        let app_trans_id = format!("{}_{}_{}", date_prefix(now), order_id, now.timestamp_millis());

        let mut request = CreateOrderRequest {
            app_id: self.cfg.app_id,
            app_user: format!("user{}", order.user_id),
            app_trans_id: app_trans_id.clone(),
            app_time: now.timestamp_millis(),
            amount,
            description: format!("Payment for order #{order_id}"),
            bank_code: "zalopayapp".to_string(),
            item,
            embed_data: format!(r#"{{"redirecturl": "{}"}}"#, self.cfg.redirect_url),
            callback_url: self.cfg.callback_url.clone(),
            mac: String::new(),
        };
        request.mac = signing::sign(&self.cfg.key1, &request.mac_input());

        let result = match self.gateway.create_order(&request).await {
            Ok(result) => result,
            Err(GatewayError::Transport(err)) => {
                error!(order_id, %err, "gateway unreachable during payment creation");
                return Ok(PaymentResponse::error(-1, format!("Network error: {err}")));
            }
            Err(GatewayError::Protocol(err)) => {
                error!(order_id, %err, "unparseable gateway response during payment creation");
                return Ok(PaymentResponse::error(-1, format!("Gateway response error: {err}")));
            }
        };

        let Some(return_code) = result.return_code else {
            error!(order_id, "gateway create response is missing return_code");
            return Ok(PaymentResponse::error(
                -1,
                "Gateway response format error: missing return_code",
            ));
        };
        if return_code != 1 {
            warn!(
                order_id,
                return_code,
                sub_return_code = result.sub_return_code,
                "gateway rejected payment creation"
            );
            let message = result
                .return_message
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| describe_return_code(return_code));
            return Ok(PaymentResponse::error(return_code, message));
        }

        info!(order_id, %app_trans_id, "gateway payment created");
        let mut payment = existing.unwrap_or(PaymentAttempt {
            id: 0,
            order_id,
            correlation_id: None,
            gateway_token: None,
            status: PaymentStatus::Pending,
            updated_at: now,
        });
        payment.correlation_id = Some(app_trans_id.clone());
        payment.gateway_token = result.zp_trans_token.clone();
        payment.updated_at = now;
        self.store.save_payment(payment).await?;

        // Always arm the polling fallback; the callback may never arrive.
        self.schedule_poll(app_trans_id.clone(), 0);

        Ok(PaymentResponse::success(result, app_trans_id))
    }

    /// Handle a server-to-server payment callback.
    ///
    /// The MAC is verified before anything in the payload is trusted.
    /// Re-deliveries of an already-settled transaction are acknowledged as
    /// success without touching state.
    pub async fn handle_callback(&self, payload: &CallbackPayload) -> Result<CallbackAck> {
        if !signing::verify(&self.cfg.key2, &payload.data, &payload.mac) {
            warn!("callback MAC verification failed, discarding payload");
            return Err(CoreError::CallbackVerificationFailed("mac not equal".to_string()));
        }

        let data: CallbackData = serde_json::from_str(&payload.data).map_err(|err| {
            CoreError::GatewayProtocol(format!("unparseable callback data: {err}"))
        })?;
        let order_id = parse_correlation_id(&data.app_trans_id)?;
        info!(order_id, app_trans_id = %data.app_trans_id, "processing payment callback");

        match self
            .finalize_paid(order_id, &data.app_trans_id, data.transaction_id())
            .await?
        {
            FinalizeOutcome::Marked => Ok(CallbackAck::ok("success")),
            FinalizeOutcome::AlreadyProcessing => {
                warn!(order_id, "callback already being processed");
                Ok(CallbackAck::ok("success (already processed)"))
            }
            FinalizeOutcome::AlreadyPaid => {
                info!(order_id, "order already marked as paid, skipping");
                Ok(CallbackAck::ok("success (already paid)"))
            }
        }
    }

    /// Schedule poll attempt `attempt` for a transaction, unless the
    /// attempt budget is spent. Each attempt is its own scheduled task;
    /// chains end by simply not rescheduling.
    pub fn schedule_poll(&self, app_trans_id: String, attempt: u32) {
        if attempt >= self.cfg.max_polling_attempts {
            warn!(%app_trans_id, "max polling attempts reached, leaving order as-is");
            return;
        }
        let delay = if attempt == 0 {
            self.cfg.first_poll_delay
        } else {
            self.cfg.polling_interval
        };
        let this = self.clone();
        self.scheduler.schedule_once(
            delay,
            Box::pin(async move {
                this.poll_once(app_trans_id, attempt).await;
            }),
        );
    }

    /// One polling attempt. Success and definitive failure both end the
    /// chain; everything else re-schedules against the attempt budget.
    async fn poll_once(&self, app_trans_id: String, attempt: u32) {
        info!(
            %app_trans_id,
            attempt = attempt + 1,
            max = self.cfg.max_polling_attempts,
            "polling payment status"
        );

        let mut request = StatusQueryRequest {
            app_id: self.cfg.app_id,
            app_trans_id: app_trans_id.clone(),
            mac: String::new(),
        };
        request.mac = signing::sign(&self.cfg.key1, &request.mac_input(&self.cfg.key1));

        let status = match self.gateway.query_status(&request).await {
            Ok(status) => status,
            Err(err) => {
                // Transport and protocol errors are transient here; polling
                // exists to absorb exactly this.
                warn!(%app_trans_id, %err, "status poll failed, will retry");
                self.schedule_poll(app_trans_id, attempt + 1);
                return;
            }
        };

        let order_id = match parse_correlation_id(&app_trans_id) {
            Ok(order_id) => order_id,
            Err(err) => {
                error!(%app_trans_id, %err, "cannot resolve order for polled transaction");
                return;
            }
        };

        match status.return_code {
            Some(1) => {
                info!(order_id, %app_trans_id, "payment settled, finalizing");
                if let Err(err) = self
                    .finalize_paid(order_id, &app_trans_id, status.transaction_id())
                    .await
                {
                    error!(order_id, %err, "failed to finalize settled payment");
                }
            }
            Some(2) => {
                warn!(order_id, %app_trans_id, "payment definitively failed, cancelling order");
                self.handle_failed_payment(order_id, &app_trans_id).await;
            }
            Some(3) => {
                info!(order_id, %app_trans_id, "payment still processing");
                self.schedule_poll(app_trans_id, attempt + 1);
            }
            Some(code) => {
                // Includes "not paid yet" codes; keep polling.
                warn!(order_id, code, "unexpected status return code, continuing to poll");
                self.schedule_poll(app_trans_id, attempt + 1);
            }
            None => {
                error!(order_id, "status response missing return_code, continuing to poll");
                self.schedule_poll(app_trans_id, attempt + 1);
            }
        }
    }

    /// Request a refund of a settled payment. Reported to the caller
    /// verbatim; refund completion is not reconciled back into order
    /// status.
    pub async fn refund(&self, order_id: i64, requester: &Requester) -> Result<GatewayRefundResult> {
        info!(order_id, user_id = requester.user_id, "processing refund request");
        let order = self
            .store
            .find_by_id(order_id)
            .await?
            .ok_or(CoreError::OrderNotFound(order_id))?;

        if !self.lifecycle.has_status(order_id, OrderStatus::Paid).await? {
            return Err(CoreError::InvalidOrder(format!(
                "Order #{order_id} has not been paid yet"
            )));
        }
        let payment = self.store.payment_for(order_id).await?.ok_or_else(|| {
            CoreError::InvalidOrder(format!("No payment attempt recorded for order #{order_id}"))
        })?;
        let gateway_transaction = payment.gateway_token.clone().ok_or_else(|| {
            CoreError::InvalidOrder(format!(
                "Order #{order_id} has no settled gateway transaction"
            ))
        })?;

        if requester.user_id != order.user_id && !requester.is_admin {
            warn!(order_id, user_id = requester.user_id, "unauthorized refund attempt");
            return Err(CoreError::Forbidden(
                "You are not authorized to refund this order".to_string(),
            ));
        }

        let amount = order.total.to_minor_units().ok_or_else(|| {
            CoreError::InvalidOrder(format!("Order #{order_id} total does not fit a gateway amount"))
        })?;
        let now = self.clock.now();
        let timestamp = now.timestamp_millis();
        let suffix: i64 = rand::thread_rng().gen_range(111..999);
        let m_refund_id = format!("{}_{}_{}{}", date_prefix(now), self.cfg.app_id, timestamp, suffix);

        let mut request = RefundRequest {
            app_id: self.cfg.app_id,
            zp_trans_id: gateway_transaction,
            m_refund_id,
            timestamp,
            amount,
            description: format!("Refund for order #{order_id}"),
            mac: String::new(),
        };
        request.mac = signing::sign(&self.cfg.key1, &request.mac_input());

        let result = self.gateway.refund(&request).await?;
        let return_code = result.return_code.ok_or_else(|| {
            CoreError::GatewayProtocol("refund response missing returncode".to_string())
        })?;
        info!(order_id, return_code, "gateway refund result");
        Ok(result)
    }

    /// Signed status query passthrough, for clients verifying a payment
    /// directly after the gateway redirect.
    pub async fn query_status(&self, app_trans_id: &str) -> Result<GatewayStatusResult> {
        let mut request = StatusQueryRequest {
            app_id: self.cfg.app_id,
            app_trans_id: app_trans_id.to_string(),
            mac: String::new(),
        };
        request.mac = signing::sign(&self.cfg.key1, &request.mac_input(&self.cfg.key1));
        Ok(self.gateway.query_status(&request).await?)
    }

    /// Query the gateway for the state of a previously requested refund.
    pub async fn refund_status(&self, m_refund_id: &str) -> Result<GatewayRefundResult> {
        let timestamp = self.clock.now().timestamp_millis();
        let mut request = RefundStatusRequest {
            appid: self.cfg.app_id,
            mrefundid: m_refund_id.to_string(),
            timestamp,
            mac: String::new(),
        };
        request.mac = signing::sign(&self.cfg.key1, &request.mac_input());
        Ok(self.gateway.refund_status(&request).await?)
    }

    /// Resolve a transaction id back to its order and report the order's
    /// payment state. Used by the storefront after the gateway redirect.
    pub async fn payment_result(&self, app_trans_id: &str) -> Result<PaymentResultView> {
        let order_id = parse_correlation_id(app_trans_id)?;
        let order = self
            .store
            .find_by_id(order_id)
            .await?
            .ok_or(CoreError::OrderNotFound(order_id))?;
        let current = self.lifecycle.current_status(order_id).await?;
        Ok(PaymentResultView {
            order_id,
            total: order.total,
            status: current
                .as_ref()
                .and_then(OrderStatusRecord::status)
                .map(|s| s.code().to_string()),
            paid: self.lifecycle.has_status(order_id, OrderStatus::Paid).await?,
        })
    }

    /// The single idempotent finalization path shared by the callback
    /// handler and the polling task. The guard makes concurrent events for
    /// one transaction mutually exclusive; the ledger check makes repeated
    /// events no-ops. The permit releases on drop whichever way the body
    /// exits.
    async fn finalize_paid(
        &self,
        order_id: i64,
        app_trans_id: &str,
        transaction_id: Option<String>,
    ) -> Result<FinalizeOutcome> {
        let Some(_permit) = self.guard.try_acquire(app_trans_id) else {
            return Ok(FinalizeOutcome::AlreadyProcessing);
        };

        if self.lifecycle.has_status(order_id, OrderStatus::Paid).await? {
            return Ok(FinalizeOutcome::AlreadyPaid);
        }

        let transaction_id = transaction_id.unwrap_or_else(|| "N/A".to_string());
        self.lifecycle
            .transition(
                order_id,
                OrderStatus::Paid,
                Some(format!(
                    "Payment received via ZaloPay. Transaction ID: {transaction_id}"
                )),
                None,
            )
            .await?;

        let mut payment = self.store.payment_for(order_id).await?.ok_or_else(|| {
            CoreError::Storage(format!("payment not found for order {order_id}"))
        })?;
        payment.gateway_token = Some(transaction_id.clone());
        payment.status = PaymentStatus::Paid;
        payment.updated_at = self.clock.now();
        self.store.save_payment(payment).await?;

        info!(order_id, "order marked as paid");
        self.events
            .publish(&OrderEvent::Paid { order_id, transaction_id })
            .await;
        Ok(FinalizeOutcome::Marked)
    }

    /// Definitive gateway failure: cancel the order and resolve the
    /// attempt. Runs inside the polling task, so failures are logged and
    /// swallowed rather than propagated.
    async fn handle_failed_payment(&self, order_id: i64, app_trans_id: &str) {
        match self.lifecycle.has_status(order_id, OrderStatus::Cancelled).await {
            Ok(true) => {
                info!(order_id, "order already cancelled, skipping");
                return;
            }
            Ok(false) => {}
            Err(err) => {
                error!(order_id, %err, "failed to read order status");
                return;
            }
        }

        if let Err(err) = self
            .lifecycle
            .cancel(
                order_id,
                Some(format!("Payment failed. Transaction ID: {app_trans_id}")),
                Some("Payment processing error at gateway".to_string()),
            )
            .await
        {
            error!(order_id, %err, "failed to cancel order after payment failure");
            return;
        }

        match self.store.payment_for(order_id).await {
            Ok(Some(mut payment)) => {
                payment.status = PaymentStatus::Cancelled;
                payment.updated_at = self.clock.now();
                if let Err(err) = self.store.save_payment(payment).await {
                    error!(order_id, %err, "failed to resolve payment attempt");
                }
            }
            Ok(None) => warn!(order_id, "no payment attempt to resolve"),
            Err(err) => error!(order_id, %err, "failed to load payment attempt"),
        }
    }
}

fn item_manifest(order: &Order) -> Result<String> {
    if order.lines.is_empty() {
        return Err(CoreError::InvalidOrder(
            "Cannot create payment: order must contain at least one product".to_string(),
        ));
    }
    let items: Vec<serde_json::Value> = order
        .lines
        .iter()
        .map(|line| {
            serde_json::json!({
                "itemid": line.product_item_id.to_string(),
                "itemname": line.name,
                "itemprice": line.unit_price.to_minor_units().unwrap_or(0),
                "itemquantity": line.qty,
            })
        })
        .collect();
    serde_json::to_string(&items)
        .map_err(|err| CoreError::InvalidOrder(format!("cannot serialize item manifest: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{LineItem, Order, OrderDraft};
    use crate::gateway::GatewayStatusResult;
    use crate::service::runtime::{ScheduledTask, SystemClock};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Default)]
    struct MockGateway {
        create_queue: Mutex<VecDeque<std::result::Result<GatewayCreateResult, GatewayError>>>,
        status_queue: Mutex<VecDeque<std::result::Result<GatewayStatusResult, GatewayError>>>,
        refund_queue: Mutex<VecDeque<std::result::Result<GatewayRefundResult, GatewayError>>>,
        status_calls: AtomicU32,
        refund_requests: Mutex<Vec<RefundRequest>>,
    }

    impl MockGateway {
        fn push_status(&self, result: std::result::Result<GatewayStatusResult, GatewayError>) {
            self.status_queue.lock().unwrap().push_back(result);
        }

        fn push_create(&self, result: std::result::Result<GatewayCreateResult, GatewayError>) {
            self.create_queue.lock().unwrap().push_back(result);
        }

        fn status_calls(&self) -> u32 {
            self.status_calls.load(Ordering::SeqCst)
        }

        fn settled(transaction_id: i64) -> GatewayStatusResult {
            serde_json::from_value(serde_json::json!({
                "return_code": 1,
                "return_message": "success",
                "zp_trans_id": transaction_id,
            }))
            .unwrap()
        }

        fn with_code(code: i32) -> GatewayStatusResult {
            serde_json::from_value(serde_json::json!({ "return_code": code })).unwrap()
        }
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn create_order(
            &self,
            _req: &CreateOrderRequest,
        ) -> std::result::Result<GatewayCreateResult, GatewayError> {
            self.create_queue.lock().unwrap().pop_front().unwrap_or_else(|| {
                Ok(GatewayCreateResult {
                    return_code: Some(1),
                    return_message: Some("success".into()),
                    zp_trans_token: Some("tok-1".into()),
                    order_url: Some("https://gateway.example/pay".into()),
                    ..Default::default()
                })
            })
        }

        async fn query_status(
            &self,
            _req: &StatusQueryRequest,
        ) -> std::result::Result<GatewayStatusResult, GatewayError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            self.status_queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(MockGateway::with_code(3)))
        }

        async fn refund(
            &self,
            req: &RefundRequest,
        ) -> std::result::Result<GatewayRefundResult, GatewayError> {
            self.refund_requests.lock().unwrap().push(req.clone());
            self.refund_queue.lock().unwrap().pop_front().unwrap_or_else(|| {
                Ok(GatewayRefundResult {
                    return_code: Some(1),
                    return_message: Some("refund accepted".into()),
                })
            })
        }

        async fn refund_status(
            &self,
            _req: &RefundStatusRequest,
        ) -> std::result::Result<GatewayRefundResult, GatewayError> {
            Ok(GatewayRefundResult {
                return_code: Some(1),
                return_message: Some("refund complete".into()),
            })
        }
    }

    /// Captures scheduled tasks instead of running them, so tests drive
    /// the polling chain by hand.
    #[derive(Default)]
    struct TestScheduler {
        queue: Mutex<Vec<(Duration, ScheduledTask)>>,
    }

    impl Scheduler for TestScheduler {
        fn schedule_once(&self, delay: Duration, task: ScheduledTask) {
            self.queue.lock().unwrap().push((delay, task));
        }
    }

    impl TestScheduler {
        fn pending(&self) -> usize {
            self.queue.lock().unwrap().len()
        }

        fn take_next(&self) -> Option<ScheduledTask> {
            let mut queue = self.queue.lock().unwrap();
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0).1)
            }
        }

        async fn drain(&self) -> usize {
            let mut ran = 0;
            while let Some(task) = self.take_next() {
                task.await;
                ran += 1;
            }
            ran
        }
    }

    struct Fixture {
        reconciler: PaymentReconciler,
        lifecycle: Arc<OrderLifecycleService>,
        store: Arc<InMemoryStore>,
        gateway: Arc<MockGateway>,
        scheduler: Arc<TestScheduler>,
    }

    fn test_config() -> ZaloPayConfig {
        ZaloPayConfig {
            app_id: 2554,
            key1: "key1".into(),
            key2: "key2".into(),
            create_endpoint: "http://gateway.test/create".into(),
            query_endpoint: "http://gateway.test/query".into(),
            refund_endpoint: "http://gateway.test/refund".into(),
            refund_status_endpoint: "http://gateway.test/refundstatus".into(),
            callback_url: "http://shop.test/callback".into(),
            redirect_url: "http://shop.test/result".into(),
            first_poll_delay: Duration::from_secs(10),
            polling_interval: Duration::from_secs(120),
            max_polling_attempts: 3,
            http_timeout: Duration::from_secs(30),
        }
    }

    fn fixture() -> Fixture {
        let store = Arc::new(
            InMemoryStore::new().with_shipping_price(1, Money::vnd(Decimal::from(20))),
        );
        let lifecycle = Arc::new(OrderLifecycleService::new(
            store.clone(),
            store.clone(),
            EventPublisher::disabled(),
            Arc::new(SystemClock),
        ));
        let gateway = Arc::new(MockGateway::default());
        let scheduler = Arc::new(TestScheduler::default());
        let reconciler = PaymentReconciler::new(
            test_config(),
            gateway.clone(),
            lifecycle.clone(),
            store.clone(),
            scheduler.clone(),
            Arc::new(SystemClock),
            EventPublisher::disabled(),
        );
        Fixture { reconciler, lifecycle, store, gateway, scheduler }
    }

    fn line(qty: u32, total: i64) -> LineItem {
        LineItem {
            id: Uuid::new_v4(),
            product_item_id: 7,
            name: "Widget".into(),
            qty,
            unit_price: Money::vnd(Decimal::from(total / qty.max(1) as i64)),
            total: Money::vnd(Decimal::from(total)),
        }
    }

    async fn create_order(fx: &Fixture) -> Order {
        fx.lifecycle
            .create_order(OrderDraft {
                user_id: 1,
                shipping_method_id: Some(1),
                shipping_price: None,
                lines: vec![line(2, 100), line(1, 50)],
            })
            .await
            .unwrap()
    }

    fn callback_payload(app_trans_id: &str, transaction_id: i64) -> CallbackPayload {
        let data = serde_json::json!({
            "app_trans_id": app_trans_id,
            "zp_trans_id": transaction_id,
        })
        .to_string();
        let mac = signing::sign("key2", &data);
        CallbackPayload { data, mac }
    }

    fn correlation_id_for(order: &Order) -> String {
        format!("251217_{}_1765957661610", order.id)
    }

    async fn current_status(fx: &Fixture, order_id: i64) -> Option<OrderStatus> {
        fx.lifecycle
            .current_status(order_id)
            .await
            .unwrap()
            .and_then(|r| r.status())
    }

    #[test]
    fn test_correlation_id_parses_order_id() {
        assert_eq!(parse_correlation_id("251217_28_1765957661610").unwrap(), 28);
    }

    #[test]
    fn test_correlation_id_malformed_is_hard_failure() {
        for bad in ["nope", "", "  ", "251217_notanumber_1"] {
            let err = parse_correlation_id(bad).unwrap_err();
            assert!(matches!(err, CoreError::GatewayProtocol(_)), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn test_initiate_creates_and_arms_polling() {
        let fx = fixture();
        let order = create_order(&fx).await;
        let response = fx.reconciler.initiate(order.id).await.unwrap();
        assert_eq!(response.return_code, 1);
        assert_eq!(response.zp_trans_token.as_deref(), Some("tok-1"));

        let app_trans_id = response.app_trans_id.unwrap();
        assert_eq!(parse_correlation_id(&app_trans_id).unwrap(), order.id);

        let payment = fx.store.payment_for(order.id).await.unwrap().unwrap();
        assert_eq!(payment.gateway_token.as_deref(), Some("tok-1"));
        assert_eq!(payment.correlation_id.as_deref(), Some(app_trans_id.as_str()));

        // First poll armed unconditionally after a successful create.
        assert_eq!(fx.scheduler.pending(), 1);
    }

    #[tokio::test]
    async fn test_initiate_rejects_already_paid() {
        let fx = fixture();
        let order = create_order(&fx).await;
        fx.lifecycle
            .transition(order.id, OrderStatus::Paid, None, None)
            .await
            .unwrap();
        let err = fx.reconciler.initiate(order.id).await.unwrap_err();
        assert!(matches!(err, CoreError::DuplicatePayment(_)));
    }

    #[tokio::test]
    async fn test_initiate_rejects_active_attempt() {
        let fx = fixture();
        let order = create_order(&fx).await;
        fx.reconciler.initiate(order.id).await.unwrap();
        let err = fx.reconciler.initiate(order.id).await.unwrap_err();
        assert!(matches!(err, CoreError::DuplicatePayment(_)));
    }

    #[tokio::test]
    async fn test_initiate_rejects_invalid_total() {
        let fx = fixture();
        fx.store.seed_bare_order(Order {
            id: 90,
            user_id: 1,
            shipping_method_id: None,
            total: Money::zero("VND"),
            lines: vec![line(1, 50)],
            created_at: Utc::now(),
        });
        let err = fx.reconciler.initiate(90).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidOrder(_)));
    }

    #[tokio::test]
    async fn test_initiate_missing_order() {
        let fx = fixture();
        let err = fx.reconciler.initiate(404).await.unwrap_err();
        assert!(matches!(err, CoreError::OrderNotFound(404)));
    }

    #[tokio::test]
    async fn test_initiate_transport_failure_is_error_body_not_err() {
        let fx = fixture();
        let order = create_order(&fx).await;
        fx.gateway
            .push_create(Err(GatewayError::Transport("connection refused".into())));
        let response = fx.reconciler.initiate(order.id).await.unwrap();
        assert_eq!(response.return_code, -1);
        assert!(response.return_message.contains("Network error"));
        // A failed create never arms polling.
        assert_eq!(fx.scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_initiate_gateway_rejection_passes_code_through() {
        let fx = fixture();
        let order = create_order(&fx).await;
        fx.gateway.push_create(Ok(GatewayCreateResult {
            return_code: Some(2),
            return_message: Some("insufficient funds".into()),
            ..Default::default()
        }));
        let response = fx.reconciler.initiate(order.id).await.unwrap();
        assert_eq!(response.return_code, 2);
        assert_eq!(response.return_message, "insufficient funds");
        assert_eq!(fx.scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_callback_marks_paid_exactly_once() {
        let fx = fixture();
        let order = create_order(&fx).await;
        let app_trans_id = correlation_id_for(&order);
        let payload = callback_payload(&app_trans_id, 190001);

        let first = fx.reconciler.handle_callback(&payload).await.unwrap();
        assert_eq!(first.return_code, 1);
        assert_eq!(first.return_message, "success");

        let second = fx.reconciler.handle_callback(&payload).await.unwrap();
        assert_eq!(second.return_code, 1);
        assert_eq!(second.return_message, "success (already paid)");

        let paid_records = fx
            .store
            .status_history(order.id)
            .into_iter()
            .filter(|r| r.status() == Some(OrderStatus::Paid))
            .count();
        assert_eq!(paid_records, 1);

        let payment = fx.store.payment_for(order.id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Paid);
        assert_eq!(payment.gateway_token.as_deref(), Some("190001"));
    }

    #[tokio::test]
    async fn test_callback_rejects_bad_mac() {
        let fx = fixture();
        let order = create_order(&fx).await;
        let mut payload = callback_payload(&correlation_id_for(&order), 190001);
        payload.mac = signing::sign("wrong-key", &payload.data);

        let err = fx.reconciler.handle_callback(&payload).await.unwrap_err();
        assert!(matches!(err, CoreError::CallbackVerificationFailed(_)));
        assert_eq!(current_status(&fx, order.id).await, Some(OrderStatus::PendingPayment));
    }

    #[tokio::test]
    async fn test_callback_rejects_malformed_transaction_id() {
        let fx = fixture();
        create_order(&fx).await;
        let data = serde_json::json!({ "app_trans_id": "nope" }).to_string();
        let mac = signing::sign("key2", &data);
        let err = fx
            .reconciler
            .handle_callback(&CallbackPayload { data, mac })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::GatewayProtocol(_)));
    }

    #[tokio::test]
    async fn test_callback_while_in_flight_acks_without_processing() {
        let fx = fixture();
        let order = create_order(&fx).await;
        let app_trans_id = correlation_id_for(&order);
        let _held = fx.reconciler.guard.try_acquire(&app_trans_id).unwrap();

        let ack = fx
            .reconciler
            .handle_callback(&callback_payload(&app_trans_id, 190001))
            .await
            .unwrap();
        assert_eq!(ack.return_message, "success (already processed)");
        assert_eq!(current_status(&fx, order.id).await, Some(OrderStatus::PendingPayment));
    }

    #[tokio::test]
    async fn test_polling_stops_after_max_attempts() {
        let fx = fixture();
        let order = create_order(&fx).await;
        let app_trans_id = correlation_id_for(&order);

        // Gateway answers "still processing" forever; the chain must stop
        // at exactly max_polling_attempts.
        fx.reconciler.schedule_poll(app_trans_id, 0);
        fx.scheduler.drain().await;

        assert_eq!(fx.gateway.status_calls(), 3);
        assert_eq!(fx.scheduler.pending(), 0);
        assert_eq!(current_status(&fx, order.id).await, Some(OrderStatus::PendingPayment));
    }

    #[tokio::test]
    async fn test_poll_success_finalizes_and_stops() {
        let fx = fixture();
        let order = create_order(&fx).await;
        let app_trans_id = correlation_id_for(&order);
        fx.gateway.push_status(Ok(MockGateway::settled(190001)));

        fx.reconciler.schedule_poll(app_trans_id, 0);
        fx.scheduler.drain().await;

        assert_eq!(fx.gateway.status_calls(), 1);
        assert_eq!(current_status(&fx, order.id).await, Some(OrderStatus::Paid));
        let payment = fx.store.payment_for(order.id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_poll_definitive_failure_cancels_and_stops() {
        let fx = fixture();
        let order = create_order(&fx).await;
        let app_trans_id = correlation_id_for(&order);
        fx.gateway.push_status(Ok(MockGateway::with_code(2)));

        fx.reconciler.schedule_poll(app_trans_id, 0);
        fx.scheduler.drain().await;

        // Attempts remained in the budget, but failure is terminal.
        assert_eq!(fx.gateway.status_calls(), 1);
        assert_eq!(fx.scheduler.pending(), 0);
        assert_eq!(current_status(&fx, order.id).await, Some(OrderStatus::Cancelled));
        let payment = fx.store.payment_for(order.id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_poll_transport_error_is_transient() {
        let fx = fixture();
        let order = create_order(&fx).await;
        let app_trans_id = correlation_id_for(&order);
        fx.gateway.push_status(Err(GatewayError::Transport("timeout".into())));
        fx.gateway.push_status(Ok(MockGateway::settled(190001)));

        fx.reconciler.schedule_poll(app_trans_id, 0);
        fx.scheduler.drain().await;

        assert_eq!(fx.gateway.status_calls(), 2);
        assert_eq!(current_status(&fx, order.id).await, Some(OrderStatus::Paid));
    }

    #[tokio::test]
    async fn test_poll_missing_return_code_keeps_polling() {
        let fx = fixture();
        let order = create_order(&fx).await;
        let app_trans_id = correlation_id_for(&order);
        fx.gateway.push_status(Ok(GatewayStatusResult::default()));
        fx.gateway.push_status(Ok(MockGateway::with_code(-49)));
        fx.gateway.push_status(Ok(MockGateway::settled(190001)));

        fx.reconciler.schedule_poll(app_trans_id, 0);
        fx.scheduler.drain().await;

        assert_eq!(fx.gateway.status_calls(), 3);
        assert_eq!(current_status(&fx, order.id).await, Some(OrderStatus::Paid));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_callback_and_poll_settle_once() {
        let fx = fixture();
        let order = create_order(&fx).await;
        let app_trans_id = correlation_id_for(&order);
        fx.gateway.push_status(Ok(MockGateway::settled(190001)));

        let callback = {
            let reconciler = fx.reconciler.clone();
            let payload = callback_payload(&app_trans_id, 190001);
            tokio::spawn(async move { reconciler.handle_callback(&payload).await })
        };
        let poll = {
            let reconciler = fx.reconciler.clone();
            let app_trans_id = app_trans_id.clone();
            tokio::spawn(async move { reconciler.poll_once(app_trans_id, 0).await })
        };

        let callback_result = callback.await.unwrap();
        poll.await.unwrap();

        // Whichever path lost the race acked idempotently; neither panicked
        // and exactly one PAID record exists.
        assert_eq!(callback_result.unwrap().return_code, 1);
        let paid_records = fx
            .store
            .status_history(order.id)
            .into_iter()
            .filter(|r| r.status() == Some(OrderStatus::Paid))
            .count();
        assert_eq!(paid_records, 1);
    }

    #[tokio::test]
    async fn test_refund_requires_paid_order() {
        let fx = fixture();
        let order = create_order(&fx).await;
        let requester = Requester { user_id: 1, is_admin: false };
        let err = fx.reconciler.refund(order.id, &requester).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidOrder(_)));
    }

    #[tokio::test]
    async fn test_refund_requires_owner_or_admin() {
        let fx = fixture();
        let order = create_order(&fx).await;
        fx.reconciler
            .handle_callback(&callback_payload(&correlation_id_for(&order), 190001))
            .await
            .unwrap();

        let stranger = Requester { user_id: 999, is_admin: false };
        let err = fx.reconciler.refund(order.id, &stranger).await.unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));

        let admin = Requester { user_id: 999, is_admin: true };
        let result = fx.reconciler.refund(order.id, &admin).await.unwrap();
        assert_eq!(result.return_code, Some(1));
    }

    #[tokio::test]
    async fn test_refund_id_embeds_date_and_app_id() {
        let fx = fixture();
        let order = create_order(&fx).await;
        fx.reconciler
            .handle_callback(&callback_payload(&correlation_id_for(&order), 190001))
            .await
            .unwrap();
        let owner = Requester { user_id: 1, is_admin: false };
        fx.reconciler.refund(order.id, &owner).await.unwrap();

        let requests = fx.gateway.refund_requests.lock().unwrap();
        let request = requests.last().unwrap();
        let parts: Vec<&str> = request.m_refund_id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 6);
        assert_eq!(parts[1], "2554");
        assert_eq!(request.zp_trans_id, "190001");
        assert_eq!(request.amount, 170);
    }

    #[tokio::test]
    async fn test_payment_result_reports_paid_state() {
        let fx = fixture();
        let order = create_order(&fx).await;
        let app_trans_id = correlation_id_for(&order);

        let before = fx.reconciler.payment_result(&app_trans_id).await.unwrap();
        assert!(!before.paid);
        assert_eq!(before.status.as_deref(), Some("PENDING_PAYMENT"));

        fx.reconciler
            .handle_callback(&callback_payload(&app_trans_id, 190001))
            .await
            .unwrap();

        let after = fx.reconciler.payment_result(&app_trans_id).await.unwrap();
        assert!(after.paid);
        assert_eq!(after.status.as_deref(), Some("PAID"));
        assert_eq!(after.order_id, order.id);
    }
}
