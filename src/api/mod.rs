//! HTTP surface. Handlers only translate between wire DTOs and the
//! services, and map core errors onto status codes. Authentication is an
//! upstream concern; the reverse proxy injects the caller's identity as
//! headers.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

use crate::domain::aggregates::{LineItem, OrderDraft};
use crate::domain::status::OrderStatus;
use crate::domain::value_objects::Money;
use crate::service::lifecycle::OrderLifecycleService;
use crate::service::reconciler::{
    CallbackPayload, PaymentReconciler, PaymentResponse, Requester,
};
use crate::CoreError;

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<OrderLifecycleService>,
    pub reconciler: PaymentReconciler,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/orders", post(create_order))
        .route("/api/v1/orders/:id/status", get(get_order_status).put(update_order_status))
        .route("/api/v1/orders/:id/cancel", put(cancel_order))
        .route("/api/v1/purchase/:id/zalopay", get(purchase))
        .route("/api/v1/purchase/zalopay/callback", post(zalopay_callback))
        .route("/api/v1/purchase/zalopay/status", get(zalopay_status))
        .route("/api/v1/purchase/zalopay/refund", get(zalopay_refund))
        .route("/api/v1/purchase/zalopay/refund/status", get(zalopay_refund_status))
        .route("/api/v1/purchase/zalopay/result", get(zalopay_result))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "healthy", "service": "storefront"}))
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrderBody {
    pub user_id: i64,
    pub shipping_method_id: Option<i64>,
    #[validate(length(min = 1, message = "order must contain at least one line"))]
    pub lines: Vec<OrderLineBody>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OrderLineBody {
    pub product_item_id: i64,
    pub name: String,
    pub qty: u32,
    pub unit_price: Money,
    pub total: Money,
}

async fn create_order(
    State(s): State<AppState>,
    Json(body): Json<CreateOrderBody>,
) -> Response {
    if let Err(err) = body.validate() {
        return (StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": err.to_string()})))
            .into_response();
    }
    let draft = OrderDraft {
        user_id: body.user_id,
        shipping_method_id: body.shipping_method_id,
        // Shipping price is always resolved server-side for API callers.
        shipping_price: None,
        lines: body
            .lines
            .into_iter()
            .map(|l| LineItem {
                id: uuid::Uuid::new_v4(),
                product_item_id: l.product_item_id,
                name: l.name,
                qty: l.qty,
                unit_price: l.unit_price,
                total: l.total,
            })
            .collect(),
    };
    match s.lifecycle.create_order(draft).await {
        Ok(order) => (StatusCode::CREATED, Json(order)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_order_status(State(s): State<AppState>, Path(id): Path<i64>) -> Response {
    match s.lifecycle.current_status(id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("no status history for order {id}")})),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusBody {
    pub status: String,
    pub note: Option<String>,
    pub detail: Option<String>,
}

async fn update_order_status(
    State(s): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateStatusBody>,
) -> Response {
    let Some(target) = OrderStatus::from_code(&body.status) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": format!("unknown status code: {}", body.status)})),
        )
            .into_response();
    };
    match s.lifecycle.transition(id, target, body.note, body.detail).await {
        Ok(record) => Json(record).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    pub note: Option<String>,
    pub detail: Option<String>,
}

async fn cancel_order(
    State(s): State<AppState>,
    Path(id): Path<i64>,
    body: Option<Json<CancelBody>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    match s.lifecycle.cancel(id, body.note, body.detail).await {
        Ok(record) => Json(record).into_response(),
        Err(err) => error_response(err),
    }
}

// =============================================================================
// Payments
// =============================================================================

/// Create a gateway payment. Always answers 200; business failures ride in
/// the body so thin clients never have to branch on transport status for a
/// routine rejection.
async fn purchase(State(s): State<AppState>, Path(order_id): Path<i64>) -> Response {
    match s.reconciler.initiate(order_id).await {
        Ok(response) => Json(response).into_response(),
        Err(CoreError::DuplicatePayment(msg)) | Err(CoreError::InvalidOrder(msg)) => {
            Json(PaymentResponse::error(-1, msg)).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn zalopay_callback(
    State(s): State<AppState>,
    Json(payload): Json<CallbackPayload>,
) -> Response {
    match s.reconciler.handle_callback(&payload).await {
        Ok(ack) => Json(ack).into_response(),
        Err(CoreError::CallbackVerificationFailed(_)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"return_code": -1, "return_message": "mac not equal"})),
        )
            .into_response(),
        // The gateway retries on its own; answer 200 with a failure body.
        Err(err) => Json(serde_json::json!({
            "return_code": -1,
            "return_message": format!("error: {err}"),
        }))
        .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusQueryParams {
    pub app_trans_id: String,
}

async fn zalopay_status(
    State(s): State<AppState>,
    Query(params): Query<StatusQueryParams>,
) -> Response {
    match s.reconciler.query_status(&params.app_trans_id).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct RefundParams {
    #[serde(rename = "orderId")]
    pub order_id: i64,
}

async fn zalopay_refund(
    State(s): State<AppState>,
    Query(params): Query<RefundParams>,
    headers: HeaderMap,
) -> Response {
    let Some(requester) = requester_from(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "missing caller identity"})),
        )
            .into_response();
    };
    match s.reconciler.refund(params.order_id, &requester).await {
        Ok(result) => Json(result).into_response(),
        Err(CoreError::InvalidOrder(msg)) => {
            Json(serde_json::json!({"returncode": -1, "returnmessage": msg})).into_response()
        }
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct RefundStatusParams {
    #[serde(rename = "mRefundId")]
    pub m_refund_id: String,
}

async fn zalopay_refund_status(
    State(s): State<AppState>,
    Query(params): Query<RefundStatusParams>,
) -> Response {
    match s.reconciler.refund_status(&params.m_refund_id).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct PaymentResultParams {
    pub apptransid: String,
}

async fn zalopay_result(
    State(s): State<AppState>,
    Query(params): Query<PaymentResultParams>,
) -> Response {
    match s.reconciler.payment_result(&params.apptransid).await {
        Ok(view) => Json(view).into_response(),
        // A garbled transaction id from the redirect is the caller's fault.
        Err(CoreError::GatewayProtocol(msg)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": msg})),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

/// Caller identity injected by the auth proxy.
fn requester_from(headers: &HeaderMap) -> Option<Requester> {
    let user_id = headers.get("x-user-id")?.to_str().ok()?.parse().ok()?;
    let is_admin = headers
        .get("x-user-role")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|role| role.eq_ignore_ascii_case("ADMIN"));
    Some(Requester { user_id, is_admin })
}

fn error_response(err: CoreError) -> Response {
    let (status, body) = match &err {
        CoreError::OrderNotFound(_) => (
            StatusCode::NOT_FOUND,
            serde_json::json!({"error": err.to_string()}),
        ),
        CoreError::InvalidTransition { current, attempted, reason } => (
            StatusCode::CONFLICT,
            serde_json::json!({
                "error": reason,
                "current_status": current.map(|s| s.code()),
                "attempted_status": attempted.code(),
            }),
        ),
        CoreError::InvalidOrder(_) => (
            StatusCode::BAD_REQUEST,
            serde_json::json!({"error": err.to_string()}),
        ),
        CoreError::DuplicatePayment(_) => (
            StatusCode::CONFLICT,
            serde_json::json!({"error": err.to_string()}),
        ),
        CoreError::CallbackVerificationFailed(_) => (
            StatusCode::BAD_REQUEST,
            serde_json::json!({"error": err.to_string()}),
        ),
        CoreError::Forbidden(_) => (
            StatusCode::FORBIDDEN,
            serde_json::json!({"error": err.to_string()}),
        ),
        CoreError::GatewayTransport(_) | CoreError::GatewayProtocol(_) => (
            StatusCode::BAD_GATEWAY,
            serde_json::json!({"error": err.to_string()}),
        ),
        CoreError::Storage(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({"error": err.to_string()}),
        ),
    };
    (status, Json(body)).into_response()
}
