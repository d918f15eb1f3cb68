//! Domain events

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::warn;

/// Events emitted as orders move through their lifecycle. Published to NATS
/// when a client is configured; consumers are out of process.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    Created {
        order_id: i64,
        total: Decimal,
    },
    StatusChanged {
        order_id: i64,
        from: Option<String>,
        to: String,
    },
    Paid {
        order_id: i64,
        transaction_id: String,
    },
}

/// Fire-and-forget publisher. Delivery failures are logged, never
/// propagated into the order flow.
#[derive(Clone)]
pub struct EventPublisher {
    nats: Option<async_nats::Client>,
}

impl EventPublisher {
    pub fn new(nats: Option<async_nats::Client>) -> Self {
        Self { nats }
    }

    pub fn disabled() -> Self {
        Self { nats: None }
    }

    pub async fn publish(&self, event: &OrderEvent) {
        let Some(client) = &self.nats else {
            return;
        };
        let payload = match serde_json::to_vec(event) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("failed to serialize order event: {err}");
                return;
            }
        };
        if let Err(err) = client.publish("orders.status".to_string(), payload.into()).await {
            warn!("failed to publish order event: {err}");
        }
    }
}
