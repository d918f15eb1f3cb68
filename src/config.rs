//! Environment-driven configuration.

use std::time::Duration;

use anyhow::Context;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub nats_url: Option<String>,
    pub zalopay: ZaloPayConfig,
}

/// ZaloPay sandbox properties.
///
/// `key1` signs outbound requests, `key2` verifies inbound callbacks.
#[derive(Clone, Debug)]
pub struct ZaloPayConfig {
    pub app_id: i64,
    pub key1: String,
    pub key2: String,
    pub create_endpoint: String,
    pub query_endpoint: String,
    pub refund_endpoint: String,
    pub refund_status_endpoint: String,
    pub callback_url: String,
    pub redirect_url: String,
    /// Delay before the first status poll after a create.
    pub first_poll_delay: Duration,
    /// Spacing between subsequent polls.
    pub polling_interval: Duration,
    /// Polling stops for good once this many attempts have run.
    pub max_polling_attempts: u32,
    pub http_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            port: env_or("PORT", "8084").parse().context("invalid PORT")?,
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            nats_url: std::env::var("NATS_URL").ok(),
            zalopay: ZaloPayConfig::from_env()?,
        })
    }
}

impl ZaloPayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            app_id: env_or("ZALOPAY_APP_ID", "2554")
                .parse()
                .context("invalid ZALOPAY_APP_ID")?,
            key1: std::env::var("ZALOPAY_KEY1").context("ZALOPAY_KEY1 is required")?,
            key2: std::env::var("ZALOPAY_KEY2").context("ZALOPAY_KEY2 is required")?,
            create_endpoint: env_or(
                "ZALOPAY_CREATE_ENDPOINT",
                "https://sb-openapi.zalopay.vn/v2/create",
            ),
            query_endpoint: env_or(
                "ZALOPAY_QUERY_ENDPOINT",
                "https://sandbox.zalopay.com.vn/v001/tpe/getstatusbyapptransid",
            ),
            refund_endpoint: env_or(
                "ZALOPAY_REFUND_ENDPOINT",
                "https://sandbox.zalopay.com.vn/v001/tpe/partialrefund",
            ),
            refund_status_endpoint: env_or(
                "ZALOPAY_REFUND_STATUS_ENDPOINT",
                "https://sandbox.zalopay.com.vn/v001/tpe/getpartialrefundstatus",
            ),
            callback_url: std::env::var("ZALOPAY_CALLBACK_URL")
                .context("ZALOPAY_CALLBACK_URL is required")?,
            redirect_url: std::env::var("ZALOPAY_REDIRECT_URL")
                .context("ZALOPAY_REDIRECT_URL is required")?,
            first_poll_delay: Duration::from_secs(
                env_or("ZALOPAY_FIRST_POLL_DELAY_SECONDS", "10")
                    .parse()
                    .context("invalid ZALOPAY_FIRST_POLL_DELAY_SECONDS")?,
            ),
            polling_interval: Duration::from_secs(
                env_or("ZALOPAY_POLLING_INTERVAL_SECONDS", "120")
                    .parse()
                    .context("invalid ZALOPAY_POLLING_INTERVAL_SECONDS")?,
            ),
            max_polling_attempts: env_or("ZALOPAY_MAX_POLLING_ATTEMPTS", "8")
                .parse()
                .context("invalid ZALOPAY_MAX_POLLING_ATTEMPTS")?,
            http_timeout: Duration::from_secs(
                env_or("ZALOPAY_HTTP_TIMEOUT_SECONDS", "30")
                    .parse()
                    .context("invalid ZALOPAY_HTTP_TIMEOUT_SECONDS")?,
            ),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
