//! Storefront - Self-hosted Order & Payment Service

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storefront::api::{self, AppState};
use storefront::config::AppConfig;
use storefront::domain::events::EventPublisher;
use storefront::gateway::ZaloPayClient;
use storefront::service::{
    OrderLifecycleService, PaymentReconciler, SystemClock, TokioScheduler,
};
use storefront::store::{OrderStore, PgStore, ShippingPriceLookup};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&db).await?;

    let nats = match &config.nats_url {
        Some(url) => match async_nats::connect(url).await {
            Ok(client) => Some(client),
            Err(err) => {
                tracing::warn!("NATS unavailable, events disabled: {err}");
                None
            }
        },
        None => None,
    };
    let events = EventPublisher::new(nats);

    let pg = Arc::new(PgStore::new(db));
    let store: Arc<dyn OrderStore> = pg.clone();
    let shipping: Arc<dyn ShippingPriceLookup> = pg;
    let clock = Arc::new(SystemClock);

    let lifecycle = Arc::new(OrderLifecycleService::new(
        store.clone(),
        shipping,
        events.clone(),
        clock.clone(),
    ));
    let gateway = Arc::new(ZaloPayClient::new(&config.zalopay)?);
    let reconciler = PaymentReconciler::new(
        config.zalopay.clone(),
        gateway,
        lifecycle.clone(),
        store,
        Arc::new(TokioScheduler),
        clock,
        events,
    );

    let app = api::router(AppState { lifecycle, reconciler })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("🚀 Storefront listening on 0.0.0.0:{}", config.port);
    axum::serve(
        tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?,
        app,
    )
    .await?;
    Ok(())
}
