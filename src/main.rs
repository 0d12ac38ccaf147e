use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::HeaderValue;
use tokio::{signal, sync::mpsc};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

use storefront_api as api;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config().context("failed to load configuration")?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    let db = api::db::establish_connection(&cfg)
        .await
        .context("failed to connect to database")?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db)
            .await
            .context("failed to run migrations")?;
    }

    let (event_tx, event_rx) = mpsc::channel(1024);
    let event_sender = api::events::EventSender::new(event_tx);
    tokio::spawn(api::events::process_events(event_rx));

    let config = Arc::new(cfg);
    let gateway: Arc<dyn api::payments::PaymentGateway> =
        Arc::new(api::payments::HttpPaymentGateway::new(
            config.payment_gateway_url.clone(),
            config.payment_gateway_secret.clone(),
        ));
    let notifier: Arc<dyn api::notifications::LowStockNotifier> =
        match &config.low_stock_notify_url {
            Some(url) => {
                info!("Low stock alerts will be posted to {}", url);
                Arc::new(api::notifications::HttpNotifier::new(url.clone()))
            }
            None => Arc::new(api::notifications::LogNotifier),
        };

    let webhook_verifier = config.payment_webhook_secret.clone().map(|secret| {
        api::payments::WebhookVerifier::new(secret, config.payment_webhook_tolerance_secs)
    });
    if webhook_verifier.is_none() {
        info!("Payment webhook secret not configured; inbound webhooks disabled");
    }

    let services = api::services::AppServices::new(
        db.clone(),
        config.clone(),
        event_sender.clone(),
        gateway,
        notifier,
    );

    let app_state = Arc::new(api::AppState {
        db,
        config: config.clone(),
        event_sender,
        services,
        webhook_verifier,
    });

    let cors_layer = match &config.cors_allowed_origins {
        Some(raw) => {
            let origins: Vec<HeaderValue> = raw
                .split(',')
                .filter_map(|origin| {
                    let trimmed = origin.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        HeaderValue::from_str(trimmed).ok()
                    }
                })
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
        None => CorsLayer::permissive(),
    };

    let app = api::handlers::routes()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(cors_layer)
        .with_state(app_state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid bind address")?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind listener")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
