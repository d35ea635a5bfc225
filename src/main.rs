mod auth;
mod config;
mod db;
mod error;
mod gateway;
mod handlers;
mod models;
mod notify;
mod poll;
mod reconcile;
mod state;

use axum::extract::MatchedPath;
use axum::http::{header, header::HeaderName, Method, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use config::Config;
use gateway::PaynowGateway;
use notify::Notifier;
use state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let pool = match db::connect(&cfg.db_url).await {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "db connect failed");
            std::process::exit(2);
        }
    };

    if let Err(e) = db::ensure_schema(&pool, &cfg.db_schema).await {
        tracing::error!(error = %e, "db ensure_schema failed");
        std::process::exit(2);
    }

    if cfg.seed_demo_data {
        if let Err(e) = db::seed_demo_buses(&pool, &cfg.db_schema).await {
            tracing::warn!(error = %e, "demo seed failed");
        }
    }

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap();

    let paynow = PaynowGateway::new(
        http.clone(),
        cfg.paynow_base_url.clone(),
        cfg.paynow_integration_id.clone(),
        cfg.paynow_integration_key.clone(),
        cfg.result_url.clone(),
        cfg.return_url.clone(),
    );

    let (notifier, notify_rx) = Notifier::channel(cfg.notify_queue_capacity);
    let _notify_worker = notify::spawn_worker(notify_rx, http, cfg.notify_url.clone());

    let state = AppState {
        pool,
        db_schema: cfg.db_schema.clone(),
        env_name: cfg.env_name.clone(),
        env_lower: cfg.env_lower.clone(),
        gateway: Arc::new(paynow),
        notifier,
        auth_token_secret: cfg.auth_token_secret.clone(),
        paynow_integration_key: cfg.paynow_integration_key.clone(),
        webhook_hash_required: cfg.webhook_hash_required,
        poll_interval: Duration::from_secs(cfg.poll_interval_secs),
        poll_max_attempts: cfg.poll_max_attempts,
    };

    let cors = if cfg.allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(booking_cors_allowed_headers())
            .allow_credentials(false)
    } else {
        let origins: Vec<axum::http::HeaderValue> = cfg
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(booking_cors_allowed_headers())
            .allow_credentials(false)
            .allow_origin(AllowOrigin::list(origins))
    };

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/buses", get(handlers::list_buses))
        .route("/buses/:id", get(handlers::bus_detail))
        .route("/buses/:id/occupied-seats", get(handlers::occupied_seats))
        .route("/tickets", post(handlers::create_ticket))
        .route("/tickets/user", get(handlers::list_user_tickets))
        .route("/tickets/:id", get(handlers::ticket_detail))
        .route("/payments/initiate", post(handlers::initiate_payment))
        .route("/payments/webhook", post(handlers::paynow_webhook))
        .route("/payments/history", get(handlers::payment_history))
        .route("/payments/:reference/status", get(handlers::payment_status))
        .route("/reports/bus-sales", get(handlers::report_bus_sales))
        .route("/reports/daily-summary", get(handlers::report_daily_summary))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(cfg.max_body_bytes))
        // Log the matched route template when available, otherwise just the
        // path (no query string).
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let path = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(MatchedPath::as_str)
                    .unwrap_or_else(|| req.uri().path());
                tracing::span!(
                    tracing::Level::INFO,
                    "http_request",
                    method = %req.method(),
                    path = %path
                )
            }),
        )
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ));

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));
    tracing::info!(%addr, env = %cfg.env_name, "starting zupco_booking");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

fn booking_cors_allowed_headers() -> Vec<HeaderName> {
    vec![
        header::ACCEPT,
        header::AUTHORIZATION,
        header::CONTENT_TYPE,
        HeaderName::from_static("x-request-id"),
    ]
}
