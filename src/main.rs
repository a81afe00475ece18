use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use axum::{routing::get, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use axum::body::Body;
use governor::middleware::NoOpMiddleware;
use http::{HeaderValue, StatusCode};
use tower_governor::governor::{GovernorConfig, GovernorConfigBuilder};
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::{GovernorError, GovernorLayer};

mod config;
mod db;
mod error;
mod routes;
mod services;

use config::{Config, RateLimitConfig};
use services::{
    init, notifications::NotificationService, queue::RetryQueue, store::NotificationStore,
};

pub struct AppState {
    pub config: Config,
    pub notifications: Arc<NotificationService>,
    pub queue: Arc<RetryQueue>,
}

fn json_response(status: StatusCode, body: serde_json::Value) -> http::Response<Body> {
    let mut resp = http::Response::new(Body::from(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

/// Map limiter errors onto the API error shape, with `Retry-After` on 429.
fn rate_limit_error(error: GovernorError) -> http::Response<Body> {
    match error {
        GovernorError::TooManyRequests { wait_time, headers } => {
            let mut resp = json_response(
                StatusCode::TOO_MANY_REQUESTS,
                serde_json::json!({
                    "error": {
                        "code": "RATE_LIMITED",
                        "message": "Rate limit exceeded",
                        "details": { "retry_after_seconds": wait_time }
                    }
                }),
            );

            if let Some(hmap) = headers {
                for (name, value) in hmap.iter() {
                    resp.headers_mut().append(name.clone(), value.clone());
                }
            }

            if let Ok(value) = HeaderValue::from_str(&wait_time.to_string()) {
                resp.headers_mut().insert(http::header::RETRY_AFTER, value);
            }

            resp
        }
        GovernorError::UnableToExtractKey => json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({
                "error": {
                    "code": "INVALID_REQUEST",
                    "message": "Unable to determine client IP for rate limiting"
                }
            }),
        ),
        GovernorError::Other { code, msg, headers } => {
            let body = msg.unwrap_or_else(|| "Rate limiting error".to_string());
            let mut resp = http::Response::new(Body::from(body));
            *resp.status_mut() =
                StatusCode::from_u16(code.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if let Some(hmap) = headers {
                for (name, value) in hmap.iter() {
                    resp.headers_mut().append(name.clone(), value.clone());
                }
            }
            resp
        }
    }
}

/// Per-client-IP limiter for the notification endpoints.
fn notifications_governor(
    limits: &RateLimitConfig,
) -> anyhow::Result<GovernorConfig<SmartIpKeyExtractor, NoOpMiddleware>> {
    GovernorConfigBuilder::default()
        .period(limits.replenish_interval())
        .burst_size(limits.burst)
        .key_extractor(SmartIpKeyExtractor)
        .error_handler(rate_limit_error)
        .finish()
        .ok_or_else(|| anyhow::anyhow!("Failed to build notifications governor config"))
}

fn cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers([http::header::CONTENT_TYPE, http::header::ACCEPT]);

    Ok(match &config.server.cors_allowed_origin {
        Some(origin) => layer.allow_origin(
            origin
                .parse::<HeaderValue>()
                .map_err(|e| anyhow::anyhow!("Invalid CORS_ALLOWED_ORIGIN: {}", e))?,
        ),
        None => layer.allow_origin(Any),
    })
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("Failed to bind SIGTERM, listening for Ctrl+C only: {}", e);
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notification_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    tracing::info!("Starting Notification Service");

    let queue = init::init_queue(&config.queue).await;
    let notifiers = init::build_notifiers(&config)?;
    let notifications = Arc::new(NotificationService::new(
        Arc::new(NotificationStore::new()),
        queue.clone(),
        notifiers,
    ));

    if let Err(e) = queue.consume(notifications.clone()).await {
        tracing::warn!(
            "Queue consumer not started, notifications will be delivered inline: {}",
            e
        );
    }

    let app_state = Arc::new(AppState {
        config: config.clone(),
        notifications,
        queue: queue.clone(),
    });

    let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let thread_shutdown = Arc::new(AtomicBool::new(false));

    let limiter_conf = Arc::new(notifications_governor(&config.rate_limit)?);

    // Background cleanup for limiter storage
    let limiter_cleaner = {
        let limiter = limiter_conf.limiter().clone();
        let interval = Duration::from_secs(60);
        let flag = thread_shutdown.clone();
        std::thread::spawn(move || {
            let tick = Duration::from_secs(1);
            loop {
                for _ in 0..interval.as_secs() {
                    if flag.load(Ordering::SeqCst) {
                        tracing::info!("Rate limiter cleanup thread exiting");
                        return;
                    }
                    std::thread::sleep(tick);
                }
                tracing::debug!("notifications rate limiter size: {}", limiter.len());
                limiter.retain_recent();
            }
        })
    };

    let rate_layer = GovernorLayer {
        config: limiter_conf.clone(),
    };

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .nest(
            "/notifications",
            routes::notifications::router().layer(rate_layer),
        )
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config)?);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // The signal task fans out over the broadcast channel: the server stops
    // accepting connections and the limiter thread exits.
    {
        let shutdown_tx = shutdown_tx.clone();
        let thread_shutdown = thread_shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
            thread_shutdown.store(true, Ordering::SeqCst);
        });
    }

    let mut server_shutdown = shutdown_tx.subscribe();
    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = server_shutdown.recv().await;
    })
    .await
    {
        tracing::error!("Server error: {}", e);
    }

    // Let in-flight deliveries settle before the transport is released.
    let shutdown_wait = Duration::from_secs(15);
    tracing::info!(
        "Waiting up to {}s for the notification queue to drain",
        shutdown_wait.as_secs()
    );
    if tokio::time::timeout(shutdown_wait, queue.close())
        .await
        .is_err()
    {
        tracing::warn!("Notification queue did not drain in time");
    }

    thread_shutdown.store(true, Ordering::SeqCst);
    if let Err(e) = limiter_cleaner.join() {
        tracing::warn!("Rate limiter cleanup thread join failed: {:?}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
