use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use axum::{response::IntoResponse, routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use axum::body::Body;
use http::{HeaderValue, StatusCode};
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::{GovernorError, GovernorLayer};

mod config;
mod db;
mod error;
mod routes;
mod services;
#[cfg(test)]
mod test_utils;

use config::Config;
use error::AppError;
use services::dispatch::DispatchCoordinator;
use services::init;
use services::stats::StatsObserver;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub coordinator: Arc<DispatchCoordinator>,
    pub stats: Arc<StatsObserver>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "push_dispatcher=debug,tower_http=debug".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// 429 in the service's error shape, with the governor's wait as Retry-After.
fn rate_limit_response(error: GovernorError) -> http::Response<Body> {
    match error {
        GovernorError::TooManyRequests { wait_time, headers } => {
            let mut resp = AppError::RateLimited.into_response();
            if let Some(hmap) = headers {
                for (name, value) in hmap.iter() {
                    resp.headers_mut().append(name.clone(), value.clone());
                }
            }
            resp.headers_mut()
                .insert(http::header::RETRY_AFTER, HeaderValue::from(wait_time));
            resp
        }
        GovernorError::UnableToExtractKey => AppError::BadRequest(
            "Unable to determine client IP for rate limiting".to_string(),
        )
        .into_response(),
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

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

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
                tracing::warn!("Failed to bind SIGTERM, only Ctrl+C will stop the server: {}", e);
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;

    tracing::info!("Starting push dispatcher v{}", env!("CARGO_PKG_VERSION"));

    let pool = init::init_db(&config).await?;

    let stats = Arc::new(StatsObserver::new());
    let coordinator = Arc::new(init::build_coordinator(&config, pool.clone(), stats.clone())?);

    let app_state = Arc::new(AppState {
        db: pool,
        config: config.clone(),
        coordinator: coordinator.clone(),
        stats,
    });

    let thread_shutdown = Arc::new(AtomicBool::new(false));

    // Per-IP limit on the dispatch trigger.
    let mut trigger_builder = GovernorConfigBuilder::default().key_extractor(SmartIpKeyExtractor);
    trigger_builder.per_second(config.trigger.per_second.max(1).into());
    trigger_builder.burst_size(config.trigger.burst.max(1));
    trigger_builder.error_handler(rate_limit_response);
    let trigger_gov_conf = Arc::new(
        trigger_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Failed to build trigger governor config"))?,
    );

    // Background cleanup for limiter storage
    let trigger_cleaner = {
        let limiter = trigger_gov_conf.limiter().clone();
        let interval = Duration::from_secs(60);
        let flag = thread_shutdown.clone();
        std::thread::spawn(move || {
            let tick = Duration::from_secs(1);
            loop {
                for _ in 0..interval.as_secs() {
                    if flag.load(Ordering::SeqCst) {
                        tracing::info!("Trigger rate limiter cleanup thread exiting");
                        return;
                    }
                    std::thread::sleep(tick);
                }
                tracing::debug!("trigger rate limiter size: {}", limiter.len());
                limiter.retain_recent();
            }
        })
    };

    let trigger_rate_layer = GovernorLayer {
        config: trigger_gov_conf.clone(),
    };

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .nest(
            "/api/dispatch",
            routes::dispatch::router().layer(trigger_rate_layer),
        )
        .nest("/api/recipients", routes::devices::router())
        .with_state(app_state.clone())
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server_fut = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    // Dropping the server future stops accepting connections; dispatches that
    // already answered early keep running on the coordinator's tracker.
    tokio::select! {
        res = server_fut => {
            if let Err(e) = res {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, no longer accepting requests");
        }
    }
    thread_shutdown.store(true, Ordering::SeqCst);

    coordinator.shutdown(config.dispatch.shutdown_grace()).await;

    if let Err(e) = trigger_cleaner.join() {
        tracing::warn!("Rate limiter cleanup thread join failed: {:?}", e);
    }

    app_state.db.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
