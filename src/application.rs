//! Component wiring and server lifecycle.
//!
//! Components initialize leaves-first: the rate-limit store and limiter,
//! then the repository (with migration), the log sink, the script
//! engine, and finally the proxy itself. Shutdown runs the same
//! teardown in reverse of the data flow: drain the sink, close the
//! repository, the store, and the metrics collector.

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::proxy::handler::{proxy_handler, ProxyService};
use crate::ratelimit::{build_store, rate_limit_middleware, RateLimitState, RateLimiter};
use crate::repository;
use crate::telemetry::LogSink;
use crate::transform::ScriptEngine;
use axum::routing::get;
use axum::{middleware, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Reserved path serving the metrics JSON snapshot.
pub const METRICS_PATH: &str = "/metrics";

/// Fully wired gateway, ready to serve.
pub struct Application {
    settings: Settings,
    router: Router,
    sink: Arc<LogSink>,
    limiter: Option<Arc<RateLimiter>>,
    metrics: Arc<MetricsCollector>,
}

impl Application {
    pub async fn new(settings: Settings) -> Result<Self> {
        let metrics = Arc::new(MetricsCollector::new("muhtar", "muhtar_proxy")?);

        let limiter = if settings.rate_limit.enabled {
            let store = build_store(&settings.rate_limit).await?;
            Some(Arc::new(RateLimiter::new(
                settings.rate_limit.clone(),
                store,
            )?))
        } else {
            None
        };

        let repository = repository::connect(&settings.db).await?;
        repository
            .migrate()
            .await
            .map_err(|e| Error::application(format!("database migration failed: {e}")))?;
        info!("database migrations completed");

        let sink = Arc::new(LogSink::new(
            repository,
            Arc::clone(&metrics),
            settings.db.pool.workers,
            settings.db.pool.batch_size,
        ));

        let engine = Arc::new(ScriptEngine::load(&settings.proxy.transform)?);

        let proxy = Arc::new(ProxyService::new(
            &settings,
            engine,
            Arc::clone(&sink),
            Arc::clone(&metrics),
        )?);

        let rate_limit_state = limiter.as_ref().map(|limiter| {
            Arc::new(RateLimitState {
                limiter: Arc::clone(limiter),
                metrics: Arc::clone(&metrics),
                response: settings.rate_limit.response.clone(),
                fail_open: settings.rate_limit.fail_open,
            })
        });

        let router = build_router(proxy, rate_limit_state, Arc::clone(&metrics));

        Ok(Self {
            settings,
            router,
            sink,
            limiter,
            metrics,
        })
    }

    /// Serves until SIGINT/SIGTERM, then drains and closes components.
    pub async fn run(self) -> Result<()> {
        let addr = format!(
            "{}:{}",
            self.settings.server.host, self.settings.server.port
        );
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, target = %self.settings.proxy.target, "muhtar listening");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        info!("server stopped, draining telemetry");
        self.sink.shutdown().await;
        if let Some(limiter) = &self.limiter {
            limiter.close().await;
        }
        self.metrics.close().await;
        info!("shutdown complete");
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The assembled router, for in-process exercising in tests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

/// Assembles the router: the proxy fallback behind the rate-limit
/// middleware, with the reserved metrics route added outside it.
pub fn build_router(
    proxy: Arc<ProxyService>,
    rate_limit: Option<Arc<RateLimitState>>,
    metrics: Arc<MetricsCollector>,
) -> Router {
    let mut router = Router::new().fallback(proxy_handler).with_state(proxy);

    if let Some(state) = rate_limit {
        router = router.layer(middleware::from_fn_with_state(
            state,
            rate_limit_middleware,
        ));
    }

    router.route(
        METRICS_PATH,
        get(move || {
            let metrics = Arc::clone(&metrics);
            async move { Json(metrics.snapshot()) }
        }),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
