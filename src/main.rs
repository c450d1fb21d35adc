use hyper::{Method, server::conn::http1};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::{ServiceBuilder, limit::ConcurrencyLimitLayer, timeout::TimeoutLayer};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod experiment;
mod handler;
mod metric;

use config::Config;
use experiment::ExperimentCounterService;
use handler::{handle_request, shutdown_signal};
use metric::MetricsCollector;

#[derive(Clone)]
pub struct AppState {
    experiment: Arc<ExperimentCounterService>,
    metrics: Arc<MetricsCollector>,
    max_body_bytes: usize,
}

impl AppState {
    fn new(config: &Config) -> Self {
        Self {
            experiment: Arc::new(ExperimentCounterService::new()),
            metrics: Arc::new(MetricsCollector::new()),
            max_body_bytes: config.max_body_bytes,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();

    let state = AppState::new(&config);

    let tower_service = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any),
        )
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(ConcurrencyLimitLayer::new(config.concurrency_limit))
        .service_fn(move |req| {
            let state = state.clone();
            handle_request(req, state)
        });

    let hyper_service = TowerToHyperService::new(tower_service);

    let listener = TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;
    info!("A/B testing server running on http://{}", addr);
    info!("Stats: http://{}/api/stats", addr);

    let http = http1::Builder::new();
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();

    let mut signal = std::pin::pin!(shutdown_signal());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let svc = hyper_service.clone();
                let conn = http.serve_connection(io, svc);
                // watch this connection
                let fut = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        error!("Error serving connection from {}: {:?}", peer, e);
                    }
                });
            },

            _ = &mut signal => {
                drop(listener);
                info!("graceful shutdown signal received");
                // stop the accept loop
                break;
            }
        }
    }

    tokio::select! {
        _ = graceful.shutdown() => {
            info!("all connections gracefully closed");
        },
        _ = tokio::time::sleep(config.shutdown_grace()) => {
            warn!("timed out wait for all connections to close");
        }
    }

    Ok(())
}
