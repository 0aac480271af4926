pub mod backup;
pub mod clock;
pub mod config;
pub mod hub;
pub mod metrics_defs;
pub mod protocol;
pub mod reconcile;
pub mod server;
pub mod status;
pub mod store;
pub mod types;

#[cfg(test)]
mod testutils;

use crate::clock::SystemClock;
use crate::config::{Config, ValidationError};
use crate::hub::Hub;
use crate::server::AppState;
use parking_lot::Mutex;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::future::IntoFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Config(#[from] ValidationError),
}

pub async fn run(config: Config) -> Result<(), TrackerError> {
    config.validate()?;
    shared::metrics_defs::describe_all(metrics_defs::ALL_METRICS);

    let hub = Arc::new(Mutex::new(Hub::new(
        config.tracking.clone(),
        config.disconnect_policy,
        Arc::new(SystemClock),
    )));

    let addr = format!("{}:{}", config.listener.host, config.listener.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, policy = ?config.disconnect_policy, "Tracking hub listening");

    let ready = Arc::new(AtomicBool::new(true));
    let admin_ready = ready.clone();
    let admin_service = AdminService::new(move || admin_ready.load(Ordering::Relaxed));
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    let app = server::router(AppState::new(hub.clone()));
    let serve_task = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(ready))
        .into_future();

    let sweep_period = Duration::from_millis(config.tracking.sweep_interval_ms);

    let result = tokio::select! {
        result = serve_task => result,
        result = admin_task => result,
        _ = sweep(hub.clone(), sweep_period) => Ok(()),
    };

    hub.lock().shutdown();
    tracing::info!("Tracking hub stopped");
    Ok(result?)
}

/// Drives every backup timer and offline check.
async fn sweep(hub: Arc<Mutex<Hub>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        hub.lock().run_due();
    }
}

async fn shutdown_signal(ready: Arc<AtomicBool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
    ready.store(false, Ordering::Relaxed);
}
