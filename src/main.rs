use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use seatline::api::{self, AdminAuth, AppState};
use seatline::config::{self, Config};
use seatline::engine::Engine;
use seatline::mailer::{LogMailer, Mailer, WebhookMailer};
use seatline::notify::{Dispatcher, NotifyHub};
use seatline::reaper;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    seatline::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let mailer: Arc<dyn Mailer> = match &config.mail_webhook {
        Some(url) => Arc::new(WebhookMailer::new(url.clone(), config.notify_timeout)?),
        None => Arc::new(LogMailer),
    };
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(NotifyHub::new()),
        mailer,
        config.base_url.clone(),
        config.notify_timeout,
    ));
    let engine = Arc::new(Engine::new(config.wal_path(), dispatcher, config.hours)?);

    if let Some(path) = &config.floor_plan {
        let plan = config::load_floor_plan(path)?;
        config::provision(&engine, &plan).await?;
    }
    if config.admin_emails.is_empty() {
        warn!("SEATLINE_ADMIN_EMAILS is empty, dashboard routes will refuse every request");
    }

    tokio::spawn(reaper::run_reaper(engine.clone(), config.sweep_interval));
    tokio::spawn(reaper::run_compactor(
        engine.clone(),
        config.compact_threshold,
        COMPACT_CHECK_INTERVAL,
    ));

    let state = AppState::new(
        engine.clone(),
        AdminAuth::new(config.admin_token.clone(), config.admin_emails.clone()),
        config.max_connections,
    );
    let app = api::router(state);

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("seatline listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  tables: {}, reservations: {}", engine.table_count(), engine.reservation_count());
    info!("  max_connections: {}", config.max_connections);
    info!("  mail: {}", config.mail_webhook.as_deref().unwrap_or("log only"));
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight requests.
    // Live streams never finish on their own, so draining is bounded.
    let (stopping_tx, mut stopping_rx) = watch::channel(false);
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutdown signal received, draining requests...");
        let _ = stopping_tx.send(true);
    });
    let drain_deadline = async move {
        let _ = stopping_rx.wait_for(|stopping| *stopping).await;
        tokio::time::sleep(DRAIN_TIMEOUT).await;
    };

    tokio::select! {
        result = server.into_future() => result?,
        _ = drain_deadline => warn!("drain timeout, closing open streams"),
    }

    if let Err(e) = engine.close_wal().await {
        error!("closing reservation log failed: {e}");
    }
    info!("seatline stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        let sigterm = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("cannot register SIGTERM handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm => {}
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}
