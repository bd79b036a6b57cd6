use std::sync::Arc;

use tracing::{error, info, warn};

use bookings::app::{self, App};
use bookings::config::Config;
use bookings::notify::{self, Dispatcher, ShutdownMode, SmtpTransport};
use bookings::reaper;
use bookings::store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    bookings::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(Store::open(&config.wal_path(), config.storage_timeout)?);
    let seeded = app::seed_default_rooms(&store).await?;

    let (mailer, outbox) = notify::queue(
        config.mail_queue_capacity,
        config.mail_from.clone(),
        config.property_contact.clone(),
    );
    let dispatcher = Dispatcher::spawn(SmtpTransport::new(config.smtp_host.clone(), config.smtp_port), outbox);

    let app = App::new(store.clone(), mailer);

    let reaper_task = tokio::spawn(reaper::run_session_reaper(app.sessions.clone(), config.session_lifetime));
    let compactor_task = tokio::spawn(reaper::run_compactor(store.clone(), config.compact_threshold));

    info!("bookings ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  rooms: {} ({seeded} seeded)", store.all_rooms().len());
    info!("  smtp: {}:{}", config.smtp_host, config.smtp_port);
    info!("  storage_timeout: {:?}", config.storage_timeout);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown on SIGTERM/ctrl-c: stop background work, deliver
    // queued mail, leave a compact WAL behind.
    wait_for_shutdown().await;
    info!("shutdown signal received");

    reaper_task.abort();
    compactor_task.abort();
    drop(app);

    let stats = dispatcher.shutdown(ShutdownMode::Drain).await;
    info!(sent = stats.sent, failed = stats.failed, dropped = stats.dropped, "notification queue drained");

    if let Err(e) = store.compact_wal().await {
        error!("final WAL compaction failed: {e}");
    }

    info!("bookings stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable, waiting for ctrl-c only: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
