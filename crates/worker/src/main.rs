use mediaflow::config::Config;
use mediaflow::db;
use mediaflow::jobs::{DefaultsTable, FileLogCapture};
use mediaflow::logging::init_logging;
use mediaflow::QueueService;
use std::time::Duration;

mod handlers;
use handlers::build_registry;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cfg = Config::from_env()?;

    tracing::info!(
        worker_id = %cfg.worker_id,
        workers = cfg.workers,
        database_url = %cfg.database_url,
        poll_interval_ms = cfg.poll_interval_ms,
        zombie_sweep_secs = cfg.zombie_sweep_secs,
        log_dir = ?cfg.log_dir,
        migrate_on_startup = cfg.migrate_on_startup,
        "mediaflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url, cfg.db_max_connections).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let registry = build_registry(pool.clone(), cfg.backup_dir.clone(), cfg.log_dir.clone());
    let builder = QueueService::builder(pool)
        .config(cfg.queue_config())
        .registry(registry)
        .defaults(DefaultsTable::media_library());
    let service = match &cfg.log_dir {
        Some(dir) => builder.log_capture(FileLogCapture::new(dir)).start(),
        None => builder.start(),
    };

    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    stats_tick.tick().await;

    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                tracing::info!("ctrl-c received");
                break;
            }
            _ = stats_tick.tick() => match service.stats().await {
                Ok(s) => tracing::info!(
                    busy = s.workers_busy,
                    idle = s.workers_idle,
                    completed = s.totals.completed,
                    retried = s.totals.retried,
                    dead_lettered = s.totals.dead_lettered,
                    status_counts = ?s.status_counts,
                    "queue stats"
                ),
                Err(e) => tracing::warn!(error = %e, "stats unavailable"),
            },
        }
    }

    service.shutdown(cfg.shutdown_timeout()).await?;
    Ok(())
}
