//! letter-sync 服务入口
//!
//! 加载配置 → 初始化日志 → 打开数据库 → 构建同步器 → 定时同步直到 Ctrl-C。

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use letter_sync_lib::config::AppConfig;
use letter_sync_lib::database::LetterDatabase;
use letter_sync_lib::logging::init_tracing;
use letter_sync_lib::sync::{SheetReconciler, SyncScheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;
    init_tracing(&config.log_level);

    info!(
        "letter-sync {} starting, data_dir={}",
        env!("CARGO_PKG_VERSION"),
        config.data_dir.display()
    );

    let db = Arc::new(
        LetterDatabase::new(&config.data_dir).context("failed to open letter database")?,
    );
    let reconciler = Arc::new(SheetReconciler::from_config(db, &config));
    if let Err(e) = reconciler.check_connection().await {
        warn!("remote sheet not reachable at startup: {}", e);
    }

    match reconciler.status() {
        Ok(summary) => info!(
            "change log: pending={} failed={} exhausted={} synced={}",
            summary.pending, summary.failed, summary.exhausted, summary.synced
        ),
        Err(e) => warn!("failed to read change log summary: {}", e),
    }

    let scheduler = SyncScheduler::new(
        reconciler,
        Duration::from_secs(config.sync.interval_secs),
        config.sync.batch_size,
    );
    if config.sync.enabled {
        scheduler.start();
    } else {
        info!("periodic sync disabled (sync.enabled = false)");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    scheduler.stop().await;
    Ok(())
}
