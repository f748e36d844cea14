use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::Job;
use tracing::info;

use crate::config::Settings;
use crate::core::batch::BatchService;
use crate::core::hub::STALE_AFTER;
use crate::core::lifecycle::LifecycleManager;
use crate::core::terminal::{self, GuideSection};
use crate::interfaces::web::ApiServer;

pub(crate) async fn run(flags: super::ServeFlags) -> Result<()> {
    let config_path = flags.config.unwrap_or_else(Settings::default_path);
    let mut settings = Settings::load(&config_path)?;
    if let Some(host) = flags.api_host {
        settings.api_host = host;
    }
    if let Some(port) = flags.api_port {
        settings.api_port = port;
    }

    let (log_tx, _) = tokio::sync::broadcast::channel::<String>(500);
    crate::logging::init(log_tx.clone());

    terminal::print_banner();
    GuideSection::new("Daemon")
        .status(
            "API Endpoint",
            &format!("http://{}:{}", settings.api_host, settings.api_port),
        )
        .status(
            "Update script",
            &settings.update_script.display().to_string(),
        )
        .status(
            "Analysis script",
            &settings.analysis_script.display().to_string(),
        )
        .print();
    println!();

    let service = BatchService::new(settings.clone());

    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(
        service.clone(),
        log_tx.clone(),
        settings.api_host.clone(),
        settings.api_port,
    ))));

    // Keepalive ping every 10s; reap silent connections every 30s.
    let svc = service.clone();
    lifecycle
        .scheduler
        .add(Job::new_async("*/10 * * * * *", move |_uuid, mut _l| {
            let svc = svc.clone();
            Box::pin(async move {
                svc.hub.heartbeat().await;
            })
        })?)
        .await?;

    let svc = service.clone();
    lifecycle
        .scheduler
        .add(Job::new_async("*/30 * * * * *", move |_uuid, mut _l| {
            let svc = svc.clone();
            Box::pin(async move {
                svc.hub.reap_stale(STALE_AFTER).await;
            })
        })?)
        .await?;

    lifecycle.start().await?;
    info!(
        "batchline ready at http://{}:{}",
        settings.api_host, settings.api_port
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    lifecycle.shutdown().await?;
    Ok(())
}
