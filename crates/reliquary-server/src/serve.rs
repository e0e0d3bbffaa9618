use crate::cli::open_reliquary;
use crate::config::ReliquaryConfig;
use reliquary_core::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Sleep for `interval`. False when shutdown arrived first.
async fn pause(interval: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(interval) => true,
    }
}

pub async fn run(config: ReliquaryConfig) -> anyhow::Result<()> {
    info!("Starting Reliquary v{}", env!("CARGO_PKG_VERSION"));
    info!("HTTP: {}", config.server.http_addr);
    info!("Data: {:?}", config.server.data_dir);

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!("Config: {}", problem);
        }
        anyhow::bail!("{} configuration problems, see `reliquary config validate`", problems.len());
    }

    let auth_token: Option<Arc<str>> = config.server.resolved_token().map(Arc::from);
    if auth_token.is_some() {
        info!("Bearer token auth: enabled");
    } else {
        warn!("Auth disabled, the API is open to all connections on {}", config.server.http_addr);
    }
    if config.providers.pin.is_empty() {
        warn!("No pin providers configured, records will be queued but not pinned");
    }

    info!("Opening database...");
    let reliquary = Arc::new(open_reliquary(&config)?);
    let stats = reliquary.stats()?;
    info!(
        tracked = stats.tracked_addresses,
        observations = stats.observations,
        records = stats.artifact_records,
        "Database loaded"
    );

    // Catch up on records whose content was never queued
    match reliquary.reconcile_pins() {
        Ok(n) => info!("Pin reconciliation: {} items checked", n),
        Err(e) => error!("Pin reconciliation failed: {}", e),
    }

    let shutdown = CancellationToken::new();
    let mut tasks: Vec<(&str, JoinHandle<()>)> = Vec::new();

    // Scan every tracked address, then persist provider health
    let sync_task = {
        let reliquary = reliquary.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(config.scanner.sync_interval_seconds);
        tokio::spawn(async move {
            loop {
                match reliquary.sync_all(&shutdown).await {
                    Ok(reports) => {
                        let inserted: usize = reports.iter().map(|r| r.observations).sum();
                        for report in &reports {
                            if let SyncStatus::TemporarilyUnavailable { retry_at, reason } = &report.status {
                                warn!(address = %report.address, network = %report.network, %retry_at, "Sync deferred: {}", reason);
                            }
                        }
                        if inserted > 0 {
                            info!("Sync: {} new observations across {} addresses", inserted, reports.len());
                        }
                    }
                    Err(e) => error!("Sync cycle failed: {}", e),
                }
                if let Err(e) = reliquary.persist_health() {
                    error!("Failed to persist provider health: {}", e);
                }
                if !pause(interval, &shutdown).await {
                    break;
                }
            }
        })
    };
    tasks.push(("sync", sync_task));

    let sweep_task = {
        let reliquary = reliquary.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(config.resolver.content_retry_interval_seconds);
        tokio::spawn(async move {
            while pause(interval, &shutdown).await {
                if let Err(e) = reliquary.sweep_unavailable_content(&shutdown).await {
                    if !matches!(e, ReliquaryError::Cancelled) {
                        error!("Content sweep failed: {}", e);
                    }
                }
            }
        })
    };
    tasks.push(("content-sweep", sweep_task));

    // Dedup is CPU-bound and synchronous; keep it off the runtime threads
    let dedup_task = {
        let reliquary = reliquary.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(config.dedup.interval_seconds);
        tokio::spawn(async move {
            while pause(interval, &shutdown).await {
                match reliquary.has_new_observations() {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        error!("Dedup check failed: {}", e);
                        continue;
                    }
                }
                let worker = reliquary.clone();
                match tokio::task::spawn_blocking(move || worker.run_dedup_pass()).await {
                    Ok(Ok(report)) => info!(
                        groups = report.groups,
                        created = report.records_created,
                        updated = report.records_updated,
                        conflicting = report.conflicting,
                        "Dedup pass complete"
                    ),
                    Ok(Err(e)) => error!("Dedup pass failed: {}", e),
                    Err(e) => error!("Dedup worker panicked: {}", e),
                }
            }
        })
    };
    tasks.push(("dedup", dedup_task));

    let pin_task = {
        let reliquary = reliquary.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(config.pins.drain_interval_seconds);
        tokio::spawn(async move {
            loop {
                match reliquary.process_pins(&shutdown).await {
                    Ok(report) if report.processed > 0 => info!(
                        processed = report.processed,
                        healthy = report.healthy,
                        pending = report.pending,
                        abandoned = report.abandoned,
                        "Pin queue drained"
                    ),
                    Ok(_) => {}
                    Err(e) => error!("Pin processing failed: {}", e),
                }
                if !pause(interval, &shutdown).await {
                    break;
                }
            }
        })
    };
    tasks.push(("pins", pin_task));

    let verify_task = {
        let reliquary = reliquary.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(config.pins.verify_interval_seconds);
        tokio::spawn(async move {
            while pause(interval, &shutdown).await {
                match reliquary.verify_pins(&shutdown).await {
                    Ok(n) => info!("Verified {} pin records", n),
                    Err(ReliquaryError::Cancelled) => {}
                    Err(e) => error!("Pin verification failed: {}", e),
                }
            }
        })
    };
    tasks.push(("verify", verify_task));

    let http_task = {
        let state = crate::http::AppState {
            reliquary: reliquary.clone(),
            shutdown: shutdown.clone(),
            start_time: std::time::Instant::now(),
        };
        let app = crate::http::app(state, auth_token);
        let addr = config.server.http_addr;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            info!("Starting HTTP server on {}", addr);
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                error!("HTTP server failed: {}", e);
            }
        })
    };
    tasks.push(("http", http_task));

    info!("Reliquary ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping at the next checkpoint...");
    shutdown.cancel();

    for (name, mut task) in tasks {
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
            warn!("{} task did not stop in time, aborting", name);
            task.abort();
        }
    }

    reliquary.persist_health()?;
    info!("Provider health saved");
    Ok(())
}
