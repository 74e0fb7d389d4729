// =============================================================================
// spread-nexus — Main Entry Point
// =============================================================================
//
// Startup sequence: load config, build the shared rolling-window store and
// broadcast hubs, construct the orchestrator, spawn the venue fleet plus the
// persistence/chart-assembly/watchdog tasks, then serve the HTTP + WebSocket
// API until Ctrl+C. A single `CancellationToken` is propagated to every task
// for graceful shutdown, mirroring the teacher's `main.rs` shape.
// =============================================================================

mod api;
mod broadcast;
mod channel;
mod chart_assembler;
mod config;
mod exchange;
mod historical;
mod opportunity_filter;
mod orchestrator;
mod parquet_writer;
mod rolling_window;
mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use rust_decimal::prelude::ToPrimitive;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppContext;
use crate::broadcast::BroadcastHub;
use crate::config::AppConfig;
use crate::opportunity_filter::OpportunityFilter;
use crate::orchestrator::Orchestrator;
use crate::rolling_window::RollingWindowStore;

const CONFIG_PATH: &str = "config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("spread-nexus starting up");

    let config = AppConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        AppConfig::default()
    });

    if let Err(e) = config.validate() {
        error!(error = %e, "fatal configuration error, exiting");
        std::process::exit(1);
    }
    let config = Arc::new(config);

    let cancel = CancellationToken::new();

    // ── Shared state ──────────────────────────────────────────────────────
    let rolling_window = Arc::new(RollingWindowStore::new(config.window_duration(), config.rolling_window_lru_capacity));
    let spread_hub = BroadcastHub::new();
    let chart_hub = BroadcastHub::new();
    let orchestrator = Orchestrator::new(config.clone(), rolling_window.clone(), spread_hub);
    let opportunities = Arc::new(OpportunityFilter::new(
        PathBuf::from(&config.analyzer_stats_path),
        config.opportunity_threshold,
        Duration::from_secs(config.opportunity_cache_ttl_secs),
    ));

    let (writer, writer_task) = parquet_writer::spawn_writer(
        PathBuf::from(&config.data_lake_path),
        config.volume_filter_min.to_f64().unwrap_or(0.0),
        config.volume_filter_max.to_f64().unwrap_or(0.0),
    );
    let _ = writer_task;

    // ── Persistence consumer: batch quotes per partition, flush at
    // batch size or on the periodic timer ──────────────────────────────────
    let buffers = Arc::new(tokio::sync::Mutex::new(parquet_writer::PartitionBuffers::new()));
    if let Some(mut rx) = orchestrator.take_persistence_receiver() {
        let buffers = buffers.clone();
        let writer = writer.clone();
        let batch_size = config.recording_batch_size;
        tokio::spawn(async move {
            while let Some(quote) = rx.recv().await {
                let mut guard = buffers.lock().await;
                if let Some((partition, snapshot)) = guard.push(quote, batch_size) {
                    drop(guard);
                    writer.enqueue(parquet_writer::WriteRequest {
                        partition,
                        quotes: snapshot,
                        flushed_at: chrono::Utc::now(),
                    });
                }
            }
        });
    }
    parquet_writer::spawn_flush_timer(buffers.clone(), writer.clone(), Duration::from_secs(30), cancel.clone());

    rolling_window::spawn_cleanup_task(
        rolling_window.clone(),
        Duration::from_secs(config.rolling_window_cleanup_interval_secs),
        cancel.clone(),
    );

    orchestrator.spawn_watchdog(cancel.clone());
    orchestrator.spawn_venues(cancel.clone()).await;

    // ── Chart assembler: reacts to WindowUpdated, pushes ChartFrame JSON
    // onto the chart-frame WebSocket fan-out ────────────────────────────────
    {
        let store = rolling_window.clone();
        let assembler_config = config.clone();
        let opportunities = opportunities.clone();
        let chart_hub = chart_hub.clone();
        let coalesce_window = Duration::from_millis(config.chart_coalesce_window_ms);
        tokio::spawn(async move {
            chart_assembler::run_chart_assembler(
                store,
                assembler_config,
                move || opportunities.current(),
                coalesce_window,
                move |frame| match serde_json::to_string(&frame) {
                    Ok(json) => chart_hub.publish_json(json),
                    Err(e) => warn!(error = %e, "failed to serialize chart frame"),
                },
            )
            .await;
        });
    }

    // ── HTTP + WebSocket API ─────────────────────────────────────────────
    let ctx = AppContext {
        config: config.clone(),
        orchestrator: orchestrator.clone(),
        opportunities,
        writer,
        chart_hub,
    };

    let app = Router::new()
        .route(&config.realtime_path, get(api::ws::ws_handler))
        .with_state(ctx.clone())
        .merge(api::rest::router(ctx.clone()));

    let listen_address = config.listen_address.clone();
    let server_cancel = cancel.clone();
    let (bind_failure_tx, bind_failure_rx) = tokio::sync::oneshot::channel::<()>();
    let server_task = tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&listen_address).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %listen_address, error = %e, "failed to bind API server");
                let _ = bind_failure_tx.send(());
                return;
            }
        };
        info!(addr = %listen_address, "API server listening");
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            server_cancel.cancelled().await;
        });
        if let Err(e) = serve.await {
            error!(error = %e, "API server failed");
        }
    });

    info!("all subsystems running, press Ctrl+C to stop");
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            warn!("shutdown signal received, stopping gracefully");
        }
        _ = bind_failure_rx => {
            error!("API server failed to bind, shutting down");
            cancel.cancel();
            let _ = server_task.await;
            std::process::exit(1);
        }
    }
    cancel.cancel();

    {
        let mut guard = buffers.lock().await;
        for (partition, snapshot) in guard.drain_all() {
            writer.enqueue(parquet_writer::WriteRequest {
                partition,
                quotes: snapshot,
                flushed_at: chrono::Utc::now(),
            });
        }
    }

    ctx.chart_hub.close_all().await;
    ctx.orchestrator.broadcast.close_all().await;
    let _ = server_task.await;

    info!("spread-nexus shut down complete");
    Ok(())
}
