// =============================================================================
// Kline Feed — Main Entry Point
// =============================================================================
//
// Polls futures kline data into bounded in-memory windows, one per
// (market, symbol, period, contract type), and serves them over HTTP.
// Series are started from the config's warm list or on demand via the API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod exchange;
mod market_data;
mod runtime_config;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::market_data::{observer, ChangeEvent};
use crate::runtime_config::FeedConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Kline feed starting up");

    let config_path =
        std::env::var("FEED_CONFIG").unwrap_or_else(|_| "feed_config.json".to_string());
    let mut config = FeedConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        FeedConfig::default()
    });

    if let Ok(addr) = std::env::var("FEED_BIND_ADDR") {
        config.bind_addr = addr;
    }

    info!(
        poll_interval_secs = config.poll_interval_secs,
        max_window_len = config.max_window_len,
        markets = ?config.markets.iter().map(|m| m.profile.as_str()).collect::<Vec<_>>(),
        "Configured kline feed"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::from_config(config)?);

    // ── 3. Warm-start configured series ──────────────────────────────────
    for spec in &state.config.series {
        let started = state.start_series_with(&spec.market, &spec.symbol, &spec.period, |series| {
            series.subscribe(observer(|event: &ChangeEvent| {
                let latest = event.source.latest()?;
                debug!(
                    series = %event.source.key(),
                    timestamp = latest.timestamp,
                    close = latest.close,
                    volume = latest.volume,
                    is_new_bucket = event.is_new_bucket,
                    "window updated"
                );
                Ok(())
            }));
        });

        if started.is_none() {
            warn!(
                market = %spec.market,
                symbol = %spec.symbol,
                "warm-start series references unknown market profile — skipped"
            );
        }
    }

    if state.registry.is_empty() {
        info!("No warm-start series configured; waiting for POST /api/v1/k");
    } else {
        info!(count = state.registry.len(), "Warm-start series launched");
    }

    // ── 4. Start the API server ──────────────────────────────────────────
    let bind_addr = state.config.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server failed")?;

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    warn!("Shutdown signal received — stopping series");
    state.registry.stop_all().await;

    info!("Kline feed shut down complete.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
