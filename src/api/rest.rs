// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`:
//
//   GET  /health   liveness + running series count
//   GET  /k        no params: running series grouped by period
//                  period+exchange+symbol+type: that series' window
//   POST /k        start (or fetch) a series on a configured market profile
//   GET  /k/ws     push window changes for one series
//
// Query parameters keep the legacy wire names (`period`, `exchange`, `type`);
// `bucket_size`, `market` and `contract_variant` are accepted as aliases.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::error::ApiError;
use crate::app_state::AppState;
use crate::market_data::{normalize_symbol, SeriesRegistry, WindowTable};
use crate::types::SeriesKey;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/k", get(query_series).post(start_series))
        .route("/api/v1/k/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Query parameters
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct SeriesQuery {
    #[serde(default, alias = "bucket_size")]
    pub period: Option<String>,
    #[serde(default, alias = "market")]
    pub exchange: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default, rename = "type", alias = "contract_variant")]
    pub contract_type: Option<String>,
}

impl SeriesQuery {
    /// `Ok(None)` when no parameter is given, `Ok(Some(key))` when all four
    /// are, and a bad-request error for anything in between.
    pub fn series_key(&self) -> Result<Option<SeriesKey>, ApiError> {
        match (&self.period, &self.exchange, &self.symbol, &self.contract_type) {
            (None, None, None, None) => Ok(None),
            (Some(period), Some(exchange), Some(symbol), Some(contract_type)) => {
                Ok(Some(SeriesKey {
                    market: exchange.clone(),
                    symbol: normalize_symbol(symbol),
                    period: period.clone(),
                    contract_type: contract_type.clone(),
                }))
            }
            _ => Err(ApiError::BadRequest(
                "period, exchange, symbol and type must be given together".to_string(),
            )),
        }
    }
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    series: usize,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        series: state.registry.len(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// GET /k
// =============================================================================

#[derive(Serialize)]
struct RunningEntry {
    exchange: String,
    symbol: String,
    #[serde(rename = "type")]
    contract_type: String,
}

#[derive(Serialize)]
struct RunningPeriod {
    period: String,
    k: Vec<RunningEntry>,
}

#[derive(Serialize)]
struct RunningResponse {
    running: Vec<RunningPeriod>,
}

#[derive(Serialize)]
struct WindowResponse {
    period: String,
    exchange: String,
    symbol: String,
    #[serde(rename = "type")]
    contract_type: String,
    initialized: bool,
    k: Option<WindowTable>,
}

fn running_response(registry: &SeriesRegistry) -> RunningResponse {
    let running = registry
        .running()
        .into_iter()
        .map(|(period, keys)| RunningPeriod {
            period,
            k: keys
                .into_iter()
                .map(|key| RunningEntry {
                    exchange: key.market,
                    symbol: key.symbol,
                    contract_type: key.contract_type,
                })
                .collect(),
        })
        .collect();
    RunningResponse { running }
}

async fn query_series(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SeriesQuery>,
) -> Result<Response, ApiError> {
    info!(
        period = ?query.period,
        exchange = ?query.exchange,
        symbol = ?query.symbol,
        contract_type = ?query.contract_type,
        "[GET] /k"
    );

    let Some(key) = query.series_key()? else {
        return Ok(Json(running_response(&state.registry)).into_response());
    };

    let aggregator = state
        .registry
        .get(&key)
        .ok_or_else(|| ApiError::NotFound(format!("series {key}")))?;
    let window = aggregator.snapshot();

    Ok(Json(WindowResponse {
        period: query.period.unwrap_or_default(),
        exchange: query.exchange.unwrap_or_default(),
        symbol: query.symbol.unwrap_or_default(),
        contract_type: query.contract_type.unwrap_or_default(),
        initialized: window.is_some(),
        k: window.map(|w| w.to_table()),
    })
    .into_response())
}

// =============================================================================
// POST /k
// =============================================================================

#[derive(Deserialize)]
struct StartSeriesRequest {
    /// Market profile name from the config.
    market: String,
    symbol: String,
    period: String,
}

#[derive(Serialize)]
struct StartSeriesResponse {
    period: String,
    exchange: String,
    symbol: String,
    #[serde(rename = "type")]
    contract_type: String,
    initialized: bool,
}

async fn start_series(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartSeriesRequest>,
) -> Result<Json<StartSeriesResponse>, ApiError> {
    if req.symbol.trim().is_empty() || req.period.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "symbol and period must not be empty".to_string(),
        ));
    }

    let aggregator = state
        .start_series(&req.market, &req.symbol, &req.period)
        .ok_or_else(|| ApiError::NotFound(format!("market profile {}", req.market)))?;

    let key = aggregator.key();
    info!(series = %key, "[POST] /k");

    Ok(Json(StartSeriesResponse {
        period: key.period.clone(),
        exchange: key.market.clone(),
        symbol: key.symbol.clone(),
        contract_type: key.contract_type.clone(),
        initialized: aggregator.is_initialized(),
    }))
}

// =============================================================================
// Tests
// =============================================================================
