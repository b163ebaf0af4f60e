// =============================================================================
// WebSocket Handler — push window changes for one series
// =============================================================================
//
// Clients connect to `/api/v1/k/ws?period=..&exchange=..&symbol=..&type=..`
// and receive:
//   1. A `snapshot` message with the latest bucket, if the series has data.
//   2. A `change` message for every event the aggregator publishes.
//
// The connection registers an observer on the aggregator that forwards into
// a bounded channel, so the poll loop never waits on a socket. Updates for a
// client that has fallen `CLIENT_BUFFER` messages behind are dropped. The
// observer is removed when the client goes away.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::api::error::ApiError;
use crate::api::rest::SeriesQuery;
use crate::app_state::AppState;
use crate::market_data::pubsub::Observer;
use crate::market_data::{observer, ChangeEvent, SeriesAggregator, SeriesError};
use crate::types::{CandleRow, SeriesKey};

// =============================================================================
// Outbound message
// =============================================================================

#[derive(Debug, Serialize)]
struct WindowUpdate<'a> {
    kind: &'static str,
    series: &'a SeriesKey,
    is_new_bucket: bool,
    window_len: usize,
    latest: CandleRow,
}

fn encode_update(
    aggregator: &SeriesAggregator,
    kind: &'static str,
    is_new_bucket: bool,
) -> anyhow::Result<String> {
    let latest = aggregator.latest()?;
    let window_len = aggregator.snapshot().map_or(0, |w| w.len());
    let update = WindowUpdate {
        kind,
        series: aggregator.key(),
        is_new_bucket,
        window_len,
        latest,
    };
    Ok(serde_json::to_string(&update)?)
}

/// Pending updates kept per client before new ones are dropped.
const CLIENT_BUFFER: usize = 64;

/// Observer that queues encoded updates for one client without blocking.
fn forward_to(tx: mpsc::Sender<String>) -> Observer<ChangeEvent> {
    observer(move |event: &ChangeEvent| {
        let json = encode_update(&event.source, "change", event.is_new_bucket)?;
        match tx.try_send(json) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(series = %event.source.key(), "WebSocket client lagging, update dropped");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(anyhow::anyhow!("WebSocket client is gone")),
        }
    })
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

/// Axum handler for the WebSocket upgrade request.
///
/// The series must already be running; unknown keys get the same 404 as the
/// REST query.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<SeriesQuery>,
) -> Response {
    let key = match query.series_key() {
        Ok(Some(key)) => key,
        Ok(None) => {
            return ApiError::BadRequest(
                "period, exchange, symbol and type are required".to_string(),
            )
            .into_response()
        }
        Err(e) => return e.into_response(),
    };

    let Some(aggregator) = state.registry.get(&key) else {
        return ApiError::NotFound(format!("series {key}")).into_response();
    };

    info!(series = %key, "WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, aggregator))
        .into_response()
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_ws_connection(socket: WebSocket, aggregator: Arc<SeriesAggregator>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(CLIENT_BUFFER);

    let subscription = aggregator.subscribe(forward_to(tx));
    debug!(
        series = %aggregator.key(),
        observers = aggregator.observer_count(),
        "WebSocket observer registered"
    );

    match encode_update(&aggregator, "snapshot", false) {
        Ok(json) => {
            if let Err(e) = sender.send(Message::Text(json)).await {
                debug!(error = %e, "failed to send initial snapshot");
            }
        }
        Err(e) if e.downcast_ref::<SeriesError>().is_some() => {
            debug!(series = %aggregator.key(), "no data yet, skipping initial snapshot");
        }
        Err(e) => warn!(error = %e, "failed to encode initial snapshot"),
    }

    loop {
        tokio::select! {
            Some(json) = rx.recv() => {
                if let Err(e) = sender.send(Message::Text(json)).await {
                    debug!(error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(series = %aggregator.key(), "WebSocket closed by client");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                }
            }
        }
    }

    aggregator.unsubscribe(subscription);
    info!(series = %aggregator.key(), "WebSocket connection closed — observer removed");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::exchange::testing::{raw, ScriptedSource};
    use crate::market_data::aggregator::TickOutcome;
    use crate::market_data::AggregatorSettings;

    #[tokio::test]
    async fn update_carries_latest_bucket() {
        let source = Arc::new(ScriptedSource::new("OKEX", "quarter"));
        let key = SeriesKey {
            market: "OKEX".into(),
            symbol: "eos_usd".into(),
            period: "1min".into(),
            contract_type: "quarter".into(),
        };
        let agg = SeriesAggregator::new(
            key,
            source.clone(),
            AggregatorSettings::new(Duration::from_secs(3600), 10, 0),
        );

        let err = encode_update(&agg, "snapshot", false).unwrap_err();
        assert!(err.downcast_ref::<SeriesError>().is_some());

        let (tx, mut rx) = mpsc::channel::<String>(CLIENT_BUFFER);
        agg.subscribe(forward_to(tx));

        source.push(Ok(vec![raw(0, 1.0, 1.0), raw(60_000, 2.0, 3.0)]));
        agg.tick().await;

        let msg: serde_json::Value =
            serde_json::from_str(&rx.recv().await.expect("one update")).unwrap();
        assert_eq!(msg["kind"], "change");
        assert_eq!(msg["is_new_bucket"], true);
        assert_eq!(msg["window_len"], 2);
        assert_eq!(msg["latest"]["timestamp"], 60_000);
        assert_eq!(msg["series"]["symbol"], "eos_usd");
    }

    #[tokio::test]
    async fn lagging_client_drops_updates_without_blocking() {
        let source = Arc::new(ScriptedSource::new("OKEX", "quarter"));
        let agg = SeriesAggregator::new(
            SeriesKey {
                market: "OKEX".into(),
                symbol: "eos_usd".into(),
                period: "1min".into(),
                contract_type: "quarter".into(),
            },
            source.clone(),
            AggregatorSettings::new(Duration::from_secs(3600), 10, 0),
        );

        let (tx, mut rx) = mpsc::channel::<String>(1);
        agg.subscribe(forward_to(tx));

        for ts in [0, 60_000, 120_000] {
            source.push(Ok(vec![raw(ts, 1.0, 1.0)]));
            let outcome = agg.tick().await;
            assert!(matches!(outcome, TickOutcome::Updated { delivered: 1, .. }));
        }

        let first: serde_json::Value =
            serde_json::from_str(&rx.recv().await.expect("first update")).unwrap();
        assert_eq!(first["latest"]["timestamp"], 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_client_is_reported_as_failed_delivery() {
        let source = Arc::new(ScriptedSource::new("OKEX", "quarter"));
        let agg = SeriesAggregator::new(
            SeriesKey {
                market: "OKEX".into(),
                symbol: "eos_usd".into(),
                period: "1min".into(),
                contract_type: "quarter".into(),
            },
            source.clone(),
            AggregatorSettings::new(Duration::from_secs(3600), 10, 0),
        );

        let (tx, rx) = mpsc::channel::<String>(CLIENT_BUFFER);
        agg.subscribe(forward_to(tx));
        drop(rx);

        source.push(Ok(vec![raw(0, 1.0, 1.0)]));
        let outcome = agg.tick().await;
        assert!(matches!(outcome, TickOutcome::Updated { delivered: 0, .. }));
    }
}
