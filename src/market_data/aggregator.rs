// =============================================================================
// Series Aggregator — poll, merge, trim, detect, notify
// =============================================================================
//
// One aggregator owns the live window for one `SeriesKey`. A single tokio task
// drives it:
//
//   interval tick ─► fetch(since = cursor) ─► merge ─► trim ─► swap ─► publish
//
// Ticks never overlap. The loop awaits each tick before arming the next one,
// and `tick()` itself is guarded by an async mutex so direct callers queue
// behind the loop. Readers get the window as an `Arc<CandleWindow>` that is
// swapped in whole, so they never observe a half-merged state.
// =============================================================================

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::exchange::{KlineRequest, KlineSource};
use crate::market_data::candle_window::{CandleWindow, DEFAULT_MAX_WINDOW_LEN};
use crate::market_data::pubsub::{Observer, PubSub, SubscriptionId};
use crate::types::{CandleRow, SeriesKey};

/// `since` sent before any bucket has been observed.
pub const SINCE_ORIGIN: i64 = 0;

/// Default seconds between polls.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

// =============================================================================
// Settings / events / errors
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct AggregatorSettings {
    pub poll_interval: Duration,
    pub max_window_len: usize,
    pub fetch_size: u32,
}

impl AggregatorSettings {
    /// Zero intervals and zero-length windows are bumped to their minimum.
    pub fn new(poll_interval: Duration, max_window_len: usize, fetch_size: u32) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            max_window_len: max_window_len.max(1),
            fetch_size,
        }
    }
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            DEFAULT_MAX_WINDOW_LEN,
            0,
        )
    }
}

/// Published after every successful merge.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub source: Arc<SeriesAggregator>,
    /// `true` when the most recent bucket differs from the previous tick's.
    pub is_new_bucket: bool,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Updated { is_new_bucket: bool, delivered: usize },
    Empty,
    Transient,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeriesError {
    NotInitialized(SeriesKey),
}

impl std::fmt::Display for SeriesError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotInitialized(key) => write!(f, "series {key} has no data yet"),
        }
    }
}

impl std::error::Error for SeriesError {}

// =============================================================================
// SeriesAggregator
// =============================================================================

pub struct SeriesAggregator {
    key: SeriesKey,
    source: Arc<dyn KlineSource>,
    settings: AggregatorSettings,
    /// `None` until the first non-empty fetch has been merged.
    window: RwLock<Option<Arc<CandleWindow>>>,
    channel: PubSub<ChangeEvent>,
    tick_lock: tokio::sync::Mutex<()>,
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SeriesAggregator {
    pub fn new(
        key: SeriesKey,
        source: Arc<dyn KlineSource>,
        settings: AggregatorSettings,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        info!(series = %key, "new series aggregator");
        Arc::new(Self {
            key,
            source,
            settings,
            window: RwLock::new(None),
            channel: PubSub::new(),
            tick_lock: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
            stop_tx,
            worker: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the poll loop. Only the first call has any effect; it returns
    /// `true`, every later call returns `false`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }

        info!(
            series = %self.key,
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            "started polling"
        );
        let stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(Arc::clone(self).run(stop_rx));
        *self.worker.lock() = Some(handle);
        true
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Signal the loop to stop and wait for it. A tick already in progress
    /// runs to completion first.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(series = %self.key, error = %e, "poll loop ended abnormally");
            }
        }
    }

    async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop_rx.changed() => {}
            }
            let stopped = *stop_rx.borrow();
            if stopped {
                break;
            }

            match AssertUnwindSafe(self.tick()).catch_unwind().await {
                Ok(TickOutcome::Updated {
                    is_new_bucket: true,
                    delivered,
                }) => debug!(series = %self.key, delivered, "new bucket delivered"),
                Ok(_) => {}
                Err(_) => error!(series = %self.key, "poll tick panicked, continuing"),
            }
        }

        info!(series = %self.key, "poll loop stopped");
    }

    // ── Poll cycle ──────────────────────────────────────────────────────

    /// Run one fetch/merge/publish cycle.
    pub async fn tick(self: &Arc<Self>) -> TickOutcome {
        let _guard = self.tick_lock.lock().await;

        let previous = self.window.read().clone();
        let previous_ts = previous.as_ref().and_then(|w| w.last()).map(|r| r.timestamp);

        let request = KlineRequest {
            symbol: &self.key.symbol,
            period: &self.key.period,
            contract_type: &self.key.contract_type,
            since: previous_ts.unwrap_or(SINCE_ORIGIN),
            size: self.settings.fetch_size,
        };

        let fetched = match self.source.fetch_klines(&request).await {
            Ok(rows) => rows,
            Err(e) if e.is_transient() => {
                warn!(series = %self.key, error = %e, "error retrieving klines, retrying next tick");
                return TickOutcome::Transient;
            }
            Err(e) => {
                error!(series = %self.key, error = %e, "kline fetch failed");
                return TickOutcome::Failed;
            }
        };

        let batch = CandleWindow::from_batch(fetched.into_iter().map(CandleRow::from));
        if batch.is_empty() {
            warn!(series = %self.key, since = request.since, "received empty kline batch, skipped");
            return TickOutcome::Empty;
        }

        let mut merged = match previous.as_deref() {
            Some(window) => window.merged(&batch),
            None => batch,
        };
        merged.trim_to(self.settings.max_window_len);

        let Some(last) = merged.last().copied() else {
            return TickOutcome::Empty;
        };
        let is_new_bucket = previous_ts != Some(last.timestamp);

        *self.window.write() = Some(Arc::new(merged));

        debug!(
            series = %self.key,
            timestamp = last.timestamp,
            is_new_bucket,
            "firing window change"
        );
        let event = ChangeEvent {
            source: Arc::clone(self),
            is_new_bucket,
        };
        let delivered = self.channel.publish(&event);

        TickOutcome::Updated {
            is_new_bucket,
            delivered,
        }
    }

    // ── Readers ─────────────────────────────────────────────────────────

    /// Current window, or `None` if no data has been merged yet.
    pub fn snapshot(&self) -> Option<Arc<CandleWindow>> {
        self.window.read().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.window.read().is_some()
    }

    /// Most recently observed bucket.
    pub fn latest(&self) -> Result<CandleRow, SeriesError> {
        self.window
            .read()
            .as_ref()
            .and_then(|w| w.last().copied())
            .ok_or_else(|| SeriesError::NotInitialized(self.key.clone()))
    }

    /// Timestamp of [`latest`](Self::latest); also the next fetch's `since`.
    pub fn cursor(&self) -> Result<i64, SeriesError> {
        self.latest().map(|r| r.timestamp)
    }

    // ── Observers ───────────────────────────────────────────────────────

    pub fn subscribe(&self, observer: Observer<ChangeEvent>) -> SubscriptionId {
        self.channel.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.channel.unsubscribe(id)
    }

    pub fn observer_count(&self) -> usize {
        self.channel.len()
    }
}

impl std::fmt::Debug for SeriesAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesAggregator")
            .field("key", &self.key)
            .field("started", &self.is_started())
            .field("initialized", &self.is_initialized())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
