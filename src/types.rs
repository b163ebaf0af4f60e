// =============================================================================
// Shared types used across the kline feed
// =============================================================================

use serde::{Deserialize, Serialize};

/// Identifies one polled candle series.
///
/// Market and contract strings are compared verbatim; callers that spell the
/// same market with different casing get distinct series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SeriesKey {
    pub market: String,
    pub symbol: String,
    pub period: String,
    pub contract_type: String,
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.market, self.symbol, self.period, self.contract_type
        )
    }
}

/// One candle bucket. `timestamp` is the bucket start in provider units (ms).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandleRow {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// A row exactly as the provider returns it, including the coin-denominated
/// volume column that is not part of the stored candle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawKline {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub aux_volume: f64,
}

impl From<RawKline> for CandleRow {
    fn from(raw: RawKline) -> Self {
        Self {
            timestamp: raw.timestamp,
            open: raw.open,
            high: raw.high,
            low: raw.low,
            close: raw.close,
            volume: raw.volume,
        }
    }
}
