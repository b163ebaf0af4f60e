// =============================================================================
// Market-data providers
// =============================================================================
//
// A `KlineSource` is anything that can answer "give me the candles for this
// series since timestamp X". The aggregators only ever see this trait; the
// concrete REST client lives in `client`.
// =============================================================================

pub mod client;

pub use client::OkexFuturesClient;

use async_trait::async_trait;

use crate::types::RawKline;

/// Parameters for one kline fetch.
#[derive(Debug, Clone, Copy)]
pub struct KlineRequest<'a> {
    pub symbol: &'a str,
    pub period: &'a str,
    pub contract_type: &'a str,
    /// Only rows at or after this bucket start are requested. `0` means
    /// "whatever history the provider is willing to give".
    pub since: i64,
    /// Size hint forwarded to the provider. `0` lets the provider decide.
    pub size: u32,
}

/// Failure modes of a fetch.
///
/// `Timeout` and `Provider` are transient: the poll loop logs them and simply
/// retries on the next tick. `Fatal` covers everything else (transport
/// failures, undecodable bodies).
#[derive(Debug)]
pub enum FetchError {
    Timeout(String),
    Provider(String),
    Fatal(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Provider(_))
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Provider(msg) => write!(f, "provider_error: {msg}"),
            Self::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Source of raw candle rows for a market.
#[async_trait]
pub trait KlineSource: Send + Sync {
    /// Market identity used as the first component of every series key.
    fn market_id(&self) -> &str;

    /// Contract variant this client is configured for (e.g. `quarter`).
    fn contract_type(&self) -> &str;

    async fn fetch_klines(&self, request: &KlineRequest<'_>) -> Result<Vec<RawKline>, FetchError>;
}

// =============================================================================
// Test double
// =============================================================================
