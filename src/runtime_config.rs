// =============================================================================
// Runtime Configuration — markets, polling, warm-start series
// =============================================================================
//
// Loaded once at startup from a JSON file. All fields carry serde defaults so
// that an empty `{}` (or a missing file, via the caller's fallback) yields a
// working setup against the public OKEx futures endpoint.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::aggregator::{AggregatorSettings, DEFAULT_POLL_INTERVAL_SECS};
use crate::market_data::candle_window::DEFAULT_MAX_WINDOW_LEN;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_max_window_len() -> usize {
    DEFAULT_MAX_WINDOW_LEN
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_exchange() -> String {
    "OKEX".to_string()
}

fn default_base_url() -> String {
    "https://www.okex.com".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_markets() -> Vec<MarketConfig> {
    ["this_week", "next_week", "quarter"]
        .into_iter()
        .map(|contract| MarketConfig {
            profile: contract.to_string(),
            exchange: default_exchange(),
            base_url: default_base_url(),
            contract_type: contract.to_string(),
            timeout_secs: default_timeout_secs(),
        })
        .collect()
}

// =============================================================================
// MarketConfig / SeriesSpec
// =============================================================================

/// One provider client. Several profiles may point at the same exchange with
/// different contract types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Name used to select this client from the API and the warm list.
    pub profile: String,

    /// Market identity that ends up in every series key.
    #[serde(default = "default_exchange")]
    pub exchange: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    pub contract_type: String,

    /// HTTP timeout; a fetch that exceeds it is treated as transient.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// A series to start at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesSpec {
    /// `MarketConfig::profile` to poll through.
    pub market: String,
    pub symbol: String,
    pub period: String,
}

// =============================================================================
// FeedConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Buckets retained per series.
    #[serde(default = "default_max_window_len")]
    pub max_window_len: usize,

    /// `size` hint sent with every fetch (0 = provider default).
    #[serde(default)]
    pub fetch_size: u32,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_markets")]
    pub markets: Vec<MarketConfig>,

    #[serde(default)]
    pub series: Vec<SeriesSpec>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_window_len: default_max_window_len(),
            fetch_size: 0,
            bind_addr: default_bind_addr(),
            markets: default_markets(),
            series: Vec::new(),
        }
    }
}

impl FeedConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(
            path = %path.display(),
            markets = config.markets.len(),
            series = config.series.len(),
            "feed config loaded"
        );

        Ok(config)
    }

    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings::new(
            Duration::from_secs(self.poll_interval_secs),
            self.max_window_len,
            self.fetch_size,
        )
    }
}
