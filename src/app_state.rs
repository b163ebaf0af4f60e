// =============================================================================
// Central Application State
// =============================================================================
//
// Ties the configured market clients to the series registry. Shared with the
// HTTP layer as `Arc<AppState>`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::exchange::{KlineSource, OkexFuturesClient};
use crate::market_data::{SeriesAggregator, SeriesRegistry};
use crate::runtime_config::FeedConfig;

pub struct AppState {
    pub config: FeedConfig,
    pub registry: Arc<SeriesRegistry>,
    /// Market clients keyed by profile name.
    pub markets: HashMap<String, Arc<dyn KlineSource>>,
    /// Instant when the service was started. Used for uptime calculations.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: FeedConfig, markets: HashMap<String, Arc<dyn KlineSource>>) -> Self {
        let registry = Arc::new(SeriesRegistry::new(config.aggregator_settings()));
        Self {
            config,
            registry,
            markets,
            start_time: std::time::Instant::now(),
        }
    }

    /// Build one REST client per configured market profile.
    pub fn from_config(config: FeedConfig) -> Result<Self> {
        let mut markets: HashMap<String, Arc<dyn KlineSource>> = HashMap::new();
        for market in &config.markets {
            let client = OkexFuturesClient::new(market)?;
            markets.insert(market.profile.clone(), Arc::new(client));
        }
        Ok(Self::new(config, markets))
    }

    pub fn market(&self, profile: &str) -> Option<&Arc<dyn KlineSource>> {
        self.markets.get(profile)
    }

    /// Get or start the series for `symbol`/`period` on a market profile.
    /// `None` if the profile is not configured.
    pub fn start_series(
        &self,
        profile: &str,
        symbol: &str,
        period: &str,
    ) -> Option<Arc<SeriesAggregator>> {
        let source = self.market(profile)?;
        Some(self.registry.get_or_create(source, symbol, period))
    }

    /// As [`start_series`](Self::start_series); `on_create` runs before the
    /// poll loop of a newly created series starts.
    pub fn start_series_with<F>(
        &self,
        profile: &str,
        symbol: &str,
        period: &str,
        on_create: F,
    ) -> Option<Arc<SeriesAggregator>>
    where
        F: FnOnce(&Arc<SeriesAggregator>),
    {
        let source = self.market(profile)?;
        Some(
            self.registry
                .get_or_create_with(source, symbol, period, on_create),
        )
    }
}
