// =============================================================================
// Series Registry — one aggregator per key for the life of the process
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::exchange::KlineSource;
use crate::market_data::aggregator::{AggregatorSettings, SeriesAggregator};
use crate::types::SeriesKey;

/// Separator used by pair symbols such as `EOS/USD`.
const PAIR_SEPARATOR: char = '/';

/// Convert `EOS/USD` into the provider's `eos_usd` form. Symbols without a
/// separator are returned unchanged.
pub fn normalize_symbol(symbol: &str) -> String {
    if symbol.contains(PAIR_SEPARATOR) {
        symbol.to_lowercase().replace(PAIR_SEPARATOR, "_")
    } else {
        symbol.to_string()
    }
}

/// Process-wide store of running aggregators.
pub struct SeriesRegistry {
    settings: AggregatorSettings,
    series: Mutex<HashMap<SeriesKey, Arc<SeriesAggregator>>>,
}

impl SeriesRegistry {
    pub fn new(settings: AggregatorSettings) -> Self {
        Self {
            settings,
            series: Mutex::new(HashMap::new()),
        }
    }

    /// Return the aggregator for `(source, symbol, period)`, creating and
    /// starting it on first use.
    ///
    /// The map lock is held across construction and `start`, so concurrent
    /// first lookups for one key cannot both create an aggregator.
    pub fn get_or_create(
        &self,
        source: &Arc<dyn KlineSource>,
        symbol: &str,
        period: &str,
    ) -> Arc<SeriesAggregator> {
        self.get_or_create_with(source, symbol, period, |_| {})
    }

    /// Like [`get_or_create`](Self::get_or_create), but runs `on_create` on a
    /// newly built aggregator before its poll loop is spawned. Observers
    /// attached there see the very first merge.
    pub fn get_or_create_with<F>(
        &self,
        source: &Arc<dyn KlineSource>,
        symbol: &str,
        period: &str,
        on_create: F,
    ) -> Arc<SeriesAggregator>
    where
        F: FnOnce(&Arc<SeriesAggregator>),
    {
        let key = SeriesKey {
            market: source.market_id().to_string(),
            symbol: normalize_symbol(symbol),
            period: period.to_string(),
            contract_type: source.contract_type().to_string(),
        };

        let mut series = self.series.lock();
        if let Some(existing) = series.get(&key) {
            return Arc::clone(existing);
        }

        let aggregator = SeriesAggregator::new(key.clone(), Arc::clone(source), self.settings);
        on_create(&aggregator);
        aggregator.start();
        series.insert(key, Arc::clone(&aggregator));
        aggregator
    }

    pub fn get(&self, key: &SeriesKey) -> Option<Arc<SeriesAggregator>> {
        self.series.lock().get(key).cloned()
    }

    /// Running keys grouped by period, both levels sorted.
    pub fn running(&self) -> BTreeMap<String, Vec<SeriesKey>> {
        let mut grouped: BTreeMap<String, Vec<SeriesKey>> = BTreeMap::new();
        for key in self.series.lock().keys() {
            grouped.entry(key.period.clone()).or_default().push(key.clone());
        }
        for keys in grouped.values_mut() {
            keys.sort();
        }
        grouped
    }

    pub fn len(&self) -> usize {
        self.series.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.lock().is_empty()
    }

    /// Stop every poll loop and wait for them to exit.
    pub async fn stop_all(&self) {
        let all: Vec<Arc<SeriesAggregator>> = self.series.lock().values().cloned().collect();
        for aggregator in &all {
            aggregator.stop().await;
        }
        info!(count = all.len(), "all series stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::exchange::testing::{raw, ScriptedSource};
    use crate::market_data::aggregator::ChangeEvent;
    use crate::market_data::pubsub::observer;

    fn registry() -> SeriesRegistry {
        SeriesRegistry::new(AggregatorSettings::new(Duration::from_secs(3600), 10, 0))
    }

    fn source(market: &str, contract: &str) -> Arc<dyn KlineSource> {
        Arc::new(ScriptedSource::new(market, contract))
    }

    #[test]
    fn normalizes_pair_symbols() {
        assert_eq!(normalize_symbol("eos/usd"), "eos_usd");
        assert_eq!(normalize_symbol("EOS/USD"), "eos_usd");
        assert_eq!(normalize_symbol("BTC_USD"), "BTC_USD");
        assert_eq!(normalize_symbol("eos_usd"), "eos_usd");
    }

    #[tokio::test]
    async fn equivalent_keys_share_one_instance() {
        let reg = registry();
        let src = source("OKEX", "quarter");

        let a = reg.get_or_create(&src, "EOS/USD", "1min");
        let b = reg.get_or_create(&src, "eos_usd", "1min");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_started());
        assert_eq!(a.key().symbol, "eos_usd");
        assert_eq!(a.key().contract_type, "quarter");
        assert_eq!(reg.len(), 1);

        let c = reg.get_or_create(&src, "eos_usd", "5min");
        assert!(!Arc::ptr_eq(&a, &c));

        // Same exchange, different contract configuration.
        let weekly = source("OKEX", "this_week");
        let d = reg.get_or_create(&weekly, "eos_usd", "1min");
        assert!(!Arc::ptr_eq(&a, &d));
        assert_eq!(reg.len(), 3);

        reg.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_lookups_create_once() {
        let reg = Arc::new(registry());
        let src = source("OKEX", "quarter");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let reg = reg.clone();
            let src = src.clone();
            handles.push(tokio::spawn(async move {
                reg.get_or_create(&src, "eos/usd", "1min")
            }));
        }

        let mut instances = Vec::new();
        for h in handles {
            instances.push(h.await.expect("task panicked"));
        }
        assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(reg.len(), 1);

        reg.stop_all().await;
    }

    #[tokio::test]
    async fn running_groups_by_period() {
        let reg = registry();
        let src = source("OKEX", "quarter");
        reg.get_or_create(&src, "eos_usd", "1min");
        reg.get_or_create(&src, "btc_usd", "1min");
        reg.get_or_create(&src, "btc_usd", "15min");

        let running = reg.running();
        assert_eq!(running.keys().cloned().collect::<Vec<_>>(), vec!["15min", "1min"]);
        let one_min: Vec<&str> = running["1min"].iter().map(|k| k.symbol.as_str()).collect();
        assert_eq!(one_min, vec!["btc_usd", "eos_usd"]);

        let key = running["15min"][0].clone();
        assert!(reg.get(&key).is_some());

        reg.stop_all().await;
        assert!(reg.get(&key).map(|a| a.is_stopped()).unwrap_or(false));
    }

    #[tokio::test]
    async fn on_create_observer_sees_first_merge() {
        let reg = registry();
        let scripted = Arc::new(ScriptedSource::new("OKEX", "quarter"));
        scripted.push(Ok(vec![raw(60, 1.0, 1.0)]));
        let src: Arc<dyn KlineSource> = scripted.clone();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let agg = reg.get_or_create_with(&src, "eos_usd", "1min", move |agg| {
            assert!(!agg.is_started());
            agg.subscribe(observer(move |e: &ChangeEvent| {
                s.lock().push(e.is_new_bucket);
                Ok(())
            }));
        });

        for _ in 0..200 {
            if !seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*seen.lock(), vec![true]);

        // Existing series: the callback is not run again.
        let again = reg.get_or_create_with(&src, "eos_usd", "1min", |_| {
            panic!("on_create ran for an existing series")
        });
        assert!(Arc::ptr_eq(&agg, &again));
        assert_eq!(agg.observer_count(), 1);

        reg.stop_all().await;
    }

    #[test]
    fn unknown_key_is_absent() {
        let reg = registry();
        let key = SeriesKey {
            market: "OKEX".into(),
            symbol: "eos_usd".into(),
            period: "1min".into(),
            contract_type: "quarter".into(),
        };
        assert!(reg.get(&key).is_none());
        assert!(reg.is_empty());
    }
}
