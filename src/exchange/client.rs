// =============================================================================
// OKEx Futures REST Client — public kline endpoint
// =============================================================================
//
// Only the unauthenticated `future_kline` endpoint is used, so no request
// signing happens here. One client instance is bound to a single contract type
// (this_week / next_week / quarter); the registry reads it back when building
// series keys.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::{FetchError, KlineRequest, KlineSource};
use crate::runtime_config::MarketConfig;
use crate::types::RawKline;

/// Number of columns in a kline row: ts, o, h, l, c, volume, coin volume.
const KLINE_COLUMNS: usize = 7;

/// OKEx futures kline client.
#[derive(Clone)]
pub struct OkexFuturesClient {
    exchange: String,
    contract_type: String,
    base_url: String,
    client: reqwest::Client,
}

impl OkexFuturesClient {
    /// Build a client from a configured market profile.
    pub fn new(config: &MarketConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .with_context(|| format!("failed to build HTTP client for {}", config.profile))?;

        debug!(
            profile = %config.profile,
            base_url = %config.base_url,
            contract_type = %config.contract_type,
            "OkexFuturesClient initialised"
        );

        Ok(Self {
            exchange: config.exchange.clone(),
            contract_type: config.contract_type.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn kline_url(&self, request: &KlineRequest<'_>) -> String {
        format!(
            "{}/api/v1/future_kline.do?symbol={}&type={}&contract_type={}&size={}&since={}",
            self.base_url,
            request.symbol,
            request.period,
            request.contract_type,
            request.size,
            request.since
        )
    }

    /// Decode a kline response body.
    ///
    /// Success bodies are arrays of 7-element arrays. Errors come back as an
    /// object carrying `error_code`, sometimes with HTTP 200.
    fn parse_klines(body: &serde_json::Value) -> Result<Vec<RawKline>, FetchError> {
        if let Some(code) = body.get("error_code") {
            return Err(FetchError::Provider(format!("error_code {code}")));
        }

        let raw = body
            .as_array()
            .ok_or_else(|| FetchError::Fatal(format!("kline response is not an array: {body}")))?;

        let mut rows = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry
                .as_array()
                .ok_or_else(|| FetchError::Fatal("kline entry is not an array".to_string()))?;

            if arr.len() < KLINE_COLUMNS {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            rows.push(RawKline {
                timestamp: Self::parse_i64(&arr[0])?,
                open: Self::parse_f64(&arr[1])?,
                high: Self::parse_f64(&arr[2])?,
                low: Self::parse_f64(&arr[3])?,
                close: Self::parse_f64(&arr[4])?,
                volume: Self::parse_f64(&arr[5])?,
                aux_volume: Self::parse_f64(&arr[6])?,
            });
        }

        Ok(rows)
    }

    fn parse_f64(val: &serde_json::Value) -> Result<f64, FetchError> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .map_err(|_| FetchError::Fatal(format!("failed to parse '{s}' as f64")))
        } else {
            val.as_f64()
                .ok_or_else(|| FetchError::Fatal(format!("expected string or number, got: {val}")))
        }
    }

    fn parse_i64(val: &serde_json::Value) -> Result<i64, FetchError> {
        if let Some(n) = val.as_i64() {
            return Ok(n);
        }
        // Some gateways serialise timestamps as floats or strings.
        Self::parse_f64(val).map(|f| f as i64)
    }
}

#[async_trait]
impl KlineSource for OkexFuturesClient {
    fn market_id(&self) -> &str {
        &self.exchange
    }

    fn contract_type(&self) -> &str {
        &self.contract_type
    }

    #[instrument(skip(self), name = "okex::fetch_klines")]
    async fn fetch_klines(&self, request: &KlineRequest<'_>) -> Result<Vec<RawKline>, FetchError> {
        let url = self.kline_url(request);

        let resp = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(e.to_string())
            } else {
                FetchError::Fatal(format!("GET future_kline failed: {e}"))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            // Rate-limit and gateway pages are usually HTML, not JSON.
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Provider(format!(
                "future_kline returned {status}: {}",
                body.trim()
            )));
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(e.to_string())
            } else {
                FetchError::Fatal(format!("failed to decode future_kline body: {e}"))
            }
        })?;

        let rows = Self::parse_klines(&body)?;
        debug!(
            symbol = request.symbol,
            period = request.period,
            count = rows.len(),
            "klines fetched"
        );
        Ok(rows)
    }
}

impl std::fmt::Debug for OkexFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkexFuturesClient")
            .field("exchange", &self.exchange)
            .field("contract_type", &self.contract_type)
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OkexFuturesClient {
        OkexFuturesClient::new(&MarketConfig {
            profile: "quarter".into(),
            exchange: "OKEX".into(),
            base_url: "https://www.okex.com/".into(),
            contract_type: "quarter".into(),
            timeout_secs: 10,
        })
        .expect("client builds")
    }

    #[test]
    fn kline_url_carries_all_parameters() {
        let c = client();
        let url = c.kline_url(&KlineRequest {
            symbol: "eos_usd",
            period: "1min",
            contract_type: "quarter",
            since: 1_700_000_000_000,
            size: 0,
        });
        assert_eq!(
            url,
            "https://www.okex.com/api/v1/future_kline.do?symbol=eos_usd&type=1min&contract_type=quarter&size=0&since=1700000000000"
        );
    }

    #[test]
    fn parse_numeric_and_string_cells() {
        let body = serde_json::json!([
            [1440308760000i64, 233.38, 234.5, 233.38, 234.48, 1, 0.0042],
            [1440308820000i64, "234.48", "235.0", "234.0", "234.9", "3", "0.0128"]
        ]);
        let rows = OkexFuturesClient::parse_klines(&body).expect("parses");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, 1_440_308_760_000);
        assert!((rows[1].close - 234.9).abs() < 1e-9);
        assert!((rows[1].aux_volume - 0.0128).abs() < 1e-9);
    }

    #[test]
    fn short_rows_are_skipped() {
        let body = serde_json::json!([[1, 2, 3], [60000, 1, 1, 1, 1, 1, 1]]);
        let rows = OkexFuturesClient::parse_klines(&body).expect("parses");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, 60_000);
    }

    #[test]
    fn error_code_body_is_provider_error() {
        let body = serde_json::json!({ "error_code": 20049, "result": false });
        let err = OkexFuturesClient::parse_klines(&body).unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, FetchError::Provider(_)));
    }

    /// Serve exactly one canned HTTP response on a local port.
    async fn serve_once(response: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    fn request() -> KlineRequest<'static> {
        KlineRequest {
            symbol: "eos_usd",
            period: "1min",
            contract_type: "quarter",
            since: 0,
            size: 0,
        }
    }

    #[tokio::test]
    async fn non_2xx_html_page_is_provider_error() {
        let base_url = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-type: text/html\r\ncontent-length: 16\r\nconnection: close\r\n\r\n<html>503</html>",
        )
        .await;
        let client = OkexFuturesClient::new(&MarketConfig {
            profile: "quarter".into(),
            exchange: "OKEX".into(),
            base_url,
            contract_type: "quarter".into(),
            timeout_secs: 5,
        })
        .expect("client builds");

        let err = client.fetch_klines(&request()).await.unwrap_err();
        assert!(matches!(err, FetchError::Provider(_)), "got {err}");
        assert!(err.is_transient());
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn ok_response_is_parsed() {
        let base_url = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 28\r\nconnection: close\r\n\r\n[[60000,1,2,0.5,1.5,10,0.1]]",
        )
        .await;
        let client = OkexFuturesClient::new(&MarketConfig {
            profile: "quarter".into(),
            exchange: "OKEX".into(),
            base_url,
            contract_type: "quarter".into(),
            timeout_secs: 5,
        })
        .expect("client builds");

        let rows = client.fetch_klines(&request()).await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, 60_000);
        assert!((rows[0].close - 1.5).abs() < 1e-9);
    }

    #[test]
    fn non_array_body_is_fatal() {
        let body = serde_json::json!({ "result": true });
        let err = OkexFuturesClient::parse_klines(&body).unwrap_err();
        assert!(!err.is_transient());
    }
}
