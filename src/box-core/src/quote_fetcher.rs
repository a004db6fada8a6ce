//! Batched level-2 quote, LTP, and OHLC retrieval honoring the upstream
//! batch-size limit.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::warn;

use crate::auth::CredentialProvider;
use crate::config::Config;
use crate::error::ScanError;
use crate::http::HttpTransport;
use crate::models::{DepthLadder, DepthLevel, Instrument};
use crate::rate_limiter::RateLimiter;

#[derive(Debug, Deserialize)]
struct QuoteEnvelope {
    #[allow(dead_code)]
    status: String,
    data: HashMap<String, QuoteRecord>,
}

#[derive(Debug, Deserialize)]
struct QuoteRecord {
    last_price: Option<Decimal>,
    #[serde(default)]
    ohlc: Option<Ohlc>,
    #[serde(default)]
    volume: u64,
    #[serde(default)]
    buy_quantity: u64,
    #[serde(default)]
    sell_quantity: u64,
    #[serde(default)]
    oi: u64,
    #[serde(default)]
    depth: Option<DepthEnvelope>,
    #[serde(default)]
    average_price: Decimal,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
struct Ohlc {
    #[serde(default)]
    open: Decimal,
    #[serde(default)]
    high: Decimal,
    #[serde(default)]
    low: Decimal,
    #[serde(default)]
    close: Decimal,
}

#[derive(Debug, Deserialize)]
struct DepthEnvelope {
    #[serde(default)]
    buy: Vec<DepthLevelWire>,
    #[serde(default)]
    sell: Vec<DepthLevelWire>,
}

#[derive(Debug, Deserialize)]
struct DepthLevelWire {
    price: Decimal,
    quantity: u64,
    #[serde(default)]
    orders: u32,
}

fn to_ladder(levels: Vec<DepthLevelWire>) -> DepthLadder {
    DepthLadder {
        levels: levels
            .into_iter()
            .map(|l| DepthLevel {
                price: l.price,
                quantity: l.quantity,
                orders: l.orders,
            })
            .collect(),
    }
}

#[derive(Debug, Deserialize)]
struct LtpEnvelope {
    #[allow(dead_code)]
    status: String,
    data: HashMap<String, LtpRecord>,
}

#[derive(Debug, Deserialize)]
struct LtpRecord {
    last_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct OhlcEnvelope {
    #[allow(dead_code)]
    status: String,
    data: HashMap<String, OhlcRecord>,
}

#[derive(Debug, Deserialize)]
struct OhlcRecord {
    #[serde(default)]
    ohlc: Ohlc,
}

/// Open/high/low/close snapshot returned by [`QuoteFetcher::ohlcs`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OhlcSnapshot {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl From<Ohlc> for OhlcSnapshot {
    fn from(o: Ohlc) -> Self {
        Self {
            open: o.open,
            high: o.high,
            low: o.low,
            close: o.close,
        }
    }
}

pub struct QuoteFetcher {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    credentials: Arc<dyn CredentialProvider>,
    config: Arc<Config>,
    base_url: String,
}

impl QuoteFetcher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<RateLimiter>,
        credentials: Arc<dyn CredentialProvider>,
        config: Arc<Config>,
        base_url: String,
    ) -> Self {
        Self {
            transport,
            limiter,
            credentials,
            config,
            base_url,
        }
    }

    fn batch_max(&self) -> usize {
        self.config.get_i64("api/quote_batch_size", 250).clamp(1, 500) as usize
    }

    /// Issue one GET against `endpoint` (rate-limited, authenticated) for the
    /// given token query params and return the raw response body.
    async fn fetch_raw(&self, endpoint: &str, query: &[(&str, String)]) -> Result<String, ScanError> {
        self.limiter.acquire(endpoint).await;
        let token = self
            .credentials
            .token()
            .ok_or_else(|| ScanError::AuthInvalid("no access token available".into()))?;
        let headers: Vec<(&str, String)> = vec![("Authorization", format!("Bearer {token}"))];
        let path = endpoint.trim_start_matches('/');
        let url = crate::http::build_url(&self.base_url, path)?;
        let resp = self.transport.get(&url, query, &headers).await?;

        if resp.is_auth_error() {
            self.credentials.invalidate();
            return Err(ScanError::AuthInvalid(format!("status {}", resp.status)));
        }
        if resp.is_rate_limited() {
            self.limiter.throttle(endpoint).await;
            return Err(ScanError::RateLimited {
                endpoint: endpoint.to_string(),
            });
        }
        if !resp.is_success() {
            return Err(ScanError::Transport(crate::http::TransportError::Status {
                status: resp.status,
                body: resp.body,
            }));
        }
        Ok(resp.body)
    }

    /// Fetch full quote snapshots (including depth) for `tokens`, merging
    /// results into the returned instruments. Unknown tokens are omitted.
    ///
    /// An auth failure (401/403) on any chunk aborts the whole call per the
    /// error-handling design: the credential is already invalid, so partial
    /// results from the chunks that did succeed would be pricing candidates
    /// off a stale snapshot.
    pub async fn quotes(&self, instruments: &[Instrument]) -> Result<HashMap<u64, Instrument>, ScanError> {
        let chunks: Vec<&[Instrument]> = instruments.chunks(self.batch_max()).collect();
        let futures = chunks.iter().map(|chunk| self.fetch_chunk(chunk));
        let results = join_all(futures).await;

        let mut merged = HashMap::new();
        for result in results {
            match result {
                Ok(map) => merged.extend(map),
                Err(ScanError::AuthInvalid(reason)) => return Err(ScanError::AuthInvalid(reason)),
                Err(e) => warn!(error = %e, "quote batch failed, continuing with partial results"),
            }
        }
        Ok(merged)
    }

    async fn fetch_chunk(&self, chunk: &[Instrument]) -> Result<HashMap<u64, Instrument>, ScanError> {
        let query: Vec<(&str, String)> = chunk.iter().map(|i| ("i", i.token.to_string())).collect();
        let body = self.fetch_raw("/quote", &query).await?;
        let envelope: QuoteEnvelope = serde_json::from_str(&body)
            .map_err(|e| ScanError::Transport(crate::http::TransportError::Decode(e.to_string())))?;

        let by_token: HashMap<u64, &Instrument> = chunk.iter().map(|i| (i.token, i)).collect();
        let mut merged = HashMap::new();
        for (key, record) in envelope.data {
            let Ok(token) = key.parse::<u64>() else {
                warn!(key, "quote response key was not a numeric token");
                continue;
            };
            let Some(base) = by_token.get(&token) else {
                continue;
            };
            let ohlc = record.ohlc.unwrap_or_default();
            let depth = record.depth.unwrap_or(DepthEnvelope {
                buy: Vec::new(),
                sell: Vec::new(),
            });
            let mut instrument = (*base).clone();
            instrument.last = record.last_price.unwrap_or(Decimal::ZERO);
            instrument.open = ohlc.open;
            instrument.high = ohlc.high;
            instrument.low = ohlc.low;
            instrument.close = ohlc.close;
            instrument.average = record.average_price;
            instrument.volume = record.volume;
            instrument.buy_quantity = record.buy_quantity;
            instrument.sell_quantity = record.sell_quantity;
            instrument.open_interest = record.oi;
            instrument.buy_depth = to_ladder(depth.buy);
            instrument.sell_depth = to_ladder(depth.sell);
            merged.insert(token, instrument);
        }
        Ok(merged)
    }

    /// Fetch last-traded prices for `tokens` from the lighter `/quote/ltp`
    /// endpoint. Unknown tokens are omitted; an auth failure aborts the call.
    pub async fn ltps(&self, tokens: &[u64]) -> Result<HashMap<u64, Decimal>, ScanError> {
        let chunks: Vec<&[u64]> = tokens.chunks(self.batch_max()).collect();
        let futures = chunks.iter().map(|chunk| self.fetch_ltp_chunk(chunk));
        let results = join_all(futures).await;

        let mut merged = HashMap::new();
        for result in results {
            match result {
                Ok(map) => merged.extend(map),
                Err(ScanError::AuthInvalid(reason)) => return Err(ScanError::AuthInvalid(reason)),
                Err(e) => warn!(error = %e, "ltp batch failed, continuing with partial results"),
            }
        }
        Ok(merged)
    }

    async fn fetch_ltp_chunk(&self, chunk: &[u64]) -> Result<HashMap<u64, Decimal>, ScanError> {
        let query: Vec<(&str, String)> = chunk.iter().map(|t| ("i", t.to_string())).collect();
        let body = self.fetch_raw("/quote/ltp", &query).await?;
        let envelope: LtpEnvelope = serde_json::from_str(&body)
            .map_err(|e| ScanError::Transport(crate::http::TransportError::Decode(e.to_string())))?;

        let mut merged = HashMap::new();
        for (key, record) in envelope.data {
            let Ok(token) = key.parse::<u64>() else {
                warn!(key, "ltp response key was not a numeric token");
                continue;
            };
            merged.insert(token, record.last_price);
        }
        Ok(merged)
    }

    /// Fetch OHLC snapshots for `tokens` from the `/quote/ohlc` endpoint.
    /// Unknown tokens are omitted; an auth failure aborts the call.
    pub async fn ohlcs(&self, tokens: &[u64]) -> Result<HashMap<u64, OhlcSnapshot>, ScanError> {
        let chunks: Vec<&[u64]> = tokens.chunks(self.batch_max()).collect();
        let futures = chunks.iter().map(|chunk| self.fetch_ohlc_chunk(chunk));
        let results = join_all(futures).await;

        let mut merged = HashMap::new();
        for result in results {
            match result {
                Ok(map) => merged.extend(map),
                Err(ScanError::AuthInvalid(reason)) => return Err(ScanError::AuthInvalid(reason)),
                Err(e) => warn!(error = %e, "ohlc batch failed, continuing with partial results"),
            }
        }
        Ok(merged)
    }

    async fn fetch_ohlc_chunk(&self, chunk: &[u64]) -> Result<HashMap<u64, OhlcSnapshot>, ScanError> {
        let query: Vec<(&str, String)> = chunk.iter().map(|t| ("i", t.to_string())).collect();
        let body = self.fetch_raw("/quote/ohlc", &query).await?;
        let envelope: OhlcEnvelope = serde_json::from_str(&body)
            .map_err(|e| ScanError::Transport(crate::http::TransportError::Decode(e.to_string())))?;

        let mut merged = HashMap::new();
        for (key, record) in envelope.data {
            let Ok(token) = key.parse::<u64>() else {
                warn!(key, "ohlc response key was not a numeric token");
                continue;
            };
            merged.insert(token, record.ohlc.into());
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock::CannedTransport;
    use crate::http::HttpResponse;
    use crate::models::{InstrumentKind, OptionKind};

    struct StaticCreds;
    impl CredentialProvider for StaticCreds {
        fn token(&self) -> Option<String> {
            Some("tok".into())
        }
        fn invalidate(&self) {}
    }

    fn sample_instrument(token: u64) -> Instrument {
        Instrument {
            token,
            trading_symbol: "NIFTY23JUN22000CE".into(),
            exchange: "NFO".into(),
            name: "NIFTY".into(),
            segment: "NFO-OPT".into(),
            kind: InstrumentKind::Option,
            underlying: "NIFTY".into(),
            strike: Decimal::new(22000, 0),
            option_kind: OptionKind::Call,
            expiry: chrono::Utc::now(),
            last: Decimal::ZERO,
            open: Decimal::ZERO,
            high: Decimal::ZERO,
            low: Decimal::ZERO,
            close: Decimal::ZERO,
            average: Decimal::ZERO,
            volume: 0,
            buy_quantity: 0,
            sell_quantity: 0,
            open_interest: 0,
            buy_depth: Default::default(),
            sell_depth: Default::default(),
        }
    }

    fn test_fetcher(transport: CannedTransport) -> QuoteFetcher {
        let path = std::env::temp_dir().join(format!("box-scanner-quote-test-{:?}.toml", std::thread::current().id()));
        std::fs::write(&path, "").unwrap();
        let config = Arc::new(Config::load(&path).unwrap());
        std::fs::remove_file(&path).ok();
        let limiter = Arc::new(RateLimiter::new(100));
        QuoteFetcher::new(Arc::new(transport), limiter, Arc::new(StaticCreds), config, "https://api.example".into())
    }

    #[tokio::test]
    async fn merges_quote_response_into_instruments() {
        let body = r#"{"status":"success","data":{"256265":{"last_price":"101.5","ohlc":{"open":"100","high":"105","low":"99","close":"100"},"volume":10,"buy_quantity":1,"sell_quantity":2,"oi":5,"average_price":"100.2","depth":{"buy":[{"price":"101","quantity":10,"orders":1}],"sell":[{"price":"102","quantity":5,"orders":1}]}}}}"#;
        let transport = CannedTransport::new(vec![Ok(HttpResponse {
            status: 200,
            body: body.to_string(),
        })]);
        let fetcher = test_fetcher(transport);

        let instruments = vec![sample_instrument(256265)];
        let merged = fetcher.quotes(&instruments).await.unwrap();
        let got = merged.get(&256265).unwrap();
        assert_eq!(got.last, Decimal::new(1015, 1));
        assert_eq!(got.sell_depth.levels.len(), 1);
    }

    #[tokio::test]
    async fn auth_invalid_aborts_quotes_instead_of_returning_partial_results() {
        let transport = CannedTransport::new(vec![Ok(HttpResponse {
            status: 401,
            body: "unauthorized".to_string(),
        })]);
        let fetcher = test_fetcher(transport);
        let instruments = vec![sample_instrument(256265)];
        let result = fetcher.quotes(&instruments).await;
        assert!(matches!(result, Err(ScanError::AuthInvalid(_))));
    }

    #[tokio::test]
    async fn ltps_parses_last_price_map() {
        let body = r#"{"status":"success","data":{"256265":{"last_price":"101.5"}}}"#;
        let transport = CannedTransport::new(vec![Ok(HttpResponse {
            status: 200,
            body: body.to_string(),
        })]);
        let fetcher = test_fetcher(transport);
        let merged = fetcher.ltps(&[256265]).await.unwrap();
        assert_eq!(merged.get(&256265), Some(&Decimal::new(1015, 1)));
    }

    #[tokio::test]
    async fn ohlcs_parses_ohlc_map() {
        let body = r#"{"status":"success","data":{"256265":{"ohlc":{"open":"100","high":"105","low":"99","close":"102"}}}}"#;
        let transport = CannedTransport::new(vec![Ok(HttpResponse {
            status: 200,
            body: body.to_string(),
        })]);
        let fetcher = test_fetcher(transport);
        let merged = fetcher.ohlcs(&[256265]).await.unwrap();
        let got = merged.get(&256265).unwrap();
        assert_eq!(got.open, Decimal::new(100, 0));
        assert_eq!(got.close, Decimal::new(102, 0));
    }
}
