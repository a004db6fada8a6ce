//! Fetches, parses, persists, and indexes the option universe.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::auth::CredentialProvider;
use crate::config::Config;
use crate::error::ScanError;
use crate::http::HttpTransport;
use crate::models::{Instrument, InstrumentKind, OptionKind};
use crate::rate_limiter::RateLimiter;

struct CacheState {
    by_token: HashMap<u64, Instrument>,
    by_symbol: HashMap<(String, String), u64>,
    last_refresh: Option<SystemTime>,
}

impl CacheState {
    fn empty() -> Self {
        Self {
            by_token: HashMap::new(),
            by_symbol: HashMap::new(),
            last_refresh: None,
        }
    }
}

pub struct InstrumentStore {
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<RateLimiter>,
    credentials: Arc<dyn CredentialProvider>,
    config: Arc<Config>,
    base_url: String,
    cache_path: PathBuf,
    cache: RwLock<CacheState>,
}

impl InstrumentStore {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        limiter: Arc<RateLimiter>,
        credentials: Arc<dyn CredentialProvider>,
        config: Arc<Config>,
        base_url: String,
    ) -> Self {
        let cache_path = PathBuf::from(config.get_string("api/instruments_cache_file", "instruments.csv"));
        Self {
            transport,
            limiter,
            credentials,
            config,
            base_url,
            cache_path,
            cache: RwLock::new(CacheState::empty()),
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(60 * self.config.get_i64("api/instruments_cache_ttl_minutes", 1440) as u64)
    }

    /// Returns the in-memory snapshot only if it's non-empty AND the backing
    /// file is still within `ttl()`; re-checked on every lookup (not just
    /// the first, cold one) so `instruments_cache_ttl_minutes` keeps taking
    /// effect for the life of the process instead of only at startup.
    pub async fn all(&self) -> Result<Vec<Instrument>, ScanError> {
        {
            let cache = self.cache.read().await;
            if !cache.by_token.is_empty() && self.cache_is_fresh() {
                return Ok(cache.by_token.values().cloned().collect());
            }
        }
        self.load_or_fetch().await
    }

    pub async fn by_token(&self, token: u64) -> Result<Option<Instrument>, ScanError> {
        {
            let cache = self.cache.read().await;
            if self.cache_is_fresh() {
                if let Some(i) = cache.by_token.get(&token) {
                    return Ok(Some(i.clone()));
                }
            }
        }
        let all = self.load_or_fetch().await?;
        Ok(all.into_iter().find(|i| i.token == token))
    }

    pub async fn by_symbol(&self, symbol: &str, exchange: &str) -> Result<Option<Instrument>, ScanError> {
        let key = (symbol.to_string(), exchange.to_string());
        {
            let cache = self.cache.read().await;
            if self.cache_is_fresh() {
                if let Some(token) = cache.by_symbol.get(&key) {
                    return Ok(cache.by_token.get(token).cloned());
                }
            }
        }
        let all = self.load_or_fetch().await?;
        Ok(all
            .into_iter()
            .find(|i| i.trading_symbol == symbol && i.exchange == exchange))
    }

    pub async fn by_exchange(&self, exchange: &str) -> Result<Vec<Instrument>, ScanError> {
        let all = self.all().await?;
        Ok(all.into_iter().filter(|i| i.exchange == exchange).collect())
    }

    pub async fn refresh(&self) -> Result<(), ScanError> {
        self.fetch_and_persist().await?;
        Ok(())
    }

    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        *cache = CacheState::empty();
    }

    async fn load_or_fetch(&self) -> Result<Vec<Instrument>, ScanError> {
        if self.cache_is_fresh() {
            match self.load_from_disk().await {
                Ok(instruments) => {
                    self.populate_cache(&instruments).await;
                    return Ok(instruments);
                }
                Err(e) => warn!(error = %e, "failed reading instrument cache, refetching"),
            }
        }
        self.fetch_and_persist().await
    }

    fn cache_is_fresh(&self) -> bool {
        let Ok(meta) = std::fs::metadata(&self.cache_path) else {
            return false;
        };
        let Ok(modified) = meta.modified() else {
            return false;
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age < self.ttl())
            .unwrap_or(false)
    }

    async fn load_from_disk(&self) -> Result<Vec<Instrument>, ScanError> {
        let contents = tokio::fs::read_to_string(&self.cache_path)
            .await
            .map_err(|e| ScanError::CacheIo(e.to_string()))?;
        Ok(parse_instruments_csv(&contents, &self.underlying()))
    }

    fn underlying(&self) -> String {
        self.config.get_string("strategy/underlying", "")
    }

    async fn fetch_and_persist(&self) -> Result<Vec<Instrument>, ScanError> {
        self.limiter.acquire("/instruments").await;
        let token = self.credentials.token();
        let mut headers: Vec<(&str, String)> = Vec::new();
        if let Some(t) = &token {
            headers.push(("Authorization", format!("Bearer {t}")));
        } else {
            return Err(ScanError::AuthInvalid("no access token available".into()));
        }
        let url = crate::http::build_url(&self.base_url, "instruments")?;
        let resp = self.transport.get(&url, &[], &headers).await?;
        if resp.is_auth_error() {
            self.credentials.invalidate();
            return Err(ScanError::AuthInvalid(format!("status {}", resp.status)));
        }
        if resp.is_rate_limited() {
            self.limiter.throttle("/instruments").await;
            return Err(ScanError::RateLimited {
                endpoint: "/instruments".to_string(),
            });
        }
        if !resp.is_success() {
            return Err(ScanError::Transport(crate::http::TransportError::Status {
                status: resp.status,
                body: resp.body,
            }));
        }

        if let Err(e) = self.persist_atomic(&resp.body).await {
            warn!(error = %e, "failed to persist instrument cache");
        }

        let instruments = parse_instruments_csv(&resp.body, &self.underlying());
        self.populate_cache(&instruments).await;
        debug!(count = instruments.len(), "refreshed instrument universe");
        Ok(instruments)
    }

    async fn persist_atomic(&self, body: &str) -> std::io::Result<()> {
        let tmp_path = self.cache_path.with_extension("csv.tmp");
        tokio::fs::write(&tmp_path, body).await?;
        tokio::fs::rename(&tmp_path, &self.cache_path).await
    }

    async fn populate_cache(&self, instruments: &[Instrument]) {
        let mut cache = self.cache.write().await;
        cache.by_token.clear();
        cache.by_symbol.clear();
        for instrument in instruments {
            cache
                .by_symbol
                .insert((instrument.trading_symbol.clone(), instrument.exchange.clone()), instrument.token);
            cache.by_token.insert(instrument.token, instrument.clone());
        }
        cache.last_refresh = Some(SystemTime::now());
    }
}

fn parse_instruments_csv(body: &str, configured_underlying: &str) -> Vec<Instrument> {
    let mut reader = csv::ReaderBuilder::new().has_headers(false).from_reader(body.as_bytes());
    let mut out = Vec::new();
    for record in reader.records().flatten() {
        if record.len() < 12 {
            continue;
        }
        match parse_instrument_record(&record, configured_underlying) {
            Some(instrument) => out.push(instrument),
            None => warn!("skipping malformed instrument record"),
        }
    }
    out
}

fn parse_instrument_record(record: &csv::StringRecord, configured_underlying: &str) -> Option<Instrument> {
    let token: u64 = record.get(0)?.trim().parse().ok()?;
    let trading_symbol = record.get(2)?.trim().to_string();
    let name = record.get(3)?.trim().to_string();
    let last: Decimal = record.get(4)?.trim().parse().unwrap_or(Decimal::ZERO);
    let expiry_field = record.get(5)?.trim();
    let strike: Decimal = record.get(6)?.trim().parse().unwrap_or(Decimal::ZERO);
    let kind_code = record.get(9)?.trim().to_ascii_uppercase();
    let segment_field = record.get(10)?.trim().to_ascii_uppercase();
    let exchange = record.get(11)?.trim().to_string();

    let mut kind = match kind_code.as_str() {
        "CE" => InstrumentKind::Option,
        "PE" => InstrumentKind::Option,
        "FUT" => InstrumentKind::Future,
        "EQ" => InstrumentKind::Equity,
        "INDICES" => InstrumentKind::Index,
        _ => InstrumentKind::Unknown,
    };
    let option_kind = match kind_code.as_str() {
        "CE" => OptionKind::Call,
        "PE" => OptionKind::Put,
        _ => OptionKind::None,
    };
    if segment_field.ends_with("-OPT") {
        kind = InstrumentKind::Option;
    } else if segment_field.ends_with("-FUT") {
        kind = InstrumentKind::Future;
    }

    let mut expiry = NaiveDate::parse_from_str(expiry_field, "%Y-%m-%d")
        .ok()
        .and_then(|d| Utc.from_local_datetime(&d.and_hms_opt(0, 0, 0)?).single())
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap());

    if expiry.timestamp() == 0 && kind == InstrumentKind::Option {
        if let Some(derived) = derive_expiry_from_symbol(&trading_symbol) {
            expiry = derived;
        }
    }

    let underlying = if trading_symbol
        .to_ascii_uppercase()
        .starts_with(&configured_underlying.to_ascii_uppercase())
        && !configured_underlying.is_empty()
    {
        configured_underlying.to_string()
    } else {
        String::new()
    };

    Some(Instrument {
        token,
        trading_symbol,
        exchange,
        name,
        segment: segment_field,
        kind,
        underlying,
        strike,
        option_kind,
        expiry,
        last,
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
    })
}

const MONTH_ABBREVS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// Recover an expiry date from a symbol like `NIFTY23JUN22...` (explicit
/// day-month-year) or `NIFTY2306...` (year-month only, resolved to the last
/// Thursday of that month) when the upstream expiry field is malformed.
fn derive_expiry_from_symbol(symbol: &str) -> Option<DateTime<Utc>> {
    let upper = symbol.to_ascii_uppercase();
    let digits_start = upper.find(|c: char| c.is_ascii_digit())?;
    let rest = &upper[digits_start..];
    if rest.len() >= 7 {
        let yy = rest.get(0..2)?;
        let mon = rest.get(2..5)?;
        let dd = rest.get(5..7)?;
        if let (Ok(yy_num), Some(month), Ok(dd_num)) = (
            yy.parse::<i32>(),
            MONTH_ABBREVS.iter().position(|m| *m == mon),
            dd.parse::<u32>(),
        ) {
            let year = 2000 + yy_num;
            if let Some(date) = NaiveDate::from_ymd_opt(year, month as u32 + 1, dd_num) {
                return Utc.from_local_datetime(&date.and_hms_opt(0, 0, 0)?).single();
            }
        }
    }
    if rest.len() >= 4 {
        let yy = rest.get(0..2)?;
        let mm = rest.get(2..4)?;
        if let (Ok(yy_num), Ok(mm_num)) = (yy.parse::<i32>(), mm.parse::<u32>()) {
            let year = 2000 + yy_num;
            if (1..=12).contains(&mm_num) {
                return last_thursday_of_month(year, mm_num);
            }
        }
    }
    None
}

fn last_thursday_of_month(year: i32, month: u32) -> Option<DateTime<Utc>> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let mut day = first_of_next.pred_opt()?;
    while day.weekday() != chrono::Weekday::Thu {
        day = day.pred_opt()?;
    }
    Utc.from_local_datetime(&day.and_hms_opt(0, 0, 0)?).single()
}
