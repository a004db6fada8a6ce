//! Weekly/monthly expiry classification.
//!
//! Dates are handled as `chrono::NaiveDate` in exchange-local time rather
//! than through `localtime`/`mktime`, and "now" is always an explicit
//! parameter so the classifier is immune to DST-transition misclassification
//! and independently testable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};

use crate::instrument_store::InstrumentStore;
use crate::models::InstrumentKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryClass {
    Weekly,
    Monthly,
    Neither,
}

/// An expiry is monthly when it is a Thursday and adding 7 days crosses into
/// a later calendar month; weekly when it is a Thursday but not monthly;
/// otherwise neither.
pub fn classify(date: NaiveDate) -> ExpiryClass {
    if date.weekday() != Weekday::Thu {
        return ExpiryClass::Neither;
    }
    let next_week = date + Duration::days(7);
    if next_week.month() != date.month() || next_week.year() != date.year() {
        ExpiryClass::Monthly
    } else {
        ExpiryClass::Weekly
    }
}

pub struct ExpiryClassifier {
    store: Arc<InstrumentStore>,
    expiry_cache: Mutex<HashMap<(String, String), (Vec<DateTime<Utc>>, Vec<DateTime<Utc>>)>>,
}

impl ExpiryClassifier {
    pub fn new(store: Arc<InstrumentStore>) -> Self {
        Self {
            store,
            expiry_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Distinct future expiries for `(underlying, exchange)`, partitioned
    /// into (weekly, monthly), both sorted ascending. The classification is
    /// cached per `(underlying, exchange)` so repeated scan cycles don't
    /// re-walk the instrument universe every time; call [`Self::clear_cache`]
    /// after an instrument store refresh to pick up newly listed expiries.
    pub async fn expiries(
        &self,
        underlying: &str,
        exchange: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(Vec<DateTime<Utc>>, Vec<DateTime<Utc>>)> {
        let key = (underlying.to_string(), exchange.to_string());
        if let Some(cached) = self.cache_get(&key) {
            return Ok(cached);
        }

        let instruments = self.store.by_exchange(exchange).await?;
        let underlying_lower = underlying.to_ascii_lowercase();

        let mut distinct: Vec<DateTime<Utc>> = instruments
            .iter()
            .filter(|i| i.kind == InstrumentKind::Option)
            .filter(|i| {
                i.underlying.eq_ignore_ascii_case(underlying) || {
                    let sym_lower = i.trading_symbol.to_ascii_lowercase();
                    sym_lower.starts_with(&underlying_lower)
                        && (sym_lower.ends_with("ce") || sym_lower.ends_with("pe"))
                }
            })
            .map(|i| i.expiry)
            .filter(|e| *e > now)
            .collect();
        distinct.sort();
        distinct.dedup();

        let mut weekly = Vec::new();
        let mut monthly = Vec::new();
        for expiry in distinct {
            match classify(expiry.date_naive()) {
                ExpiryClass::Monthly => monthly.push(expiry),
                ExpiryClass::Weekly => weekly.push(expiry),
                ExpiryClass::Neither => {}
            }
        }
        self.cache_put(key, (weekly.clone(), monthly.clone()));
        Ok((weekly, monthly))
    }

    /// Apply the day-range, class, and count filters. Unlike `expiries()`,
    /// this is not cached: the day-range window depends on `now`, which
    /// changes every scan cycle.
    pub fn filter(
        &self,
        weekly: &[DateTime<Utc>],
        monthly: &[DateTime<Utc>],
        include_weekly: bool,
        include_monthly: bool,
        min_days: i64,
        max_days: i64,
        max_count: usize,
        now: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let mut candidates: Vec<DateTime<Utc>> = Vec::new();
        if include_weekly {
            candidates.extend(weekly.iter().copied());
        }
        if include_monthly {
            candidates.extend(monthly.iter().copied());
        }
        candidates.retain(|e| {
            let days = (*e - now).num_days();
            days >= min_days && days <= max_days
        });
        candidates.sort();
        candidates.truncate(max_count);
        candidates
    }

    pub fn cache_get(&self, key: &(String, String)) -> Option<(Vec<DateTime<Utc>>, Vec<DateTime<Utc>>)> {
        self.expiry_cache.lock().unwrap().get(key).cloned()
    }

    pub fn cache_put(&self, key: (String, String), value: (Vec<DateTime<Utc>>, Vec<DateTime<Utc>>)) {
        self.expiry_cache.lock().unwrap().insert(key, value);
    }

    /// Drop all cached classifications, e.g. after an instrument store
    /// refresh brings in newly listed expiries.
    pub fn clear_cache(&self) {
        self.expiry_cache.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_thursday_of_month_is_monthly() {
        let d = NaiveDate::from_ymd_opt(2024, 6, 27).unwrap();
        assert_eq!(classify(d), ExpiryClass::Monthly);
    }

    #[test]
    fn earlier_thursday_is_weekly() {
        let d = NaiveDate::from_ymd_opt(2024, 6, 20).unwrap();
        assert_eq!(classify(d), ExpiryClass::Weekly);
    }

    #[test]
    fn non_thursday_is_neither() {
        let d = NaiveDate::from_ymd_opt(2024, 6, 26).unwrap();
        assert_eq!(classify(d), ExpiryClass::Neither);
    }

    struct StaticCreds;
    impl crate::auth::CredentialProvider for StaticCreds {
        fn token(&self) -> Option<String> {
            Some("tok".into())
        }
        fn invalidate(&self) {}
    }

    /// A cache hit must short-circuit before the instrument store is ever
    /// consulted; the transport here errors on any call, so a cache miss
    /// would surface as an `Err` instead of the expected cached tuple.
    #[tokio::test]
    async fn expiries_returns_cached_value_without_touching_store() {
        use crate::config::Config;
        use crate::http::mock::CannedTransport;
        use crate::instrument_store::InstrumentStore;
        use crate::rate_limiter::RateLimiter;

        let config = Arc::new(Config::load("/nonexistent/box-scanner-expiry-cache-test.toml").unwrap());
        let transport = Arc::new(CannedTransport::new(vec![]));
        let limiter = Arc::new(RateLimiter::new(100));
        let store = Arc::new(InstrumentStore::new(transport, limiter, Arc::new(StaticCreds), config, "https://api.example".into()));
        let classifier = ExpiryClassifier::new(store);

        let key = ("NIFTY".to_string(), "NFO".to_string());
        let now = Utc::now();
        let weekly = vec![now + Duration::days(2)];
        let monthly = vec![now + Duration::days(30)];
        classifier.cache_put(key, (weekly.clone(), monthly.clone()));

        let (w, m) = classifier.expiries("NIFTY", "NFO", now).await.unwrap();
        assert_eq!(w, weekly);
        assert_eq!(m, monthly);
    }
}
