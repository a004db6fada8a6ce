//! Enumerates strike pairs for one (underlying, exchange, expiry), fans
//! pricing/risk evaluation out across the worker pool, then filters and
//! ranks survivors.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::error::ScanError;
use crate::instrument_store::InstrumentStore;
use crate::models::{BoxSpreadCandidate, Instrument, InstrumentKind, OptionKind};
use crate::pricing::{self, FeeRates};
use crate::quote_fetcher::QuoteFetcher;
use crate::risk::{self, RiskParams};
use crate::worker_pool::WorkerPool;

#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    pub quantity: Decimal,
    pub min_strike_diff: Decimal,
    pub max_strike_diff: Decimal,
    pub min_roi_pct: Decimal,
    pub min_profitability: Decimal,
    pub max_slippage: Decimal,
    pub worst_case_slippage_pct: Decimal,
    pub capital: Decimal,
    pub fee_rates: FeeRates,
    pub risk_params: RiskParams,
}

pub struct CombinationEvaluator {
    store: Arc<InstrumentStore>,
    quotes: Arc<QuoteFetcher>,
    pool: Arc<WorkerPool>,
    strike_set_cache: Mutex<HashMap<(String, String, DateTime<Utc>), Vec<Decimal>>>,
    leg_pair_cache: Mutex<HashMap<(String, String, DateTime<Utc>, Decimal, OptionKind), Option<u64>>>,
}

impl CombinationEvaluator {
    pub fn new(store: Arc<InstrumentStore>, quotes: Arc<QuoteFetcher>, pool: Arc<WorkerPool>) -> Self {
        Self {
            store,
            quotes,
            pool,
            strike_set_cache: Mutex::new(HashMap::new()),
            leg_pair_cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn strikes_for(
        &self,
        underlying: &str,
        exchange: &str,
        expiry: DateTime<Utc>,
    ) -> Result<Vec<Decimal>, ScanError> {
        let key = (underlying.to_string(), exchange.to_string(), expiry);
        if let Some(cached) = self.strike_set_cache.lock().unwrap().get(&key) {
            return Ok(cached.clone());
        }
        let instruments = self.store.by_exchange(exchange).await?;
        let mut strikes: Vec<Decimal> = instruments
            .iter()
            .filter(|i| i.kind == InstrumentKind::Option && i.expiry == expiry)
            .filter(|i| i.underlying.eq_ignore_ascii_case(underlying))
            .map(|i| i.strike)
            .collect();
        strikes.sort();
        strikes.dedup();
        self.strike_set_cache.lock().unwrap().insert(key, strikes.clone());
        Ok(strikes)
    }

    /// Run the full evaluator protocol for one (underlying, exchange, expiry)
    /// and return the filtered, ranked candidates.
    pub async fn evaluate_expiry(
        &self,
        underlying: &str,
        exchange: &str,
        expiry: DateTime<Utc>,
        spot: Option<Decimal>,
        strike_band_pct: Decimal,
        config: &EvaluatorConfig,
    ) -> Result<Vec<BoxSpreadCandidate>, ScanError> {
        let mut strikes = self.strikes_for(underlying, exchange, expiry).await?;

        if let Some(spot) = spot {
            let lower_bound = spot * (Decimal::ONE - strike_band_pct / Decimal::from(100));
            let upper_bound = spot * (Decimal::ONE + strike_band_pct / Decimal::from(100));
            strikes.retain(|s| *s >= lower_bound && *s <= upper_bound);
        }

        if strikes.len() < 2 {
            return Ok(Vec::new());
        }

        let pairs: Vec<(Decimal, Decimal)> = strikes
            .iter()
            .enumerate()
            .flat_map(|(idx, &lo)| {
                strikes[idx + 1..]
                    .iter()
                    .filter(move |&&hi| {
                        let diff = hi - lo;
                        diff >= config.min_strike_diff && diff <= config.max_strike_diff
                    })
                    .map(move |&hi| (lo, hi))
            })
            .collect();

        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let instruments = self.store.by_exchange(exchange).await?;
        let relevant: Vec<Instrument> = instruments
            .iter()
            .filter(|i| i.kind == InstrumentKind::Option && i.expiry == expiry)
            .filter(|i| i.underlying.eq_ignore_ascii_case(underlying))
            .cloned()
            .collect();

        let by_token: HashMap<u64, Instrument> = relevant.iter().map(|i| (i.token, i.clone())).collect();
        let relevant = Arc::new(relevant);

        let mut needed: HashSet<(Decimal, OptionKind)> = HashSet::new();
        for &(lo, hi) in &pairs {
            for sk in [(lo, OptionKind::Call), (hi, OptionKind::Call), (hi, OptionKind::Put), (lo, OptionKind::Put)] {
                needed.insert(sk);
            }
        }

        let mut legs: HashMap<(String, Decimal, OptionKind), Instrument> = HashMap::new();
        let mut pending = Vec::new();
        for (strike, kind) in needed {
            let cache_key = (underlying.to_string(), exchange.to_string(), expiry, strike, kind);
            match self.leg_pair_cache.lock().unwrap().get(&cache_key).copied() {
                Some(Some(token)) => {
                    if let Some(instrument) = by_token.get(&token) {
                        legs.insert((exchange.to_string(), strike, kind), instrument.clone());
                    }
                }
                Some(None) => {}
                None => {
                    let relevant = Arc::clone(&relevant);
                    let handle = self.pool.submit(move || (strike, kind, resolve_leg(&relevant, strike, kind)));
                    if let Ok(handle) = handle {
                        pending.push((cache_key, handle));
                    }
                }
            }
        }
        for (cache_key, handle) in pending {
            if let Some((strike, kind, resolved)) = handle.join() {
                self.leg_pair_cache.lock().unwrap().insert(cache_key, resolved.as_ref().map(|i| i.token));
                if let Some(instrument) = resolved {
                    legs.insert((exchange.to_string(), strike, kind), instrument);
                }
            }
        }

        if legs.is_empty() {
            return Err(ScanError::DataIncomplete(format!(
                "no option legs resolved for {underlying} {exchange} expiry {expiry}"
            )));
        }

        let to_quote: Vec<Instrument> = legs.values().cloned().collect();
        let quoted = self.quotes.quotes(&to_quote).await?;

        let mut candidates = Vec::new();
        for (lo, hi) in pairs {
            let lc = legs.get(&(exchange.to_string(), lo, OptionKind::Call));
            let sc = legs.get(&(exchange.to_string(), hi, OptionKind::Call));
            let lp = legs.get(&(exchange.to_string(), hi, OptionKind::Put));
            let sp = legs.get(&(exchange.to_string(), lo, OptionKind::Put));
            let (Some(lc), Some(sc), Some(lp), Some(sp)) = (lc, sc, lp, sp) else {
                continue;
            };
            let lc = quoted.get(&lc.token).cloned().unwrap_or_else(|| lc.clone());
            let sc = quoted.get(&sc.token).cloned().unwrap_or_else(|| sc.clone());
            let lp = quoted.get(&lp.token).cloned().unwrap_or_else(|| lp.clone());
            let sp = quoted.get(&sp.token).cloned().unwrap_or_else(|| sp.clone());
            candidates.push((lo, hi, lc, sc, lp, sp));
        }

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let evaluated = self.evaluate_candidates_on_pool(underlying, exchange, expiry, candidates, config);
        let mut survivors: Vec<BoxSpreadCandidate> = evaluated
            .into_iter()
            .filter(|c| {
                c.roi_pct >= config.min_roi_pct
                    && c.profitability_score >= config.min_profitability
                    && c.slippage <= config.max_slippage
            })
            .collect();

        survivors.sort_by(|a, b| b.profitability_score.partial_cmp(&a.profitability_score).unwrap_or(std::cmp::Ordering::Equal));
        debug!(underlying, exchange, %expiry, survivors = survivors.len(), "expiry evaluation complete");
        Ok(survivors)
    }

    #[allow(clippy::type_complexity)]
    fn evaluate_candidates_on_pool(
        &self,
        underlying: &str,
        exchange: &str,
        expiry: DateTime<Utc>,
        candidates: Vec<(Decimal, Decimal, Instrument, Instrument, Instrument, Instrument)>,
        config: &EvaluatorConfig,
    ) -> Vec<BoxSpreadCandidate> {
        let total = candidates.len();
        let shard_count = std::cmp::max(1, std::cmp::min(candidates.len(), 8));
        let batch_size = std::cmp::max(1, std::cmp::min(50, candidates.len() / shard_count));
        let results: Arc<Mutex<Vec<BoxSpreadCandidate>>> = Arc::new(Mutex::new(Vec::new()));
        let processed = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let monitor = spawn_progress_monitor(
            Arc::clone(&processed),
            Arc::clone(&done),
            total,
            underlying.to_string(),
            exchange.to_string(),
            expiry,
        );

        let mut handles = Vec::new();
        for batch in candidates.chunks(batch_size.max(1)) {
            let batch = batch.to_vec();
            let batch_len = batch.len();
            let underlying = underlying.to_string();
            let exchange = exchange.to_string();
            let results = Arc::clone(&results);
            let processed = Arc::clone(&processed);
            let config = config.clone();
            let handle = self.pool.submit(move || {
                let mut built = Vec::with_capacity(batch.len());
                for (lo, hi, lc, sc, lp, sp) in batch {
                    if let Some(candidate) = build_candidate(&underlying, &exchange, lo, hi, expiry, lc, sc, lp, sp, &config) {
                        built.push(candidate);
                    }
                }
                let mut results = results.lock().unwrap();
                results.extend(built);
                drop(results);
                processed.fetch_add(batch_len, Ordering::Relaxed);
            });
            if let Ok(h) = handle {
                handles.push(h);
            }
        }
        for h in handles {
            h.join();
        }
        processed.store(total, Ordering::Relaxed);
        done.store(true, Ordering::Relaxed);
        let _ = monitor.join();
        Arc::try_unwrap(results).map(|m| m.into_inner().unwrap()).unwrap_or_default()
    }

    pub fn clear_cache(&self) {
        self.strike_set_cache.lock().unwrap().clear();
        self.leg_pair_cache.lock().unwrap().clear();
    }
}

/// Runs on its own thread, independent of the worker pool, so progress
/// reporting never competes with evaluation for a pool slot. Polls at a
/// short interval to shut down promptly once `done` is set, but only emits
/// a log line roughly every 5 seconds per the reporting cadence.
fn spawn_progress_monitor(
    processed: Arc<AtomicUsize>,
    done: Arc<AtomicBool>,
    total: usize,
    underlying: String,
    exchange: String,
    expiry: DateTime<Utc>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let start = Instant::now();
        let report_every = Duration::from_secs(5);
        let mut last_report = Instant::now();
        loop {
            if done.load(Ordering::Relaxed) {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
            if last_report.elapsed() < report_every {
                continue;
            }
            last_report = Instant::now();
            let done_count = processed.load(Ordering::Relaxed);
            let pct = if total == 0 { 100.0 } else { done_count as f64 / total as f64 * 100.0 };
            let eta_secs = if done_count == 0 || done_count >= total {
                0
            } else {
                let elapsed = start.elapsed().as_secs_f64();
                let rate = elapsed / done_count as f64;
                (rate * (total - done_count) as f64).round() as u64
            };
            info!(underlying, exchange, %expiry, processed = done_count, total, pct = format!("{pct:.1}"), eta_secs, "combination evaluation progress");
            if done_count >= total {
                return;
            }
        }
    })
}

fn resolve_leg(instruments: &[Instrument], strike: Decimal, kind: OptionKind) -> Option<Instrument> {
    let mut matches: Vec<&Instrument> = instruments
        .iter()
        .filter(|i| i.kind == InstrumentKind::Option && i.strike == strike && i.option_kind == kind)
        .collect();
    matches.sort_by(|a, b| a.trading_symbol.cmp(&b.trading_symbol));
    matches.first().map(|i| (*i).clone())
}

#[allow(clippy::too_many_arguments)]
fn build_candidate(
    underlying: &str,
    exchange: &str,
    lower: Decimal,
    higher: Decimal,
    expiry: DateTime<Utc>,
    long_call_low: Instrument,
    short_call_high: Instrument,
    long_put_high: Instrument,
    short_put_low: Instrument,
    config: &EvaluatorConfig,
) -> Option<BoxSpreadCandidate> {
    let id = BoxSpreadCandidate::make_id(underlying, exchange, lower, higher, &expiry);
    let theoretical_value = pricing::theoretical_value(lower, higher);
    let net_premium = pricing::net_premium(
        long_call_low.last,
        short_call_high.last,
        long_put_high.last,
        short_put_low.last,
    );

    let mut candidate = BoxSpreadCandidate {
        id,
        underlying: underlying.to_string(),
        exchange: exchange.to_string(),
        lower_strike: lower,
        higher_strike: higher,
        expiry,
        long_call_low: Arc::new(long_call_low),
        short_call_high: Arc::new(short_call_high),
        long_put_high: Arc::new(long_put_high),
        short_put_low: Arc::new(short_put_low),
        net_premium,
        theoretical_value,
        slippage: Decimal::ZERO,
        fees: Decimal::ZERO,
        margin_required: Decimal::ZERO,
        roi_pct: Decimal::ZERO,
        profitability_score: Decimal::ZERO,
        max_loss: Decimal::ZERO,
        max_profit: Decimal::ZERO,
        executed: false,
    };

    if !candidate.has_complete_market_data() {
        return None;
    }

    let slippage = pricing::total_slippage(&candidate, config.quantity, config.worst_case_slippage_pct);
    let fees = pricing::calculate_fees(&candidate, config.quantity, &config.fee_rates);
    let raw_pl = theoretical_value - net_premium;
    let adjusted_pl = raw_pl - slippage - fees;

    let turnover = (candidate.long_call_low.last
        + candidate.short_call_high.last
        + candidate.long_put_high.last
        + candidate.short_put_low.last)
        * config.quantity;
    let max_loss = risk::max_loss(net_premium, fees, slippage, config.quantity);
    let margin_required = risk::margin_required(max_loss, turnover, &config.risk_params);
    let roi_pct = risk::roi_pct(adjusted_pl, margin_required);
    let profitability_score = risk::profitability_score(roi_pct, adjusted_pl);

    candidate.slippage = slippage;
    candidate.fees = fees;
    candidate.margin_required = margin_required;
    candidate.roi_pct = roi_pct;
    candidate.profitability_score = profitability_score;
    candidate.max_loss = max_loss;
    candidate.max_profit = adjusted_pl.max(Decimal::ZERO);

    Some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EvaluatorConfig {
        EvaluatorConfig {
            quantity: Decimal::from(10),
            min_strike_diff: Decimal::from(50),
            max_strike_diff: Decimal::from(500),
            min_roi_pct: Decimal::ZERO,
            min_profitability: Decimal::MIN,
            max_slippage: Decimal::from(1_000_000),
            worst_case_slippage_pct: Decimal::new(5, 2),
            capital: Decimal::from(100_000),
            fee_rates: FeeRates::default(),
            risk_params: RiskParams::default(),
        }
    }

    fn instrument(token: u64, strike: Decimal, kind: OptionKind, last: Decimal) -> Instrument {
        Instrument {
            token,
            trading_symbol: format!("NIFTY{strike}{kind:?}"),
            exchange: "NFO".into(),
            name: "NIFTY".into(),
            segment: "NFO-OPT".into(),
            kind: InstrumentKind::Option,
            underlying: "NIFTY".into(),
            strike,
            option_kind: kind,
            expiry: chrono::Utc::now(),
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
            buy_depth: crate::models::DepthLadder {
                levels: vec![crate::models::DepthLevel { price: last, quantity: 100, orders: 1 }],
            },
            sell_depth: crate::models::DepthLadder {
                levels: vec![crate::models::DepthLevel { price: last, quantity: 100, orders: 1 }],
            },
        }
    }

    #[test]
    fn build_candidate_rejects_incomplete_market_data() {
        let config = test_config();
        let lc = instrument(1, Decimal::from(18000), OptionKind::Call, Decimal::ZERO);
        let sc = instrument(2, Decimal::from(18100), OptionKind::Call, Decimal::from(50));
        let lp = instrument(3, Decimal::from(18100), OptionKind::Put, Decimal::from(90));
        let sp = instrument(4, Decimal::from(18000), OptionKind::Put, Decimal::from(40));
        let result = build_candidate("NIFTY", "NFO", Decimal::from(18000), Decimal::from(18100), chrono::Utc::now(), lc, sc, lp, sp, &config);
        assert!(result.is_none());
    }

    #[test]
    fn build_candidate_computes_theoretical_and_premium() {
        let config = test_config();
        let lc = instrument(1, Decimal::from(18000), OptionKind::Call, Decimal::from(30));
        let sc = instrument(2, Decimal::from(18100), OptionKind::Call, Decimal::from(50));
        let lp = instrument(3, Decimal::from(18100), OptionKind::Put, Decimal::from(90));
        let sp = instrument(4, Decimal::from(18000), OptionKind::Put, Decimal::from(40));
        let candidate = build_candidate("NIFTY", "NFO", Decimal::from(18000), Decimal::from(18100), chrono::Utc::now(), lc, sc, lp, sp, &config).unwrap();
        assert_eq!(candidate.theoretical_value, Decimal::from(100));
        assert_eq!(candidate.net_premium, Decimal::from(-30));
    }

    /// Depth present (so `has_complete_market_data` passes) but too thin to
    /// fill the requested quantity, forcing the worst-case slippage branch.
    fn instrument_with_thin_depth(token: u64, strike: Decimal, kind: OptionKind, last: Decimal) -> Instrument {
        let mut i = instrument(token, strike, kind, last);
        let thin = crate::models::DepthLadder {
            levels: vec![crate::models::DepthLevel { price: last, quantity: 1, orders: 1 }],
        };
        i.buy_depth = thin.clone();
        i.sell_depth = thin;
        i
    }

    /// A candidate whose legs can't fill the requested quantity pays the
    /// worst-case slippage on all four legs; the expiry-level filter in
    /// `evaluate_expiry` rejects anything above `max_slippage`.
    #[test]
    fn high_slippage_candidate_is_excluded_by_the_same_predicate_evaluate_expiry_uses() {
        let mut config = test_config();
        config.worst_case_slippage_pct = Decimal::new(5, 2);
        config.max_slippage = Decimal::from(10);

        let lc = instrument_with_thin_depth(1, Decimal::from(18000), OptionKind::Call, Decimal::from(30));
        let sc = instrument_with_thin_depth(2, Decimal::from(18100), OptionKind::Call, Decimal::from(50));
        let lp = instrument_with_thin_depth(3, Decimal::from(18100), OptionKind::Put, Decimal::from(90));
        let sp = instrument_with_thin_depth(4, Decimal::from(18000), OptionKind::Put, Decimal::from(40));
        let candidate = build_candidate("NIFTY", "NFO", Decimal::from(18000), Decimal::from(18100), chrono::Utc::now(), lc, sc, lp, sp, &config).unwrap();

        assert!(candidate.slippage > config.max_slippage);
        let passes = candidate.roi_pct >= config.min_roi_pct
            && candidate.profitability_score >= config.min_profitability
            && candidate.slippage <= config.max_slippage;
        assert!(!passes, "candidate with depth too thin to fill should fail the slippage filter");
    }
}
