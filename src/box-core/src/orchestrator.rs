//! Drives one scan cycle across selected expiries and emits the globally
//! ranked candidate list.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info};

use crate::evaluator::{CombinationEvaluator, EvaluatorConfig};
use crate::expiry::ExpiryClassifier;
use crate::instrument_store::InstrumentStore;
use crate::models::BoxSpreadCandidate;

#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub candidate_count: usize,
    pub per_expiry_counts: HashMap<String, usize>,
    pub duration: Duration,
}

pub struct ScanOrchestrator {
    store: Arc<InstrumentStore>,
    classifier: Arc<ExpiryClassifier>,
    evaluator: Arc<CombinationEvaluator>,
}

impl ScanOrchestrator {
    pub fn new(store: Arc<InstrumentStore>, classifier: Arc<ExpiryClassifier>, evaluator: Arc<CombinationEvaluator>) -> Self {
        Self {
            store,
            classifier,
            evaluator,
        }
    }

    async fn spot_price(&self, underlying: &str, exchange: &str) -> Option<Decimal> {
        let instrument = self.store.by_symbol(underlying, exchange).await.ok().flatten()?;
        if instrument.last > Decimal::ZERO {
            Some(instrument.last)
        } else {
            None
        }
    }

    /// Run one scan cycle over `expiries`, absorbing any single-expiry
    /// failure so the cycle continues, and return the globally sorted
    /// candidate list plus a summary.
    pub async fn run_cycle(
        &self,
        underlying: &str,
        exchange: &str,
        expiries: &[DateTime<Utc>],
        strike_band_pct: Decimal,
        config: &EvaluatorConfig,
        process_in_parallel: bool,
        delay_between_expiries: Duration,
    ) -> (Vec<BoxSpreadCandidate>, ScanSummary) {
        let start = Instant::now();
        let spot = self.spot_price(underlying, exchange).await;

        let mut all_candidates = Vec::new();
        let mut per_expiry_counts = HashMap::new();

        if process_in_parallel {
            let mut futures = Vec::new();
            for &expiry in expiries {
                futures.push(self.evaluator.evaluate_expiry(underlying, exchange, expiry, spot, strike_band_pct, config));
            }
            let results = futures_util::future::join_all(futures).await;
            for (expiry, result) in expiries.iter().zip(results) {
                match result {
                    Ok(candidates) => {
                        per_expiry_counts.insert(expiry.format("%Y-%m-%d").to_string(), candidates.len());
                        all_candidates.extend(candidates);
                    }
                    Err(e) => {
                        error!(%expiry, error = %e, "expiry evaluation failed, skipping");
                        per_expiry_counts.insert(expiry.format("%Y-%m-%d").to_string(), 0);
                    }
                }
            }
        } else {
            for (idx, &expiry) in expiries.iter().enumerate() {
                match self
                    .evaluator
                    .evaluate_expiry(underlying, exchange, expiry, spot, strike_band_pct, config)
                    .await
                {
                    Ok(candidates) => {
                        per_expiry_counts.insert(expiry.format("%Y-%m-%d").to_string(), candidates.len());
                        all_candidates.extend(candidates);
                    }
                    Err(e) => {
                        error!(%expiry, error = %e, "expiry evaluation failed, skipping");
                        per_expiry_counts.insert(expiry.format("%Y-%m-%d").to_string(), 0);
                    }
                }
                if idx + 1 < expiries.len() && !delay_between_expiries.is_zero() {
                    tokio::time::sleep(delay_between_expiries).await;
                }
            }
        }

        all_candidates.sort_by(|a, b| {
            b.profitability_score
                .partial_cmp(&a.profitability_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        let summary = ScanSummary {
            candidate_count: all_candidates.len(),
            per_expiry_counts,
            duration: start.elapsed(),
        };
        info!(candidates = summary.candidate_count, duration_ms = summary.duration.as_millis(), "scan cycle complete");
        (all_candidates, summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranking_is_monotonic_non_increasing() {
        let mut candidates = vec![
            make(Decimal::from(5)),
            make(Decimal::from(10)),
            make(Decimal::from(1)),
        ];
        candidates.sort_by(|a, b| {
            b.profitability_score
                .partial_cmp(&a.profitability_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for w in candidates.windows(2) {
            assert!(w[0].profitability_score >= w[1].profitability_score);
        }
    }

    fn make(score: Decimal) -> BoxSpreadCandidate {
        let instrument = Arc::new(crate::models::Instrument {
            token: 1,
            trading_symbol: "X".into(),
            exchange: "NFO".into(),
            name: "X".into(),
            segment: "NFO-OPT".into(),
            kind: crate::models::InstrumentKind::Option,
            underlying: "NIFTY".into(),
            strike: Default::default(),
            option_kind: crate::models::OptionKind::Call,
            expiry: Utc::now(),
            last: Default::default(),
            open: Default::default(),
            high: Default::default(),
            low: Default::default(),
            close: Default::default(),
            average: Default::default(),
            volume: 0,
            buy_quantity: 0,
            sell_quantity: 0,
            open_interest: 0,
            buy_depth: Default::default(),
            sell_depth: Default::default(),
        });
        BoxSpreadCandidate {
            id: format!("id-{score}"),
            underlying: "NIFTY".into(),
            exchange: "NFO".into(),
            lower_strike: Default::default(),
            higher_strike: Default::default(),
            expiry: Utc::now(),
            long_call_low: Arc::clone(&instrument),
            short_call_high: Arc::clone(&instrument),
            long_put_high: Arc::clone(&instrument),
            short_put_low: instrument,
            net_premium: Default::default(),
            theoretical_value: Default::default(),
            slippage: Default::default(),
            fees: Default::default(),
            margin_required: Default::default(),
            roi_pct: Default::default(),
            profitability_score: score,
            max_loss: Default::default(),
            max_profit: Default::default(),
            executed: false,
        }
    }
}
