//! Execution sink boundary: where a ranked candidate list goes once a scan
//! cycle completes. The live broker integration is out of scope; only the
//! seam and a paper-trading CSV writer are implemented.

use std::path::PathBuf;

use chrono::Utc;
use thiserror::Error;
use tracing::info;

use crate::models::BoxSpreadCandidate;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink i/o failure: {0}")]
    Io(String),

    #[error("not implemented")]
    NotImplemented,
}

#[derive(Debug, Clone, Default)]
pub struct RoutingSummary {
    pub routed: usize,
    pub skipped: usize,
}

pub trait ExecutionSink: Send + Sync {
    fn route(&self, ranked: &[BoxSpreadCandidate]) -> Result<RoutingSummary, SinkError>;
}

/// CSV-exports the ranked list for one scan cycle under a configurable
/// export directory, one file per cycle — the only persistence the
/// non-goals permit beyond the instrument cache.
pub struct PaperTradingSink {
    export_dir: PathBuf,
}

impl PaperTradingSink {
    pub fn new(export_dir: impl Into<PathBuf>) -> Self {
        Self {
            export_dir: export_dir.into(),
        }
    }

    fn write_csv(&self, ranked: &[BoxSpreadCandidate]) -> Result<PathBuf, SinkError> {
        std::fs::create_dir_all(&self.export_dir).map_err(|e| SinkError::Io(e.to_string()))?;
        let filename = format!("scan-{}.csv", Utc::now().format("%Y%m%dT%H%M%S"));
        let path = self.export_dir.join(filename);
        let mut writer = csv::Writer::from_path(&path).map_err(|e| SinkError::Io(e.to_string()))?;
        writer
            .write_record(["id", "underlying", "exchange", "lower_strike", "higher_strike", "net_premium", "roi_pct", "profitability_score"])
            .map_err(|e| SinkError::Io(e.to_string()))?;
        for c in ranked {
            writer
                .write_record([
                    c.id.clone(),
                    c.underlying.clone(),
                    c.exchange.clone(),
                    c.lower_strike.to_string(),
                    c.higher_strike.to_string(),
                    c.net_premium.to_string(),
                    c.roi_pct.to_string(),
                    c.profitability_score.to_string(),
                ])
                .map_err(|e| SinkError::Io(e.to_string()))?;
        }
        writer.flush().map_err(|e| SinkError::Io(e.to_string()))?;
        Ok(path)
    }
}

impl ExecutionSink for PaperTradingSink {
    fn route(&self, ranked: &[BoxSpreadCandidate]) -> Result<RoutingSummary, SinkError> {
        let path = self.write_csv(ranked)?;
        info!(path = %path.display(), count = ranked.len(), "exported ranked candidates");
        Ok(RoutingSummary {
            routed: ranked.len(),
            skipped: 0,
        })
    }
}

/// Stub for the live broker order-placement endpoint; out of scope.
pub struct NullBrokerSink;

impl ExecutionSink for NullBrokerSink {
    fn route(&self, _ranked: &[BoxSpreadCandidate]) -> Result<RoutingSummary, SinkError> {
        Err(SinkError::NotImplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sample_candidate() -> BoxSpreadCandidate {
        let instrument = crate::models::Instrument {
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
        };
        let instrument = Arc::new(instrument);
        BoxSpreadCandidate {
            id: "id".into(),
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
            profitability_score: Default::default(),
            max_loss: Default::default(),
            max_profit: Default::default(),
            executed: false,
        }
    }

    #[test]
    fn paper_trading_sink_writes_one_csv_per_cycle() {
        let dir = std::env::temp_dir().join(format!("box-scanner-sink-test-{:?}", std::thread::current().id()));
        let sink = PaperTradingSink::new(&dir);
        let summary = sink.route(&[sample_candidate()]).unwrap();
        assert_eq!(summary.routed, 1);
        let entries: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn null_broker_sink_is_not_implemented() {
        let sink = NullBrokerSink;
        assert!(matches!(sink.route(&[]), Err(SinkError::NotImplemented)));
    }
}
