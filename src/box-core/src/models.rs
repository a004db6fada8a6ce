//! Shared data model: instruments, depth ladders, and box-spread candidates.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentKind {
    Index,
    Equity,
    Future,
    Option,
    Currency,
    Commodity,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionKind {
    Call,
    Put,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub quantity: u64,
    pub orders: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepthLadder {
    pub levels: Vec<DepthLevel>,
}

impl DepthLadder {
    pub fn total_quantity(&self) -> u64 {
        self.levels.iter().map(|l| l.quantity).sum()
    }
}

/// One exchange-traded contract, including the latest live snapshot merged
/// in by the quote fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub token: u64,
    pub trading_symbol: String,
    pub exchange: String,
    pub name: String,
    pub segment: String,
    pub kind: InstrumentKind,
    pub underlying: String,
    pub strike: Decimal,
    pub option_kind: OptionKind,
    pub expiry: DateTime<Utc>,

    pub last: Decimal,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub average: Decimal,
    pub volume: u64,
    pub buy_quantity: u64,
    pub sell_quantity: u64,
    pub open_interest: u64,
    pub buy_depth: DepthLadder,
    pub sell_depth: DepthLadder,
}

impl Instrument {
    pub fn is_option(&self) -> bool {
        matches!(self.kind, InstrumentKind::Option)
    }

    pub fn has_market_data(&self) -> bool {
        self.last > Decimal::ZERO
    }
}

/// A 4-leg synthetic box spread: long call / short call at the higher strike,
/// long put at the higher strike, short put at the lower strike.
#[derive(Debug, Clone)]
pub struct BoxSpreadCandidate {
    pub id: String,
    pub underlying: String,
    pub exchange: String,
    pub lower_strike: Decimal,
    pub higher_strike: Decimal,
    pub expiry: DateTime<Utc>,

    pub long_call_low: Arc<Instrument>,
    pub short_call_high: Arc<Instrument>,
    pub long_put_high: Arc<Instrument>,
    pub short_put_low: Arc<Instrument>,

    pub net_premium: Decimal,
    pub theoretical_value: Decimal,
    pub slippage: Decimal,
    pub fees: Decimal,
    pub margin_required: Decimal,
    pub roi_pct: Decimal,
    pub profitability_score: Decimal,
    pub max_loss: Decimal,
    pub max_profit: Decimal,
    pub executed: bool,
}

impl BoxSpreadCandidate {
    pub fn make_id(
        underlying: &str,
        exchange: &str,
        lower_strike: Decimal,
        higher_strike: Decimal,
        expiry: &DateTime<Utc>,
    ) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            underlying,
            exchange,
            lower_strike,
            higher_strike,
            expiry.format("%Y-%m-%d")
        )
    }

    pub fn theoretical_value(lower_strike: Decimal, higher_strike: Decimal) -> Decimal {
        higher_strike - lower_strike
    }

    pub fn has_complete_market_data(&self) -> bool {
        self.long_call_low.has_market_data()
            && self.short_call_high.has_market_data()
            && self.long_put_high.has_market_data()
            && self.short_put_low.has_market_data()
            && !self.long_call_low.sell_depth.levels.is_empty()
            && !self.short_call_high.buy_depth.levels.is_empty()
            && !self.long_put_high.sell_depth.levels.is_empty()
            && !self.short_put_low.buy_depth.levels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn id_is_pure_function_of_components() {
        let expiry = Utc.with_ymd_and_hms(2024, 6, 27, 0, 0, 0).unwrap();
        let a = BoxSpreadCandidate::make_id("NIFTY", "NSE", Decimal::new(18000, 0), Decimal::new(18100, 0), &expiry);
        let b = BoxSpreadCandidate::make_id("NIFTY", "NSE", Decimal::new(18000, 0), Decimal::new(18100, 0), &expiry);
        assert_eq!(a, b);
        assert_eq!(a, "NIFTY|NSE|18000|18100|2024-06-27");
    }

    #[test]
    fn theoretical_value_equals_strike_spread() {
        let v = BoxSpreadCandidate::theoretical_value(Decimal::new(18000, 0), Decimal::new(18100, 0));
        assert_eq!(v, Decimal::new(100, 0));
    }
}
