//! Box-spread pricing: net premium, theoretical value, depth-walking
//! slippage, and transaction fees.
//!
//! The depth-walker mirrors the lockstep ladder-consumption pattern used for
//! cross-venue slippage estimation: consume `min(remaining, level.quantity)`
//! at each level, accumulate `consumed * level.price`, and fall back to a
//! flat worst-case percentage when the ladder can't fully serve the
//! requested quantity.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::models::{BoxSpreadCandidate, DepthLadder};

#[derive(Debug, Clone, Copy)]
pub struct FeeRates {
    pub brokerage_pct: Decimal,
    pub max_brokerage_per_order: Decimal,
    pub stt_pct: Decimal,
    pub exchange_charges_pct: Decimal,
    pub gst_pct: Decimal,
    pub sebi_charges_per_crore: Decimal,
    pub stamp_duty_pct: Decimal,
}

impl Default for FeeRates {
    fn default() -> Self {
        Self {
            brokerage_pct: dec!(0.0003),
            max_brokerage_per_order: dec!(20.0),
            stt_pct: dec!(0.0005),
            exchange_charges_pct: dec!(0.0000053),
            gst_pct: dec!(0.18),
            sebi_charges_per_crore: dec!(10.0),
            stamp_duty_pct: dec!(0.00003),
        }
    }
}

pub fn theoretical_value(lower_strike: Decimal, higher_strike: Decimal) -> Decimal {
    higher_strike - lower_strike
}

/// `-LC_lo.last + SC_hi.last - LP_hi.last + SP_lo.last`. Positive is a net
/// credit on entry.
pub fn net_premium(
    long_call_low_last: Decimal,
    short_call_high_last: Decimal,
    long_put_high_last: Decimal,
    short_put_low_last: Decimal,
) -> Decimal {
    -long_call_low_last + short_call_high_last - long_put_high_last + short_put_low_last
}

/// VWAP-based slippage for walking `ladder` (sell side for a buy leg, buy
/// side for a sell leg) to fill `quantity` units of a leg quoted at `last`.
pub fn leg_slippage(ladder: &DepthLadder, last: Decimal, quantity: Decimal, is_buy: bool, worst_case_pct: Decimal) -> Decimal {
    let mut remaining = quantity;
    let mut cost = Decimal::ZERO;
    for level in &ladder.levels {
        if remaining <= Decimal::ZERO {
            break;
        }
        let level_qty = Decimal::from(level.quantity);
        let consumed = remaining.min(level_qty);
        cost += consumed * level.price;
        remaining -= consumed;
    }

    if remaining > Decimal::ZERO {
        return last * quantity * worst_case_pct;
    }

    let vwap = cost / quantity;
    if is_buy {
        (vwap - last) * quantity
    } else {
        (last - vwap) * quantity
    }
}

pub fn total_slippage(candidate: &BoxSpreadCandidate, quantity: Decimal, worst_case_pct: Decimal) -> Decimal {
    leg_slippage(
        &candidate.long_call_low.sell_depth,
        candidate.long_call_low.last,
        quantity,
        true,
        worst_case_pct,
    ) + leg_slippage(
        &candidate.short_call_high.buy_depth,
        candidate.short_call_high.last,
        quantity,
        false,
        worst_case_pct,
    ) + leg_slippage(
        &candidate.long_put_high.sell_depth,
        candidate.long_put_high.last,
        quantity,
        true,
        worst_case_pct,
    ) + leg_slippage(
        &candidate.short_put_low.buy_depth,
        candidate.short_put_low.last,
        quantity,
        false,
        worst_case_pct,
    )
}

pub fn calculate_fees(candidate: &BoxSpreadCandidate, quantity: Decimal, rates: &FeeRates) -> Decimal {
    let turnover = (candidate.long_call_low.last
        + candidate.short_call_high.last
        + candidate.long_put_high.last
        + candidate.short_put_low.last)
        * quantity;

    let brokerage = (turnover * rates.brokerage_pct).min(Decimal::from(4) * rates.max_brokerage_per_order);
    let stt = (candidate.short_call_high.last + candidate.short_put_low.last) * quantity * rates.stt_pct;
    let exchange_charges = turnover * rates.exchange_charges_pct;
    let gst = (brokerage + exchange_charges) * rates.gst_pct;
    let sebi = turnover * rates.sebi_charges_per_crore / dec!(10_000_000);
    let stamp = (candidate.long_call_low.last + candidate.long_put_high.last) * quantity * rates.stamp_duty_pct;

    brokerage + stt + exchange_charges + gst + sebi + stamp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DepthLevel, Instrument, InstrumentKind, OptionKind};
    use std::sync::Arc;

    fn leg(last: Decimal, buy: Vec<(i64, u64)>, sell: Vec<(i64, u64)>) -> Instrument {
        Instrument {
            token: 1,
            trading_symbol: "X".into(),
            exchange: "NFO".into(),
            name: "X".into(),
            segment: "NFO-OPT".into(),
            kind: InstrumentKind::Option,
            underlying: "NIFTY".into(),
            strike: Decimal::ZERO,
            option_kind: OptionKind::Call,
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
            buy_depth: DepthLadder {
                levels: buy
                    .into_iter()
                    .map(|(p, q)| DepthLevel { price: Decimal::new(p, 0), quantity: q, orders: 1 })
                    .collect(),
            },
            sell_depth: DepthLadder {
                levels: sell
                    .into_iter()
                    .map(|(p, q)| DepthLevel { price: Decimal::new(p, 0), quantity: q, orders: 1 })
                    .collect(),
            },
        }
    }

    fn candidate_with_legs(
        lc: Instrument,
        sc: Instrument,
        lp: Instrument,
        sp: Instrument,
        lower: Decimal,
        higher: Decimal,
    ) -> BoxSpreadCandidate {
        BoxSpreadCandidate {
            id: "test".into(),
            underlying: "NIFTY".into(),
            exchange: "NFO".into(),
            lower_strike: lower,
            higher_strike: higher,
            expiry: chrono::Utc::now(),
            long_call_low: Arc::new(lc),
            short_call_high: Arc::new(sc),
            long_put_high: Arc::new(lp),
            short_put_low: Arc::new(sp),
            net_premium: Decimal::ZERO,
            theoretical_value: higher - lower,
            slippage: Decimal::ZERO,
            fees: Decimal::ZERO,
            margin_required: Decimal::ZERO,
            roi_pct: Decimal::ZERO,
            profitability_score: Decimal::ZERO,
            max_loss: Decimal::ZERO,
            max_profit: Decimal::ZERO,
            executed: false,
        }
    }

    #[test]
    fn theoretical_value_equals_spread() {
        assert_eq!(theoretical_value(dec!(18000), dec!(18100)), dec!(100));
    }

    #[test]
    fn net_premium_matches_scenario_one() {
        let premium = net_premium(dec!(30), dec!(50), dec!(90), dec!(40));
        assert_eq!(premium, dec!(-30));
    }

    #[test]
    fn depth_exhaustion_uses_worst_case_percent() {
        // LC_lo.sellDepth totals 3 units; q=10; last=30; worst_case=5% -> 15
        let ladder = DepthLadder {
            levels: vec![DepthLevel { price: dec!(31), quantity: 3, orders: 1 }],
        };
        let slip = leg_slippage(&ladder, dec!(30), dec!(10), true, dec!(0.05));
        assert_eq!(slip, dec!(15));
    }

    #[test]
    fn full_fill_uses_vwap() {
        let ladder = DepthLadder {
            levels: vec![
                DepthLevel { price: dec!(30), quantity: 5, orders: 1 },
                DepthLevel { price: dec!(32), quantity: 5, orders: 1 },
            ],
        };
        // vwap = (30*5 + 32*5)/10 = 31
        let slip = leg_slippage(&ladder, dec!(30), dec!(10), true, dec!(0.05));
        assert_eq!(slip, dec!(10));
    }

    #[test]
    fn total_slippage_sums_four_legs() {
        let lc = leg(dec!(30), vec![], vec![(31, 10)]);
        let sc = leg(dec!(50), vec![(49, 10)], vec![]);
        let lp = leg(dec!(90), vec![], vec![(91, 10)]);
        let sp = leg(dec!(40), vec![(39, 10)], vec![]);
        let candidate = candidate_with_legs(lc, sc, lp, sp, dec!(18000), dec!(18100));
        let slip = total_slippage(&candidate, dec!(10), dec!(0.05));
        assert!(slip > Decimal::ZERO);
    }
}
