//! Margin estimation, ROI, and the profitability score used for ranking.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[derive(Debug, Clone, Copy)]
pub struct RiskParams {
    pub margin_buffer_pct: Decimal,
    pub exposure_margin_pct: Decimal,
    pub capital_safety_factor: Decimal,
    pub min_roi_pct: Decimal,
    pub max_loss_pct: Decimal,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            margin_buffer_pct: dec!(25),
            exposure_margin_pct: dec!(3),
            capital_safety_factor: dec!(0.9),
            min_roi_pct: Decimal::ZERO,
            max_loss_pct: dec!(100),
        }
    }
}

pub fn max_loss(net_premium: Decimal, fees: Decimal, slippage: Decimal, quantity: Decimal) -> Decimal {
    if net_premium < Decimal::ZERO {
        (-net_premium) * quantity
    } else {
        (fees + slippage) * quantity
    }
}

pub fn span_margin(max_loss: Decimal, params: &RiskParams) -> Decimal {
    max_loss * (Decimal::ONE + params.margin_buffer_pct / dec!(100))
}

pub fn exposure_margin(turnover: Decimal, params: &RiskParams) -> Decimal {
    turnover * params.exposure_margin_pct / dec!(100)
}

pub fn margin_required(max_loss: Decimal, turnover: Decimal, params: &RiskParams) -> Decimal {
    span_margin(max_loss, params) + exposure_margin(turnover, params)
}

pub fn roi_pct(adjusted_pl: Decimal, margin_required: Decimal) -> Decimal {
    if margin_required > Decimal::ZERO {
        adjusted_pl / margin_required * dec!(100)
    } else {
        Decimal::ZERO
    }
}

/// `ROI * ln(1 + |adjusted_pl|)`. The logarithm is computed in `f64` since
/// `Decimal` has no transcendental functions; used only for ranking, never
/// for money.
pub fn profitability_score(roi_pct: Decimal, adjusted_pl: Decimal) -> Decimal {
    let abs_pl = adjusted_pl.abs().to_f64().unwrap_or(0.0);
    let ln_term = (1.0 + abs_pl).ln();
    let roi = roi_pct.to_f64().unwrap_or(0.0);
    Decimal::from_f64_retain(roi * ln_term).unwrap_or(Decimal::ZERO)
}

pub fn max_quantity(capital: Decimal, margin_for_one_unit: Decimal, params: &RiskParams) -> u64 {
    if margin_for_one_unit <= Decimal::ZERO {
        return 1;
    }
    let raw = (capital / margin_for_one_unit * params.capital_safety_factor)
        .floor()
        .to_u64()
        .unwrap_or(1);
    raw.max(1)
}

pub fn meets_risk(roi_pct: Decimal, max_loss: Decimal, capital: Decimal, params: &RiskParams) -> bool {
    if roi_pct < params.min_roi_pct {
        return false;
    }
    if capital <= Decimal::ZERO {
        return true;
    }
    let loss_pct = max_loss / capital * dec!(100);
    loss_pct <= params.max_loss_pct
}
