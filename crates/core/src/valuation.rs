//! USD valuation of a listed position.

use std::collections::HashMap;
use tracing::warn;

use crate::position::RawPosition;

/// Point-in-time valuation of one position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PnlSnapshot {
    /// Liquidity plus unclaimed fees
    pub current_value_usd: f64,
    /// Liquidity only
    pub lp_value_usd: f64,
    pub fee_value_usd: f64,
    /// Value had the tokens been held instead of provided
    pub hold_value_usd: f64,
    pub impermanent_loss_usd: f64,
    pub impermanent_loss_pct: f64,
    /// None when the pool's active bin is unknown
    pub in_range: Option<bool>,
}

impl PnlSnapshot {
    pub fn profit_usd(&self, start_value_usd: f64) -> f64 {
        self.current_value_usd - start_value_usd
    }

    /// Percent change against the baseline. Zero without a usable baseline.
    pub fn profit_pct(&self, start_value_usd: f64) -> f64 {
        if start_value_usd <= 0.0 {
            return 0.0;
        }
        self.profit_usd(start_value_usd) / start_value_usd * 100.0
    }
}

/// Value a position at the given USD prices.
pub fn value_position(position: &RawPosition, active_bin_id: Option<i32>, price_x: f64, price_y: f64) -> PnlSnapshot {
    let lp_value_usd = position.amount_x * price_x + position.amount_y * price_y;
    let fee_value_usd = position.fee_x * price_x + position.fee_y * price_y;
    let hold_value_usd = (position.amount_x + position.fee_x) * price_x + (position.amount_y + position.fee_y) * price_y;

    let impermanent_loss_usd = hold_value_usd - lp_value_usd;
    let impermanent_loss_pct = if hold_value_usd > 0.0 {
        impermanent_loss_usd / hold_value_usd * 100.0
    } else {
        0.0
    };

    let in_range = active_bin_id.map(|bin| position.lower_bin_id <= bin && bin <= position.upper_bin_id);

    PnlSnapshot {
        current_value_usd: lp_value_usd + fee_value_usd,
        lp_value_usd,
        fee_value_usd,
        hold_value_usd,
        impermanent_loss_usd,
        impermanent_loss_pct,
        in_range,
    }
}

/// Price for a mint, or zero with a warning when the oracle has none.
pub fn price_or_zero(prices: &HashMap<String, f64>, mint: &str) -> f64 {
    match prices.get(mint) {
        Some(price) if price.is_finite() => *price,
        _ => {
            warn!(mint = %mint, "No USD price, valuing at 0");
            0.0
        }
    }
}
