//! Exit trigger evaluation.
//!
//! Each cycle the evaluator looks at a record and its fresh valuation and
//! decides whether the position must exit. At most one reason fires, by
//! priority: force exit, take profit, trailing stop, stop loss, out of range.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::config::ExitConfig;
use crate::position::{ExitReason, PositionRecord};
use crate::valuation::PnlSnapshot;

/// Evaluator settings shared by every position.
///
/// Per-position thresholds live on the record's `ExitPolicy`.
#[derive(Debug, Clone, Copy)]
pub struct TriggerConfig {
    pub min_change_pct: f64,
    pub out_of_range_timeout: Duration,
    pub take_profit_cooldown: Duration,
    pub stop_loss_cooldown: Duration,
}

impl From<&ExitConfig> for TriggerConfig {
    fn from(cfg: &ExitConfig) -> Self {
        Self {
            min_change_pct: cfg.min_change_pct,
            out_of_range_timeout: cfg.out_of_range_timeout(),
            take_profit_cooldown: cfg.take_profit_cooldown(),
            stop_loss_cooldown: cfg.stop_loss_cooldown(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self::from(&ExitConfig::default())
    }
}

/// A fired exit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerEvent {
    pub reason: ExitReason,
    pub profit_pct: f64,
    pub triggered_at: DateTime<Utc>,
    /// Set for exits that lock the base asset
    pub cooldown_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct TriggerEvaluator {
    config: TriggerConfig,
}

impl TriggerEvaluator {
    pub fn new(config: TriggerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    /// Evaluate one record against its current valuation.
    ///
    /// Updates the range timer and trailing peak in place. When an exit
    /// fires the record moves to PendingExit and the side effects (loss
    /// streak, cooldown, range flag) are applied before returning.
    pub fn evaluate(
        &self,
        record: &mut PositionRecord,
        snapshot: &PnlSnapshot,
        forced: bool,
        now: DateTime<Utc>,
    ) -> Option<TriggerEvent> {
        if record.is_closed() || record.is_pending_exit() {
            return None;
        }

        let baseline = record.start_value_usd.unwrap_or(snapshot.current_value_usd);
        let profit_pct = snapshot.profit_pct(baseline);
        let significant = profit_pct.abs() >= self.config.min_change_pct;
        let policy = record.policy;

        let out_of_range_expired = self.track_range(record, snapshot.in_range, now);

        let trailing_hit = match policy.trailing_offset_pct {
            Some(offset) => {
                if profit_pct >= policy.take_profit_pct || record.peak_profit_pct.is_some() {
                    let peak = record.peak_profit_pct.map_or(profit_pct, |p| p.max(profit_pct));
                    if record.peak_profit_pct.is_none() {
                        debug!(position = %record.position_id, peak, "Trailing stop armed");
                    }
                    record.peak_profit_pct = Some(peak);
                }
                record.peak_profit_pct.is_some_and(|peak| profit_pct <= peak - offset)
            }
            None => false,
        };

        let take_profit_hit =
            policy.trailing_offset_pct.is_none() && profit_pct >= policy.take_profit_pct && significant;
        let stop_loss_hit = profit_pct <= policy.stop_loss_pct && profit_pct < 0.0 && significant;

        let reason = if forced {
            ExitReason::ForceExit
        } else if take_profit_hit {
            ExitReason::TakeProfit
        } else if trailing_hit {
            ExitReason::TrailingStop
        } else if stop_loss_hit {
            ExitReason::StopLoss
        } else if out_of_range_expired {
            ExitReason::OutOfRangeTimeout
        } else {
            return None;
        };

        let cooldown_until = match reason {
            ExitReason::StopLoss => {
                record.loss_streak += 1;
                Some(now + self.config.stop_loss_cooldown)
            }
            ExitReason::TakeProfit | ExitReason::TrailingStop => {
                record.loss_streak = 0;
                Some(now + self.config.take_profit_cooldown)
            }
            ExitReason::OutOfRangeTimeout => {
                record.out_of_range_flagged = true;
                None
            }
            ExitReason::ForceExit => None,
        };
        if cooldown_until.is_some() {
            record.cooldown_until = cooldown_until;
        }
        record.mark_pending(reason, now);

        info!(
            position = %record.position_id,
            reason = %reason,
            profit_pct = format!("{:.2}", profit_pct),
            peak = ?record.peak_profit_pct,
            loss_streak = record.loss_streak,
            "Exit triggered"
        );

        Some(TriggerEvent {
            reason,
            profit_pct,
            triggered_at: now,
            cooldown_until,
        })
    }

    /// Update the out-of-range timer. Returns true when the timeout elapsed
    /// and has not fired yet. An unknown range leaves the timer as it is.
    fn track_range(&self, record: &mut PositionRecord, in_range: Option<bool>, now: DateTime<Utc>) -> bool {
        match in_range {
            None => return false,
            Some(true) => {
                record.out_of_range_since = None;
                record.out_of_range_flagged = false;
                return false;
            }
            Some(false) => {}
        }
        let since = *record.out_of_range_since.get_or_insert(now);
        !record.out_of_range_flagged && now - since > self.config.out_of_range_timeout
    }
}
