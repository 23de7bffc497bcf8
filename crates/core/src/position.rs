//! Position records and the canonical shape of a listed position.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a position was exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ForceExit,
    TakeProfit,
    TrailingStop,
    StopLoss,
    OutOfRangeTimeout,
}

impl ExitReason {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ForceExit => "force_exit",
            Self::TakeProfit => "take_profit",
            Self::TrailingStop => "trailing_stop",
            Self::StopLoss => "stop_loss",
            Self::OutOfRangeTimeout => "out_of_range_timeout",
        }
    }

    /// Exits that lock in profit rather than cut a loss.
    pub fn is_profitable(&self) -> bool {
        matches!(self, Self::TakeProfit | Self::TrailingStop)
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of a position: Active -> PendingExit -> Closed.
///
/// A removal that exhausts its retries moves PendingExit back to Active.
/// Closed is terminal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PositionState {
    #[default]
    Active,
    PendingExit {
        reason: ExitReason,
        triggered_at: DateTime<Utc>,
    },
    Closed {
        closed_at: DateTime<Utc>,
        #[serde(default)]
        reason: Option<ExitReason>,
    },
}

/// Exit thresholds fixed when the record is created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitPolicy {
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    #[serde(default)]
    pub trailing_offset_pct: Option<f64>,
}

/// Durable record for one liquidity position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub position_id: String,
    pub pool_id: String,
    pub owner_id: String,
    pub base_mint: String,
    pub quote_mint: String,

    /// Valuation at first observation. Never overwritten once set.
    #[serde(default)]
    pub start_value_usd: Option<f64>,
    pub policy: ExitPolicy,
    #[serde(default)]
    pub state: PositionState,

    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,

    /// Highest profit seen since the trailing stop armed
    #[serde(default)]
    pub peak_profit_pct: Option<f64>,
    #[serde(default)]
    pub out_of_range_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub out_of_range_flagged: bool,
    #[serde(default)]
    pub loss_streak: u32,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub remove_failed: bool,
    /// Base balance released by the exit has been converted
    #[serde(default)]
    pub swap_settled: bool,
    #[serde(default)]
    pub last_trigger: Option<ExitReason>,
}

impl PositionRecord {
    pub fn new(
        position_id: impl Into<String>,
        pool_id: impl Into<String>,
        owner_id: impl Into<String>,
        base_mint: impl Into<String>,
        quote_mint: impl Into<String>,
        policy: ExitPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            position_id: position_id.into(),
            pool_id: pool_id.into(),
            owner_id: owner_id.into(),
            base_mint: base_mint.into(),
            quote_mint: quote_mint.into(),
            start_value_usd: None,
            policy,
            state: PositionState::Active,
            created_at: now,
            last_seen_at: now,
            peak_profit_pct: None,
            out_of_range_since: None,
            out_of_range_flagged: false,
            loss_streak: 0,
            cooldown_until: None,
            remove_failed: false,
            swap_settled: false,
            last_trigger: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, PositionState::Closed { .. })
    }

    pub fn is_pending_exit(&self) -> bool {
        matches!(self.state, PositionState::PendingExit { .. })
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            PositionState::Closed { closed_at, .. } => Some(closed_at),
            _ => None,
        }
    }

    /// Set the baseline valuation. Returns false if one already exists.
    pub fn set_baseline(&mut self, value_usd: f64) -> bool {
        if self.start_value_usd.is_some() {
            return false;
        }
        self.start_value_usd = Some(value_usd);
        true
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    /// Removal needs to be (re)driven to completion.
    pub fn needs_removal(&self) -> bool {
        !self.is_closed() && (self.remove_failed || self.is_pending_exit())
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen_at = now;
    }

    pub fn mark_pending(&mut self, reason: ExitReason, now: DateTime<Utc>) {
        if self.is_closed() {
            return;
        }
        self.last_trigger = Some(reason);
        self.state = PositionState::PendingExit {
            reason,
            triggered_at: now,
        };
    }

    /// Close the record. Returns false if it was already closed.
    pub fn mark_closed(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = PositionState::Closed {
            closed_at: now,
            reason: self.last_trigger,
        };
        self.remove_failed = false;
        true
    }

    /// Removal exhausted its budget; back to Active for reconciliation.
    pub fn fail_removal(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = PositionState::Active;
        self.remove_failed = true;
    }
}

/// Token identity and decimals for one side of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub mint: String,
    pub decimals: u8,
}

/// A listed position in UI units.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPosition {
    pub position_id: String,
    pub amount_x: f64,
    pub amount_y: f64,
    pub fee_x: f64,
    pub fee_y: f64,
    pub lower_bin_id: i32,
    pub upper_bin_id: i32,
}

/// An owner's positions in one pool plus the pool's current state.
#[derive(Debug, Clone)]
pub struct PoolPositions {
    pub pool: String,
    pub token_x: TokenInfo,
    pub token_y: TokenInfo,
    pub active_bin_id: Option<i32>,
    pub positions: Vec<RawPosition>,
}

impl PoolPositions {
    pub fn find(&self, position_id: &str) -> Option<&RawPosition> {
        self.positions.iter().find(|p| p.position_id == position_id)
    }
}
