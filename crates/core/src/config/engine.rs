//! Engine configuration with profile support.
//!
//! One `EngineConfig` value is loaded at startup and handed to every
//! component that needs it. Exit thresholds are copied onto each position
//! record when it is first seen, so changing them later never rewrites the
//! policy of a position that is already tracked.

use chrono::Duration as ChronoDuration;
use lpexit_chain::{PriorityLevel, WSOL_MINT};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::position::ExitPolicy;

/// Main configuration structure containing all engine parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    /// DLMM pools to monitor
    #[serde(default)]
    pub pools: Vec<String>,

    /// Exit thresholds and cooldowns
    #[serde(default)]
    pub exit: ExitConfig,

    /// Exit executor budgets and timing
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Periodic task timing
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Reconciliation job
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Swap retry sweep
    #[serde(default)]
    pub swap_retry: SwapRetryConfig,

    /// Durable state location
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// Exit thresholds applied to newly tracked positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitConfig {
    /// Take profit threshold (percent, positive)
    #[serde(default = "default_take_profit")]
    pub take_profit_pct: f64,

    /// Stop loss threshold (percent, negative)
    #[serde(default = "default_stop_loss")]
    pub stop_loss_pct: f64,

    /// Trailing stop offset (percent). Disabled when absent.
    #[serde(default)]
    pub trailing_offset_pct: Option<f64>,

    /// PnL moves smaller than this never trigger
    #[serde(default = "default_min_change")]
    pub min_change_pct: f64,

    /// Continuous out-of-range time before forcing an exit (seconds)
    #[serde(default = "default_out_of_range_timeout")]
    pub out_of_range_timeout_secs: u64,

    /// Re-entry lock on the base asset after a profitable exit (seconds)
    #[serde(default = "default_take_profit_cooldown")]
    pub take_profit_cooldown_secs: u64,

    /// Re-entry lock on the base asset after a stop loss (seconds)
    #[serde(default = "default_stop_loss_cooldown")]
    pub stop_loss_cooldown_secs: u64,
}

fn default_take_profit() -> f64 {
    10.0
}
fn default_stop_loss() -> f64 {
    -5.0
}
fn default_min_change() -> f64 {
    0.01
}
fn default_out_of_range_timeout() -> u64 {
    5 * 60
}
fn default_take_profit_cooldown() -> u64 {
    6 * 60 * 60
}
fn default_stop_loss_cooldown() -> u64 {
    24 * 60 * 60
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            take_profit_pct: default_take_profit(),
            stop_loss_pct: default_stop_loss(),
            trailing_offset_pct: None,
            min_change_pct: default_min_change(),
            out_of_range_timeout_secs: default_out_of_range_timeout(),
            take_profit_cooldown_secs: default_take_profit_cooldown(),
            stop_loss_cooldown_secs: default_stop_loss_cooldown(),
        }
    }
}

impl ExitConfig {
    /// Policy stamped onto a new position record.
    pub fn policy(&self) -> ExitPolicy {
        ExitPolicy {
            take_profit_pct: self.take_profit_pct,
            stop_loss_pct: self.stop_loss_pct,
            trailing_offset_pct: self.trailing_offset_pct,
        }
    }

    pub fn out_of_range_timeout(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.out_of_range_timeout_secs as i64)
    }
    pub fn take_profit_cooldown(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.take_profit_cooldown_secs as i64)
    }
    pub fn stop_loss_cooldown(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.stop_loss_cooldown_secs as i64)
    }
}

/// Exit executor budgets and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Removal attempts when triggered by the monitor
    #[serde(default = "default_remove_attempts")]
    pub remove_attempts: u32,

    /// Removal attempts when retried by reconciliation
    #[serde(default = "default_reconcile_remove_attempts")]
    pub reconcile_remove_attempts: u32,

    /// Delay between removal attempts (milliseconds)
    #[serde(default = "default_remove_retry_delay")]
    pub remove_retry_delay_ms: u64,

    /// Pause after a confirmed removal before reading balances (milliseconds)
    #[serde(default = "default_post_remove_delay")]
    pub post_remove_delay_ms: u64,

    /// Balance polls while waiting for released tokens
    #[serde(default = "default_settle_polls")]
    pub settle_polls: u32,

    /// Interval between settlement polls (milliseconds)
    #[serde(default = "default_settle_poll_interval")]
    pub settle_poll_interval_ms: u64,

    /// Minimum base balance (raw units) worth swapping
    #[serde(default = "default_min_swap_amount")]
    pub min_swap_amount: u64,

    /// Swap attempts
    #[serde(default = "default_swap_attempts")]
    pub swap_attempts: u32,

    /// Delay between swap attempts (milliseconds)
    #[serde(default = "default_swap_retry_delay")]
    pub swap_retry_delay_ms: u64,

    /// Wrapped SOL balance polls before unwrapping
    #[serde(default = "default_unwrap_polls")]
    pub unwrap_polls: u32,

    /// Interval between wrapped SOL polls (milliseconds)
    #[serde(default = "default_unwrap_poll_interval")]
    pub unwrap_poll_interval_ms: u64,

    /// Pause once wrapped SOL is visible, before unwrapping (milliseconds)
    #[serde(default = "default_unwrap_delay")]
    pub unwrap_delay_ms: u64,

    /// Unwrap attempts
    #[serde(default = "default_unwrap_attempts")]
    pub unwrap_attempts: u32,

    /// Delay between unwrap attempts (milliseconds)
    #[serde(default = "default_unwrap_retry_delay")]
    pub unwrap_retry_delay_ms: u64,

    /// Asset every exit is converted into
    #[serde(default = "default_quote_mint")]
    pub quote_mint: String,

    /// Priority fee level for exit transactions
    #[serde(default = "default_exit_priority")]
    pub priority: PriorityLevel,
}

fn default_remove_attempts() -> u32 {
    5
}
fn default_reconcile_remove_attempts() -> u32 {
    3
}
fn default_remove_retry_delay() -> u64 {
    1000
}
fn default_post_remove_delay() -> u64 {
    1000
}
fn default_settle_polls() -> u32 {
    10
}
fn default_settle_poll_interval() -> u64 {
    2000
}
fn default_min_swap_amount() -> u64 {
    1000
}
fn default_swap_attempts() -> u32 {
    3
}
fn default_swap_retry_delay() -> u64 {
    2000
}
fn default_unwrap_polls() -> u32 {
    10
}
fn default_unwrap_poll_interval() -> u64 {
    2000
}
fn default_unwrap_delay() -> u64 {
    5000
}
fn default_unwrap_attempts() -> u32 {
    3
}
fn default_unwrap_retry_delay() -> u64 {
    3000
}
fn default_quote_mint() -> String {
    WSOL_MINT.to_string()
}
fn default_exit_priority() -> PriorityLevel {
    PriorityLevel::Ultra
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            remove_attempts: default_remove_attempts(),
            reconcile_remove_attempts: default_reconcile_remove_attempts(),
            remove_retry_delay_ms: default_remove_retry_delay(),
            post_remove_delay_ms: default_post_remove_delay(),
            settle_polls: default_settle_polls(),
            settle_poll_interval_ms: default_settle_poll_interval(),
            min_swap_amount: default_min_swap_amount(),
            swap_attempts: default_swap_attempts(),
            swap_retry_delay_ms: default_swap_retry_delay(),
            unwrap_polls: default_unwrap_polls(),
            unwrap_poll_interval_ms: default_unwrap_poll_interval(),
            unwrap_delay_ms: default_unwrap_delay(),
            unwrap_attempts: default_unwrap_attempts(),
            unwrap_retry_delay_ms: default_unwrap_retry_delay(),
            quote_mint: default_quote_mint(),
            priority: default_exit_priority(),
        }
    }
}

impl ExecutorConfig {
    pub fn remove_retry_delay(&self) -> Duration {
        Duration::from_millis(self.remove_retry_delay_ms)
    }
    pub fn post_remove_delay(&self) -> Duration {
        Duration::from_millis(self.post_remove_delay_ms)
    }
    pub fn settle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.settle_poll_interval_ms)
    }
    pub fn swap_retry_delay(&self) -> Duration {
        Duration::from_millis(self.swap_retry_delay_ms)
    }
    pub fn unwrap_poll_interval(&self) -> Duration {
        Duration::from_millis(self.unwrap_poll_interval_ms)
    }
    pub fn unwrap_delay(&self) -> Duration {
        Duration::from_millis(self.unwrap_delay_ms)
    }
    pub fn unwrap_retry_delay(&self) -> Duration {
        Duration::from_millis(self.unwrap_retry_delay_ms)
    }

    /// Whether converted proceeds need unwrapping to native SOL.
    pub fn quote_is_wrapped_sol(&self) -> bool {
        self.quote_mint == WSOL_MINT
    }
}

/// Periodic task timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Monitor cycle interval (seconds)
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// Reconciliation interval (seconds)
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Swap retry sweep interval (seconds)
    #[serde(default = "default_swap_retry_interval")]
    pub swap_retry_interval_secs: u64,

    /// Wrapped SOL sweep interval (seconds)
    #[serde(default = "default_unwrap_sweep_interval")]
    pub unwrap_sweep_interval_secs: u64,

    /// Position listing attempts per pool and cycle
    #[serde(default = "default_position_poll_attempts")]
    pub position_poll_attempts: u32,

    /// Interval between empty listings (milliseconds)
    #[serde(default = "default_position_poll_interval")]
    pub position_poll_interval_ms: u64,
}

fn default_monitor_interval() -> u64 {
    10
}
fn default_reconcile_interval() -> u64 {
    5 * 60
}
fn default_swap_retry_interval() -> u64 {
    3 * 60
}
fn default_unwrap_sweep_interval() -> u64 {
    60
}
fn default_position_poll_attempts() -> u32 {
    10
}
fn default_position_poll_interval() -> u64 {
    2000
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval(),
            reconcile_interval_secs: default_reconcile_interval(),
            swap_retry_interval_secs: default_swap_retry_interval(),
            unwrap_sweep_interval_secs: default_unwrap_sweep_interval(),
            position_poll_attempts: default_position_poll_attempts(),
            position_poll_interval_ms: default_position_poll_interval(),
        }
    }
}

impl ScheduleConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
    pub fn swap_retry_interval(&self) -> Duration {
        Duration::from_secs(self.swap_retry_interval_secs)
    }
    pub fn unwrap_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.unwrap_sweep_interval_secs)
    }
    pub fn position_poll_interval(&self) -> Duration {
        Duration::from_millis(self.position_poll_interval_ms)
    }
}

/// Reconciliation job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Closed records older than this are dropped (seconds)
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Minimum leftover base balance (raw units) worth swapping
    #[serde(default = "default_reconcile_min_balance")]
    pub min_balance: u64,

    /// Balance polls per closed record
    #[serde(default = "default_reconcile_balance_polls")]
    pub balance_polls: u32,

    /// Interval between balance polls (milliseconds)
    #[serde(default = "default_reconcile_poll_interval")]
    pub balance_poll_interval_ms: u64,
}

fn default_retention() -> u64 {
    24 * 60 * 60
}
fn default_reconcile_min_balance() -> u64 {
    10_000
}
fn default_reconcile_balance_polls() -> u32 {
    10
}
fn default_reconcile_poll_interval() -> u64 {
    1500
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
            min_balance: default_reconcile_min_balance(),
            balance_polls: default_reconcile_balance_polls(),
            balance_poll_interval_ms: default_reconcile_poll_interval(),
        }
    }
}

impl ReconcileConfig {
    pub fn retention(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.retention_secs as i64)
    }
    pub fn balance_poll_interval(&self) -> Duration {
        Duration::from_millis(self.balance_poll_interval_ms)
    }
}

/// Swap retry sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRetryConfig {
    /// Balance below which an entry only accrues a retry (raw units)
    #[serde(default = "default_retry_min_balance")]
    pub min_balance: u64,

    /// Low-balance sweeps before an entry is evicted
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Swap attempts per sweep
    #[serde(default = "default_retry_swap_attempts")]
    pub swap_attempts: u32,

    /// Delay between swap attempts (milliseconds)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_retry_min_balance() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_swap_attempts() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    2000
}

impl Default for SwapRetryConfig {
    fn default() -> Self {
        Self {
            min_balance: default_retry_min_balance(),
            max_retries: default_max_retries(),
            swap_attempts: default_retry_swap_attempts(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl SwapRetryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Durable state location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            pools: Vec::new(),
            exit: ExitConfig::default(),
            executor: ExecutorConfig::default(),
            schedule: ScheduleConfig::default(),
            reconcile: ReconcileConfig::default(),
            swap_retry: SwapRetryConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Tighter exits, trailing stop enabled.
    pub fn conservative() -> Self {
        Self {
            profile: "conservative".to_string(),
            exit: ExitConfig {
                take_profit_pct: 5.0,
                stop_loss_pct: -3.0,
                trailing_offset_pct: Some(1.5),
                out_of_range_timeout_secs: 3 * 60,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Wider exits and a faster monitor.
    pub fn aggressive() -> Self {
        Self {
            profile: "aggressive".to_string(),
            exit: ExitConfig {
                take_profit_pct: 20.0,
                stop_loss_pct: -10.0,
                trailing_offset_pct: Some(4.0),
                out_of_range_timeout_secs: 15 * 60,
                ..Default::default()
            },
            schedule: ScheduleConfig {
                monitor_interval_secs: 5,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// No waiting anywhere. Used by tests.
    pub fn testing() -> Self {
        Self {
            profile: "testing".to_string(),
            executor: ExecutorConfig {
                remove_retry_delay_ms: 0,
                post_remove_delay_ms: 0,
                settle_poll_interval_ms: 0,
                swap_retry_delay_ms: 0,
                unwrap_poll_interval_ms: 0,
                unwrap_delay_ms: 0,
                unwrap_retry_delay_ms: 0,
                ..Default::default()
            },
            schedule: ScheduleConfig {
                position_poll_interval_ms: 0,
                ..Default::default()
            },
            reconcile: ReconcileConfig {
                balance_poll_interval_ms: 0,
                ..Default::default()
            },
            swap_retry: SwapRetryConfig {
                retry_delay_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Resolve configuration from the environment.
    ///
    /// `ENGINE_CONFIG` points at a TOML file; otherwise `ENGINE_PROFILE`
    /// selects a built-in profile (default, conservative, aggressive).
    /// `POOLS` (comma separated) overrides the pool list either way.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = match std::env::var("ENGINE_CONFIG") {
            Ok(path) => Self::from_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load {}: {}", path, e))?,
            Err(_) => {
                let profile = std::env::var("ENGINE_PROFILE").unwrap_or_else(|_| "default".to_string());
                Self::from_profile(&profile)
            }
        };

        if let Ok(pools) = std::env::var("POOLS") {
            config.pools = parse_pool_list(&pools);
        }
        if let Ok(dir) = std::env::var("DATA_DIR") {
            config.store.data_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    /// Built-in profile by name; unknown names fall back to default.
    pub fn from_profile(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "conservative" | "safe" => Self::conservative(),
            "aggressive" | "aggro" => Self::aggressive(),
            "testing" | "test" => Self::testing(),
            _ => Self::default(),
        }
    }

    /// Reject configurations that would make exits misbehave.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.exit.take_profit_pct <= 0.0 {
            anyhow::bail!("take_profit_pct must be positive, got {}", self.exit.take_profit_pct);
        }
        if self.exit.stop_loss_pct >= 0.0 {
            anyhow::bail!("stop_loss_pct must be negative, got {}", self.exit.stop_loss_pct);
        }
        if let Some(offset) = self.exit.trailing_offset_pct {
            if offset <= 0.0 {
                anyhow::bail!("trailing_offset_pct must be positive, got {}", offset);
            }
        }
        if self.executor.remove_attempts == 0 || self.executor.reconcile_remove_attempts == 0 {
            anyhow::bail!("removal attempts must be at least 1");
        }
        if self.executor.swap_attempts == 0 || self.swap_retry.swap_attempts == 0 {
            anyhow::bail!("swap attempts must be at least 1");
        }
        if self.pools.is_empty() {
            anyhow::bail!("no pools configured");
        }
        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, pools = self.pools.len(), "Engine configuration loaded");
        tracing::info!(
            take_profit = self.exit.take_profit_pct,
            stop_loss = self.exit.stop_loss_pct,
            trailing = ?self.exit.trailing_offset_pct,
            oor_timeout_secs = self.exit.out_of_range_timeout_secs,
            "Exit thresholds"
        );
        tracing::info!(
            remove_attempts = self.executor.remove_attempts,
            swap_attempts = self.executor.swap_attempts,
            min_swap = self.executor.min_swap_amount,
            priority = %self.executor.priority,
            quote = %self.executor.quote_mint,
            "Executor parameters"
        );
        tracing::info!(
            monitor_secs = self.schedule.monitor_interval_secs,
            reconcile_secs = self.schedule.reconcile_interval_secs,
            swap_retry_secs = self.schedule.swap_retry_interval_secs,
            unwrap_secs = self.schedule.unwrap_sweep_interval_secs,
            "Schedule"
        );
        tracing::info!(data_dir = %self.store.data_dir.display(), "State store");
    }
}

fn parse_pool_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
