//! Engine configuration.

mod engine;

pub use engine::{
    EngineConfig, ExecutorConfig, ExitConfig, ReconcileConfig, ScheduleConfig, StoreConfig,
    SwapRetryConfig,
};
