use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of the consensus service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DbftConfig {
    /// When true, the recovery log is neither written nor read.
    pub ignore_recovery_logs: bool,
    /// Base round duration; the unit of every timer computation.
    pub milliseconds_per_block: u64,
    /// Proposal-delay factor for the fallback primary, applied from view 1
    /// on. Must be at least 1; values above 1 give the priority primary
    /// first chance to propose after a view change.
    pub fallback_timer_multiplier: u32,
    /// Maximum number of transactions referenced by one prepare request.
    pub max_tx_per_block: usize,
    /// Maximum serialized block size in bytes.
    pub max_block_size: usize,
    /// Maximum total system fee of one block.
    pub max_block_system_fee: i64,
}

impl Default for DbftConfig {
    fn default() -> Self {
        Self {
            ignore_recovery_logs: false,
            milliseconds_per_block: 15_000,
            fallback_timer_multiplier: 2,
            max_tx_per_block: 512,
            max_block_size: 262_144,
            max_block_system_fee: 900_000_000_000,
        }
    }
}

impl DbftConfig {
    pub fn block_time(&self) -> Duration {
        Duration::from_millis(self.milliseconds_per_block)
    }

    /// Checks field domains. Returns a description of the first violation.
    pub fn validate(&self) -> Result<(), String> {
        if self.milliseconds_per_block == 0 {
            return Err("milliseconds_per_block must be positive".into());
        }
        if self.fallback_timer_multiplier < 1 {
            return Err("fallback_timer_multiplier must be at least 1".into());
        }
        if self.max_tx_per_block == 0 {
            return Err("max_tx_per_block must be positive".into());
        }
        Ok(())
    }
}
