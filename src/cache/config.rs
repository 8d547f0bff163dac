//! Runtime configuration of the memoization tiers.

use std::num::NonZeroUsize;

use serde::Deserialize;

pub(crate) const DEFAULT_MEMORY_BUDGET_BYTES: usize = 50 * 1024 * 1024;
pub(crate) const DEFAULT_MAX_MEMO_RECORDS: usize = 10_000;
const DEFAULT_GLOBAL_SWEEP_INTERVAL: usize = 256;

/// Memoization settings derived from `[cache]` in the settings file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Aggregate estimated byte budget of the per-request tier. `0` disables it.
    pub memory_budget_bytes: usize,
    /// Upper bound on the number of per-request records.
    pub max_memo_records: usize,
    /// Number of global-tier insertions between sweeps of dead handles.
    pub global_sweep_interval: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET_BYTES,
            max_memo_records: DEFAULT_MAX_MEMO_RECORDS,
            global_sweep_interval: DEFAULT_GLOBAL_SWEEP_INTERVAL,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            memory_budget_bytes: settings.memory_budget_bytes,
            max_memo_records: settings.max_memo_records.get(),
            ..Self::default()
        }
    }
}

impl CacheConfig {
    /// A zero budget switches the per-request tier off entirely.
    pub fn is_memo_enabled(&self) -> bool {
        self.memory_budget_bytes > 0
    }

    /// Returns the record limit as NonZeroUsize, clamping to 1 if zero.
    pub fn max_memo_records_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_memo_records).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the sweep interval, never zero.
    pub fn global_sweep_interval_non_zero(&self) -> usize {
        self.global_sweep_interval.max(1)
    }
}
