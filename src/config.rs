/// Runtime configuration for the gate.
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for a [`FactGate`](crate::gate::FactGate) instance.
///
/// The defaults match production behavior: hourly sweeps in batches of 1000,
/// a one-minute policy cache, and a one-second bound on how long a write may
/// wait for a contended key before surfacing a conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// How often the background sweeper scans for expired facts
    pub sweep_interval: Duration,
    /// Maximum facts deactivated per sweep pass
    pub sweep_batch_limit: usize,
    /// How long a resolved tenant policy may be served from cache
    pub policy_cache_staleness: Duration,
    /// How long an upsert may wait on a contended key lock before it
    /// surfaces a retryable conflict
    pub upsert_lock_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(3600),
            sweep_batch_limit: 1000,
            policy_cache_staleness: Duration::from_secs(60),
            upsert_lock_timeout: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GateConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(3600));
        assert_eq!(config.sweep_batch_limit, 1000);
        assert_eq!(config.policy_cache_staleness, Duration::from_secs(60));
        assert_eq!(config.upsert_lock_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_serde_round_trip() {
        let config = GateConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: GateConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.sweep_batch_limit, config.sweep_batch_limit);
        assert_eq!(parsed.sweep_interval, config.sweep_interval);
    }
}
