//! Flow tracking engine
//!
//! Keeps per-flow state for every active conversation with bounded memory:
//! idle flows are swept, the table is size-capped with least-recently-seen
//! eviction, and each flow keeps a capped packet history.
//!
//! # Example
//!
//! ```ignore
//! use flowsight::flow::{FlowConfig, FlowTable};
//!
//! let mut table = FlowTable::new(FlowConfig::default());
//! let key = FlowKey::from_packet(&packet);
//! let flow = table.insert_packet(key, &packet);
//! ```

pub mod table;

pub use table::{FlowTable, TableStats};

use serde::{Deserialize, Serialize};

// Re-export core flow types
pub use crate::core::{Direction, FlowKey, FlowState, PacketRecord};

/// Configuration for flow tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Maximum concurrent flows
    pub max_flows: usize,

    /// Flows not seen for this long are swept (seconds)
    pub idle_timeout_secs: f64,

    /// How often the capture worker sweeps (seconds)
    pub sweep_interval_secs: f64,

    /// Packet history kept per flow
    pub max_records_per_flow: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_flows: 100_000,
            idle_timeout_secs: 120.0,
            sweep_interval_secs: 10.0,
            max_records_per_flow: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FlowConfig::default();
        assert_eq!(config.max_flows, 100_000);
        assert_eq!(config.idle_timeout_secs, 120.0);
        assert_eq!(config.max_records_per_flow, 256);
    }
}
