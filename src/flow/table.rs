//! Flow hash table with idle and size-cap eviction
//!
//! Flows live in an LRU cache: every packet promotes its flow, so a full
//! table evicts the least recently touched flow in O(1).

use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::FlowConfig;
use crate::core::flow::{FlowKey, FlowState};
use crate::core::packet::Packet;

/// Hash table for flow storage
pub struct FlowTable {
    flows: LruCache<FlowKey, FlowState>,
    config: FlowConfig,
    /// Statistics
    pub stats: TableStats,
}

/// Table statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableStats {
    pub inserts: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
}

impl FlowTable {
    /// Create a new flow table
    pub fn new(config: FlowConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_flows).unwrap_or(NonZeroUsize::MIN);
        Self {
            flows: LruCache::new(capacity),
            config,
            stats: TableStats::default(),
        }
    }

    /// Record a packet in its flow, creating the flow if needed
    pub fn insert_packet(&mut self, key: FlowKey, pkt: &Packet) -> &FlowState {
        if self.flows.contains(&key) {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;

            if self.flows.len() >= self.flows.cap().get() {
                self.evict_oldest();
            }

            self.stats.inserts += 1;
            trace!("New flow {}", key);
        }

        let max_records = self.config.max_records_per_flow;
        let state_key = key.clone();
        let flow = self
            .flows
            .get_or_insert_mut(key, || FlowState::new(state_key, pkt, max_records));

        let header_len = pkt.header_len().unwrap_or_default();
        flow.record(pkt, header_len);
        flow
    }

    /// Get a flow by key without touching its recency
    pub fn get(&self, key: &FlowKey) -> Option<&FlowState> {
        self.flows.peek(key)
    }

    /// Get current flow count
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Check if table is empty
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Remove every flow idle for longer than the configured timeout.
    /// Returns the number of flows removed.
    pub fn sweep_idle(&mut self, now: f64) -> usize {
        let timeout = self.config.idle_timeout_secs;
        let stale: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, flow)| now - flow.last_seen > timeout)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            self.flows.pop(key);
        }

        let removed = stale.len();
        self.stats.expired += removed as u64;
        if removed > 0 {
            trace!("Swept {} idle flows, {} active", removed, self.flows.len());
        }
        removed
    }

    /// Evict the least recently touched flow (when table is full)
    fn evict_oldest(&mut self) {
        if let Some((key, _)) = self.flows.pop_lru() {
            trace!("Evicted flow {}", key);
            self.stats.evictions += 1;
        }
    }
}
