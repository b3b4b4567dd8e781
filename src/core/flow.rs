//! Bidirectional flow state
//!
//! A flow accumulates running per-direction aggregates so feature extraction
//! stays O(1) per packet, plus a bounded history of recent packet records.

use std::collections::VecDeque;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::packet::{Direction, IpProtocol, Packet};

/// Unique key identifying a flow (5-tuple normalized)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub ip_a: IpAddr,
    pub ip_b: IpAddr,
    pub port_a: u16,
    pub port_b: u16,
    pub protocol: IpProtocol,
}

impl FlowKey {
    /// Create from packet (normalized so the smaller endpoint is always first)
    pub fn from_packet(pkt: &Packet) -> Self {
        if pkt.src() <= pkt.dst() {
            Self {
                ip_a: pkt.src_ip,
                ip_b: pkt.dst_ip,
                port_a: pkt.src_port,
                port_b: pkt.dst_port,
                protocol: pkt.protocol,
            }
        } else {
            Self {
                ip_a: pkt.dst_ip,
                ip_b: pkt.src_ip,
                port_a: pkt.dst_port,
                port_b: pkt.src_port,
                protocol: pkt.protocol,
            }
        }
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}-{}",
            self.ip_a, self.port_a, self.ip_b, self.port_b, self.protocol
        )
    }
}

/// One observed packet of a flow
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacketRecord {
    pub size: u32,
    pub timestamp: f64,
    pub direction: Direction,
    pub header_len: u32,
}

/// Running aggregates for one direction (or the whole flow)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectionStats {
    pub packets: u64,
    pub bytes: u64,
    pub size_min: u32,
    pub size_max: u32,
    pub header_bytes: u64,
    /// Packets that carried transport payload
    pub payload_packets: u64,
    pub last_timestamp: Option<f64>,
    pub iat_count: u64,
    pub iat_min: f64,
    pub iat_max: f64,
    pub iat_total: f64,
}

impl DirectionStats {
    fn record(&mut self, record: &PacketRecord, payload_len: u32) {
        if self.packets == 0 {
            self.size_min = record.size;
            self.size_max = record.size;
        } else {
            self.size_min = self.size_min.min(record.size);
            self.size_max = self.size_max.max(record.size);
        }
        self.packets += 1;
        self.bytes += record.size as u64;
        self.header_bytes += record.header_len as u64;
        if payload_len > 0 {
            self.payload_packets += 1;
        }

        if let Some(last) = self.last_timestamp {
            // Out-of-order timestamps count as simultaneous
            let iat = (record.timestamp - last).max(0.0);
            if self.iat_count == 0 {
                self.iat_min = iat;
                self.iat_max = iat;
            } else {
                self.iat_min = self.iat_min.min(iat);
                self.iat_max = self.iat_max.max(iat);
            }
            self.iat_count += 1;
            self.iat_total += iat;
        }
        self.last_timestamp = Some(record.timestamp);
    }

    /// Mean packet size, 0 when empty
    pub fn size_mean(&self) -> f64 {
        if self.packets == 0 {
            0.0
        } else {
            self.bytes as f64 / self.packets as f64
        }
    }
}

/// Per-flow state owned by the flow table
#[derive(Debug, Clone)]
pub struct FlowState {
    pub key: FlowKey,
    /// Source endpoint of the first packet seen
    pub initiator: (IpAddr, u16),
    pub start_time: f64,
    pub last_seen: f64,
    /// Window of the first packet of the flow
    pub init_fwd_window: Option<u16>,
    /// Window of the first backward packet
    pub init_bwd_window: Option<u16>,
    pub forward: DirectionStats,
    pub backward: DirectionStats,
    pub total: DirectionStats,
    history: VecDeque<PacketRecord>,
    max_history: usize,
}

impl FlowState {
    /// Create the state for a flow opened by `pkt`. The packet is not recorded.
    pub fn new(key: FlowKey, pkt: &Packet, max_history: usize) -> Self {
        Self {
            key,
            initiator: pkt.src(),
            start_time: pkt.timestamp,
            last_seen: pkt.timestamp,
            init_fwd_window: pkt.window,
            init_bwd_window: None,
            forward: DirectionStats::default(),
            backward: DirectionStats::default(),
            total: DirectionStats::default(),
            history: VecDeque::with_capacity(max_history.min(64)),
            max_history: max_history.max(1),
        }
    }

    /// Classify a packet against the stored initiator
    pub fn direction_of(&self, pkt: &Packet) -> Direction {
        if pkt.src() == self.initiator {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }

    /// Append a packet to the flow and update every aggregate
    pub fn record(&mut self, pkt: &Packet, header_len: u32) -> PacketRecord {
        let direction = self.direction_of(pkt);
        let record = PacketRecord {
            size: pkt.raw_len,
            timestamp: pkt.timestamp,
            direction,
            header_len,
        };

        match direction {
            Direction::Forward => self.forward.record(&record, pkt.payload_len),
            Direction::Backward => {
                if self.backward.packets == 0 {
                    self.init_bwd_window = pkt.window;
                }
                self.backward.record(&record, pkt.payload_len);
            }
        }
        self.total.record(&record, pkt.payload_len);

        if pkt.timestamp > self.last_seen {
            self.last_seen = pkt.timestamp;
        }

        if self.history.len() == self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(record);

        record
    }

    /// Recent records, oldest first
    pub fn records(&self) -> impl Iterator<Item = &PacketRecord> {
        self.history.iter()
    }

    /// The most recently recorded packet
    pub fn last_record(&self) -> Option<&PacketRecord> {
        self.history.back()
    }

    /// Total packets seen, including those dropped from history
    pub fn packet_count(&self) -> u64 {
        self.total.packets
    }

    /// Seconds since the flow started, floored at `epsilon`
    pub fn duration_at(&self, now: f64, epsilon: f64) -> f64 {
        let elapsed = now - self.start_time;
        if elapsed.is_finite() {
            elapsed.max(epsilon)
        } else {
            epsilon
        }
    }
}
