//! Capture-side processing pipeline
//!
//! ```text
//! capture thread ──bounded queue──▶ flow worker ──tokio mpsc──▶ link
//!  parse → filter    (drop-newest)   table → extract
//! ```
//!
//! The capture thread decodes each frame and applies the allow-list, so only
//! admitted packets take queue space. The worker is the only owner of the
//! flow table. Packets that do not fit in the queue are dropped at the
//! capture thread; feature frames that do not fit in the handoff channel are
//! dropped at the worker. Both are counted.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::core::flow::FlowKey;
use crate::core::packet::Packet;
use crate::core::parser::{parse_frame, RawFrame};
use crate::features::{FeatureExtractor, Profile};
use crate::flow::{FlowConfig, FlowTable, TableStats};
use crate::link::messages::FeatureFrame;

/// Saturation counters shared by the capture thread and the worker
#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    high_water: AtomicUsize,
    processed: AtomicU64,
    filtered: AtomicU64,
    emitted: AtomicU64,
    handoff_dropped: AtomicU64,
}

/// Point-in-time copy of [`QueueStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub enqueued: u64,
    pub dropped: u64,
    pub high_water: usize,
    pub processed: u64,
    pub filtered: u64,
    pub emitted: u64,
    pub handoff_dropped: u64,
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            high_water: self.high_water.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            handoff_dropped: self.handoff_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Push a packet without blocking the capture thread. A full queue drops the
/// new packet. Returns false once the worker is gone.
pub fn enqueue(tx: &Sender<Packet>, pkt: Packet, stats: &QueueStats) -> bool {
    match tx.try_send(pkt) {
        Ok(()) => {
            stats.enqueued.fetch_add(1, Ordering::Relaxed);
            stats.high_water.fetch_max(tx.len(), Ordering::Relaxed);
            true
        }
        Err(TrySendError::Full(_)) => {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

/// Source address allow-list
#[derive(Debug, Clone, Default)]
pub struct AddressFilter {
    allowed: HashSet<IpAddr>,
}

impl AddressFilter {
    pub fn new(allowed: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }

    /// An empty list admits every source
    pub fn admits(&self, src: &IpAddr) -> bool {
        self.allowed.is_empty() || self.allowed.contains(src)
    }

    /// Decode a frame and keep it only if it is IP from an allowed source
    pub fn admit(&self, frame: &RawFrame) -> Option<Packet> {
        let pkt = parse_frame(frame)?;
        if !self.admits(&pkt.src_ip) {
            trace!("Filtered packet from {}", pkt.src_ip);
            return None;
        }
        Some(pkt)
    }

    /// Like [`admit`](Self::admit), counting rejected frames
    pub fn admit_counted(&self, frame: &RawFrame, stats: &QueueStats) -> Option<Packet> {
        let pkt = self.admit(frame);
        if pkt.is_none() {
            stats.filtered.fetch_add(1, Ordering::Relaxed);
        }
        pkt
    }
}

/// Owns the flow table and turns packets into feature frames
pub struct FlowWorker {
    table: FlowTable,
    extractor: FeatureExtractor,
    sweep_interval: f64,
    last_sweep: Option<f64>,
    latest_ts: f64,
}

impl FlowWorker {
    pub fn new(flow: FlowConfig, profiles: Vec<Profile>) -> Self {
        let sweep_interval = flow.sweep_interval_secs.max(0.0);
        Self {
            table: FlowTable::new(flow),
            extractor: FeatureExtractor::new(profiles),
            sweep_interval,
            last_sweep: None,
            latest_ts: 0.0,
        }
    }

    /// Record one admitted packet and extract its feature frame
    pub fn process(&mut self, pkt: &Packet) -> FeatureFrame {
        self.latest_ts = self.latest_ts.max(pkt.timestamp);
        self.maybe_sweep();

        let key = FlowKey::from_packet(pkt);
        let flow = self.table.insert_packet(key, pkt);
        self.extractor.extract(flow, pkt)
    }

    /// Sweep idle flows using packet time as the clock
    fn maybe_sweep(&mut self) {
        let now = self.latest_ts;
        match self.last_sweep {
            None => self.last_sweep = Some(now),
            Some(last) if now - last >= self.sweep_interval => {
                self.table.sweep_idle(now);
                self.last_sweep = Some(now);
            }
            _ => {}
        }
    }

    pub fn active_flows(&self) -> usize {
        self.table.len()
    }

    pub fn table_stats(&self) -> &TableStats {
        &self.table.stats
    }
}

/// Worker loop: runs until the capture side drops its sender and the queue
/// is drained
pub fn run_worker(
    rx: Receiver<Packet>,
    mut worker: FlowWorker,
    out: mpsc::Sender<FeatureFrame>,
    stats: Arc<QueueStats>,
    stats_interval: Duration,
) {
    debug!("Flow worker started");
    let mut last_report = Instant::now();

    loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(pkt) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);
                match out.try_send(worker.process(&pkt)) {
                    Ok(()) => {
                        stats.emitted.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {
                        stats.handoff_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if !stats_interval.is_zero() && last_report.elapsed() >= stats_interval {
            report(&stats, &worker);
            last_report = Instant::now();
        }
    }

    report(&stats, &worker);
    debug!("Flow worker stopped");
}

fn report(stats: &QueueStats, worker: &FlowWorker) {
    let snap = stats.snapshot();
    let table = worker.table_stats();
    info!(
        "Capture queue: filtered={} enqueued={} dropped={} high_water={} emitted={} handoff_dropped={} flows={} evicted={} expired={}",
        snap.filtered,
        snap.enqueued,
        snap.dropped,
        snap.high_water,
        snap.emitted,
        snap.handoff_dropped,
        worker.active_flows(),
        table.evictions,
        table.expired,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::LinkKind;
    use crate::core::parser::tests::{tcp_frame, udp_frame};

    fn tcp_packet(ts: f64, src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> Packet {
        let frame = RawFrame::new(ts, LinkKind::Ethernet, tcp_frame(src, sport, dst, dport, 0x10, b""));
        parse_frame(&frame).unwrap()
    }

    #[test]
    fn test_filter_admits_configured_sources_only() {
        let filter = AddressFilter::new(["192.168.1.11".parse().unwrap()]);
        assert!(filter.admits(&"192.168.1.11".parse().unwrap()));
        assert!(!filter.admits(&"192.168.1.12".parse().unwrap()));

        let open = AddressFilter::default();
        assert!(open.admits(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_admit_decodes_and_filters() {
        let filter = AddressFilter::new(["192.168.1.11".parse().unwrap()]);
        let stats = QueueStats::default();

        let admitted = RawFrame::new(
            1.0,
            LinkKind::Ethernet,
            tcp_frame([192, 168, 1, 11], 40000, [10, 0, 0, 1], 80, 0x10, b"abc"),
        );
        let pkt = filter.admit_counted(&admitted, &stats).unwrap();
        assert_eq!(pkt.src_port, 40000);

        let other = RawFrame::new(
            1.1,
            LinkKind::Ethernet,
            udp_frame([10, 9, 9, 9], 53, [192, 168, 1, 11], 5353, b"x"),
        );
        assert!(filter.admit_counted(&other, &stats).is_none());

        let not_ip = RawFrame::new(1.2, LinkKind::Ethernet, vec![0u8; 10]);
        assert!(filter.admit_counted(&not_ip, &stats).is_none());
        assert_eq!(stats.snapshot().filtered, 2);
    }

    #[test]
    fn test_filtered_traffic_takes_no_queue_space() {
        let filter = AddressFilter::new(["192.168.1.11".parse().unwrap()]);
        let stats = QueueStats::default();
        let (tx, rx) = crossbeam_channel::bounded(2);

        // A flood from a source outside the allow-list
        for i in 0..50u16 {
            let noise = RawFrame::new(
                i as f64,
                LinkKind::Ethernet,
                tcp_frame([10, 0, 0, 99], 1000 + i, [10, 0, 0, 1], 80, 0x02, b""),
            );
            if let Some(pkt) = filter.admit_counted(&noise, &stats) {
                enqueue(&tx, pkt, &stats);
            }
        }
        let wanted = RawFrame::new(
            60.0,
            LinkKind::Ethernet,
            tcp_frame([192, 168, 1, 11], 40000, [10, 0, 0, 1], 80, 0x02, b""),
        );
        let pkt = filter.admit_counted(&wanted, &stats).unwrap();
        assert!(enqueue(&tx, pkt, &stats));

        let snap = stats.snapshot();
        assert_eq!(snap.filtered, 50);
        assert_eq!(snap.enqueued, 1);
        assert_eq!(snap.dropped, 0);
        assert_eq!(rx.recv().unwrap().src_port, 40000);
    }

    #[test]
    fn test_worker_emits_frame_per_packet() {
        let mut w = FlowWorker::new(FlowConfig::default(), Profile::builtin());

        let frame = w.process(&tcp_packet(1.0, [192, 168, 1, 11], 40000, [10, 0, 0, 1], 80));
        assert_eq!(frame.src_ip, "192.168.1.11");
        assert_eq!(frame.profiles["DDoS"].len(), 31);
        assert_eq!(frame.profiles["IDS"].len(), 30);

        w.process(&tcp_packet(1.1, [10, 0, 0, 1], 80, [192, 168, 1, 11], 40000));
        assert_eq!(w.active_flows(), 1);
    }

    #[test]
    fn test_worker_sweeps_on_packet_time() {
        let flow = FlowConfig {
            idle_timeout_secs: 5.0,
            sweep_interval_secs: 1.0,
            ..Default::default()
        };
        let mut w = FlowWorker::new(flow, Profile::builtin());

        w.process(&tcp_packet(0.0, [1, 1, 1, 1], 1, [2, 2, 2, 2], 2));
        w.process(&tcp_packet(100.0, [3, 3, 3, 3], 3, [4, 4, 4, 4], 4));

        assert_eq!(w.active_flows(), 1);
        assert_eq!(w.table_stats().expired, 1);
    }

    #[test]
    fn test_enqueue_drops_newest_when_full() {
        let (tx, rx) = crossbeam_channel::bounded(2);
        let stats = QueueStats::default();
        for i in 0..5 {
            assert!(enqueue(&tx, tcp_packet(i as f64, [1, 1, 1, 1], 1, [2, 2, 2, 2], 2), &stats));
        }

        let snap = stats.snapshot();
        assert_eq!(snap.enqueued, 2);
        assert_eq!(snap.dropped, 3);
        assert_eq!(snap.high_water, 2);

        // The oldest packets are the ones kept
        assert_eq!(rx.recv().unwrap().timestamp, 0.0);
        assert_eq!(rx.recv().unwrap().timestamp, 1.0);

        drop(rx);
        assert!(!enqueue(&tx, tcp_packet(9.0, [1, 1, 1, 1], 1, [2, 2, 2, 2], 2), &stats));
    }

    #[test]
    fn test_run_worker_hands_off_and_counts_drops() {
        let (tx, rx) = crossbeam_channel::bounded(16);
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let stats = Arc::new(QueueStats::default());

        for i in 0..3 {
            let pkt = tcp_packet(i as f64, [192, 168, 1, 11], 40000, [10, 0, 0, 1], 80);
            assert!(enqueue(&tx, pkt, &stats));
        }
        drop(tx);

        let worker = FlowWorker::new(FlowConfig::default(), Profile::builtin());
        run_worker(rx, worker, out_tx, stats.clone(), Duration::ZERO);

        let snap = stats.snapshot();
        assert_eq!(snap.processed, 3);
        assert_eq!(snap.emitted, 1);
        assert_eq!(snap.handoff_dropped, 2);
        assert!(out_rx.try_recv().is_ok());
    }
}
