//! Capture engine
//!
//! Continuous capture feeding a dedicated flow worker.
//!
//! # Architecture
//! ```text
//! ┌─────────────┐   bounded    ┌──────────────┐   tokio mpsc   ┌──────────────┐
//! │   Capture   │────queue────▶│ Flow worker  │──────────────▶│  Link client │
//! │parse+filter │ drop-newest  │ table+extract│  FeatureFrame  │  (async)     │
//! └─────────────┘              └──────────────┘                └──────────────┘
//! ```
//!
//! States: `Stopped → Starting → Capturing`, and on request
//! `Capturing → Stopping → Stopped`. The stop flag is checked between reads,
//! so at most one in-flight read completes after a stop request.

pub mod capture;
pub mod pipeline;
pub mod service;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::packet::Packet;
use crate::error::CaptureError;
use crate::features::Profile;
use crate::flow::FlowConfig;
use crate::link::messages::FeatureFrame;

pub use capture::{
    open_source, source_opener, CaptureConfig, CaptureMethod, FileSource, PacketSource,
    SourceOpener, SyntheticSource,
};
pub use pipeline::{AddressFilter, FlowWorker, QueueSnapshot, QueueStats};
pub use service::CaptureService;

/// Capture state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    /// Not capturing
    Stopped,
    /// Threads spawned, source not yet open
    Starting,
    /// Source open, frames flowing
    Capturing,
    /// Stop requested, waiting for threads
    Stopping,
}

#[derive(Debug)]
struct Shared {
    state: CaptureState,
    last_error: Option<String>,
}

/// Owns the capture and worker threads for one capture stage
pub struct CaptureStage {
    config: CaptureConfig,
    flow: FlowConfig,
    profiles: Vec<Profile>,
    opener: SourceOpener,
    frames_tx: mpsc::Sender<FeatureFrame>,
    shared: Arc<Mutex<Shared>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stop_flag: Arc<AtomicBool>,
    stats: Arc<QueueStats>,
}

impl CaptureStage {
    /// Create a stage that opens sources according to `config`
    pub fn new(
        config: CaptureConfig,
        flow: FlowConfig,
        profiles: Vec<Profile>,
        frames_tx: mpsc::Sender<FeatureFrame>,
    ) -> Self {
        let opener = source_opener(&config);
        Self::with_opener(config, flow, profiles, frames_tx, opener)
    }

    /// Create a stage with a custom source opener
    pub fn with_opener(
        config: CaptureConfig,
        flow: FlowConfig,
        profiles: Vec<Profile>,
        frames_tx: mpsc::Sender<FeatureFrame>,
        opener: SourceOpener,
    ) -> Self {
        Self {
            config,
            flow,
            profiles,
            opener,
            frames_tx,
            shared: Arc::new(Mutex::new(Shared {
                state: CaptureState::Stopped,
                last_error: None,
            })),
            handles: Mutex::new(Vec::new()),
            stop_flag: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(QueueStats::default()),
        }
    }

    /// Get current state
    pub fn state(&self) -> CaptureState {
        self.shared.lock().state
    }

    /// Check if frames are flowing
    pub fn is_capturing(&self) -> bool {
        self.state() == CaptureState::Capturing
    }

    /// Queue statistics since the stage was created
    pub fn stats(&self) -> QueueSnapshot {
        self.stats.snapshot()
    }

    /// Most recent capture failure, cleared on start
    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    /// Start capturing. A no-op while starting or capturing; refused while a
    /// stop is in progress.
    ///
    /// Never holds `shared` and `handles` together, and joins with neither
    /// held.
    pub fn start(&self) -> bool {
        {
            let mut shared = self.shared.lock();
            match shared.state {
                CaptureState::Starting | CaptureState::Capturing => {
                    debug!("Capture already {:?}", shared.state);
                    return true;
                }
                CaptureState::Stopping => {
                    warn!("Capture is stopping, start ignored");
                    return false;
                }
                CaptureState::Stopped => {}
            }
            shared.state = CaptureState::Starting;
            shared.last_error = None;
        }

        // Threads from a session that ended on its own
        let finished: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in finished {
            let _ = handle.join();
        }

        info!("Starting packet capture ({:?})", self.config.method);
        self.stop_flag.store(false, Ordering::SeqCst);

        let (pkt_tx, pkt_rx) = crossbeam_channel::bounded::<Packet>(self.config.queue_capacity.max(1));

        let worker = FlowWorker::new(self.flow.clone(), self.profiles.clone());
        let out = self.frames_tx.clone();
        let worker_stats = self.stats.clone();
        let stats_interval = Duration::from_secs(self.config.stats_interval_secs);
        let worker_handle = std::thread::Builder::new()
            .name("flow-worker".into())
            .spawn(move || pipeline::run_worker(pkt_rx, worker, out, worker_stats, stats_interval));

        let ctx = CaptureLoop {
            opener: self.opener.clone(),
            config: self.config.clone(),
            filter: AddressFilter::new(self.config.allowed_sources.iter().copied()),
            tx: pkt_tx,
            shared: self.shared.clone(),
            stop: self.stop_flag.clone(),
            stats: self.stats.clone(),
        };
        let capture_handle = std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || ctx.run());

        let mut spawned = Vec::with_capacity(2);
        let mut failure = None;
        for result in [worker_handle, capture_handle] {
            match result {
                Ok(handle) => spawned.push(handle),
                Err(e) => failure = Some(e),
            }
        }
        // A thread whose peer failed to spawn sees its channel closed and exits
        self.handles.lock().extend(spawned);

        if let Some(e) = failure {
            error!("Failed to spawn capture thread: {}", e);
            self.stop_flag.store(true, Ordering::SeqCst);
            let mut shared = self.shared.lock();
            shared.state = CaptureState::Stopped;
            shared.last_error = Some(e.to_string());
            return false;
        }
        true
    }

    /// Stop capturing and wait for both threads. A no-op when stopped.
    pub async fn stop(&self) {
        {
            let mut shared = self.shared.lock();
            match shared.state {
                CaptureState::Stopped | CaptureState::Stopping => return,
                _ => shared.state = CaptureState::Stopping,
            }
        }

        info!("Stopping packet capture...");
        self.stop_flag.store(true, Ordering::SeqCst);

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let joined = tokio::task::spawn_blocking(move || {
            for handle in handles {
                let _ = handle.join();
            }
        })
        .await;
        if let Err(e) = joined {
            error!("Capture threads did not join: {}", e);
        }

        self.shared.lock().state = CaptureState::Stopped;
        info!("Packet capture stopped");
    }
}

/// Everything the capture thread needs
struct CaptureLoop {
    opener: SourceOpener,
    config: CaptureConfig,
    filter: AddressFilter,
    tx: Sender<Packet>,
    shared: Arc<Mutex<Shared>>,
    stop: Arc<AtomicBool>,
    stats: Arc<QueueStats>,
}

impl CaptureLoop {
    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn run(self) {
        let mut failures = 0u32;

        'session: while !self.stopping() {
            let mut source = match (self.opener)() {
                Ok(source) => source,
                Err(e) => {
                    if self.on_failure(e, &mut failures) {
                        continue;
                    }
                    break;
                }
            };

            info!("Capture started on {}", source.describe());
            {
                let mut shared = self.shared.lock();
                if shared.state == CaptureState::Starting {
                    shared.state = CaptureState::Capturing;
                }
            }

            loop {
                if self.stopping() {
                    break 'session;
                }
                match source.next_frame() {
                    Ok(Some(frame)) => {
                        failures = 0;
                        let Some(pkt) = self.filter.admit_counted(&frame, &self.stats) else {
                            continue;
                        };
                        if !pipeline::enqueue(&self.tx, pkt, &self.stats) {
                            debug!("Flow worker gone");
                            break 'session;
                        }
                    }
                    Ok(None) => {}
                    Err(CaptureError::Exhausted) => {
                        info!("Capture source {} ended", source.describe());
                        break 'session;
                    }
                    Err(e) => {
                        if self.on_failure(e, &mut failures) {
                            continue 'session;
                        }
                        break 'session;
                    }
                }
            }
        }

        let CaptureLoop { tx, shared, .. } = self;
        // Closing the queue lets the worker drain and exit
        drop(tx);
        let mut shared = shared.lock();
        if shared.state != CaptureState::Stopping {
            shared.state = CaptureState::Stopped;
        }
        info!("Capture stopped");
    }

    /// Record a failure and back off. Returns false when capture should end.
    fn on_failure(&self, err: CaptureError, failures: &mut u32) -> bool {
        *failures += 1;
        let backoff = if err.is_permission() {
            self.config.permission_backoff()
        } else {
            self.config.failure_backoff()
        };
        self.shared.lock().last_error = Some(err.to_string());

        let limit = self.config.max_consecutive_failures;
        if limit > 0 && *failures >= limit {
            error!("Capture failed {} times in a row, giving up: {}", failures, err);
            return false;
        }

        if err.is_permission() {
            error!("Capture permission denied, retrying in {:?}: {}", backoff, err);
        } else {
            warn!("Capture error, retrying in {:?}: {}", backoff, err);
        }
        self.sleep(backoff);
        !self.stopping()
    }

    /// Sleep that wakes early on a stop request
    fn sleep(&self, total: Duration) {
        let step = Duration::from_millis(50);
        let mut waited = Duration::ZERO;
        while waited < total && !self.stopping() {
            let nap = step.min(total - waited);
            std::thread::sleep(nap);
            waited += nap;
        }
    }
}
