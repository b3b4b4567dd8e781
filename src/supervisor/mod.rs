//! Pipeline supervisor
//!
//! One context object owns everything the operator surface can touch:
//! - Capture and inference stage processes
//! - The prediction relay link and its UI subscribers
//! - Liveness flags read by `health()`
//!
//! Start/stop calls are serialized by an async mutex, so concurrent starts
//! never spawn a second copy of a stage.

pub mod http;
pub mod ports;
pub mod process;
pub mod relay;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::SupervisionError;
use crate::link::SubscriberSet;
use ports::{release_ports, ReleasedPort};
use process::{StageCommand, StageProcess};
use relay::PredictionRelay;

pub const CAPTURE_STAGE: &str = "capture";
pub const INFERENCE_STAGE: &str = "inference";

/// Supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Operator HTTP surface
    pub listen_addr: String,
    /// Time a stage must stay up before it counts as started (seconds)
    pub startup_grace_secs: f64,
    /// Stderr lines kept per stage for diagnostics
    pub stderr_tail_lines: usize,
    /// Ports freed by stop-all
    pub release_ports: Vec<u16>,
    /// Static UI served as fallback
    pub static_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8000".to_string(),
            startup_grace_secs: 3.0,
            stderr_tail_lines: 20,
            release_ports: vec![8765, 8001],
            static_dir: None,
        }
    }
}

impl SupervisorConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs_f64(self.startup_grace_secs.max(0.0))
    }
}

/// Builds the command line for a stage
pub trait StageLauncher: Send + Sync {
    fn command(&self, stage: &'static str) -> Result<StageCommand, SupervisionError>;
}

/// Re-runs the current executable with the stage subcommand
#[derive(Debug, Clone, Default)]
pub struct SelfLauncher {
    pub config_path: Option<PathBuf>,
    pub hub_addr: Option<String>,
}

impl StageLauncher for SelfLauncher {
    fn command(&self, stage: &'static str) -> Result<StageCommand, SupervisionError> {
        let exe = std::env::current_exe().map_err(SupervisionError::Executable)?;
        let mut args = Vec::new();
        if let Some(path) = &self.config_path {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        args.push(stage.to_string());
        if let Some(hub) = &self.hub_addr {
            args.push("--hub".to_string());
            args.push(hub.clone());
        }
        Ok(StageCommand { program: exe, args })
    }
}

/// Result of a start call
#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_connected: Option<bool>,
}

/// Result of stop-all
#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub success: bool,
    pub terminated: Vec<String>,
    pub released_ports: Vec<ReleasedPort>,
}

/// Liveness snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub capture_alive: bool,
    pub inference_alive: bool,
    pub link_connected: bool,
}

#[derive(Default)]
struct Stages {
    capture: Option<StageProcess>,
    inference: Option<StageProcess>,
    relay: Option<PredictionRelay>,
}

/// Process supervisor context
pub struct PipelineSupervisor {
    config: Config,
    launcher: Box<dyn StageLauncher>,
    stages: Mutex<Stages>,
    capture_alive: Arc<AtomicBool>,
    inference_alive: Arc<AtomicBool>,
    link_connected: Arc<AtomicBool>,
    ui: Arc<SubscriberSet<String>>,
    shut_down: AtomicBool,
}

impl PipelineSupervisor {
    pub fn new(config: Config, launcher: Box<dyn StageLauncher>) -> Self {
        let ui = Arc::new(SubscriberSet::new(config.relay.ui_queue));
        Self {
            config,
            launcher,
            stages: Mutex::new(Stages::default()),
            capture_alive: Arc::new(AtomicBool::new(false)),
            inference_alive: Arc::new(AtomicBool::new(false)),
            link_connected: Arc::new(AtomicBool::new(false)),
            ui,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// UI WebSocket subscribers
    pub fn ui(&self) -> &Arc<SubscriberSet<String>> {
        &self.ui
    }

    /// Start the capture stage unless it is already running
    pub async fn start_capture(&self) -> Result<StartReport, SupervisionError> {
        let mut stages = self.stages.lock().await;
        if let Some(running) = stages.capture.as_ref().filter(|p| p.is_alive()) {
            return Ok(StartReport {
                success: true,
                message: "Packet capture already running".into(),
                pid: Some(running.pid()),
                link_connected: None,
            });
        }

        let process = self.spawn_stage(CAPTURE_STAGE, &self.capture_alive).await?;
        let pid = process.pid();
        stages.capture = Some(process);
        Ok(StartReport {
            success: true,
            message: "Packet capture started".into(),
            pid: Some(pid),
            link_connected: None,
        })
    }

    /// Start the inference stage and the prediction relay
    pub async fn start_inference(&self) -> Result<StartReport, SupervisionError> {
        let mut stages = self.stages.lock().await;
        if let Some(running) = stages.inference.as_ref().filter(|p| p.is_alive()) {
            return Ok(StartReport {
                success: true,
                message: "Inference already running".into(),
                pid: Some(running.pid()),
                link_connected: Some(self.link_connected.load(Ordering::SeqCst)),
            });
        }

        let process = self.spawn_stage(INFERENCE_STAGE, &self.inference_alive).await?;
        let pid = process.pid();
        stages.inference = Some(process);

        if stages.relay.is_none() {
            stages.relay = Some(PredictionRelay::start(
                &self.config.link,
                &self.config.relay,
                self.config.profile_names(),
                self.ui.clone(),
                self.link_connected.clone(),
            ));
        }

        let mut link_connected = false;
        if let Some(relay) = &stages.relay {
            link_connected = relay.wait_connected(self.config.relay.link_grace()).await;
        }
        if !link_connected {
            warn!("Relay link not connected yet; it keeps retrying");
        }

        Ok(StartReport {
            success: true,
            message: "Inference started".into(),
            pid: Some(pid),
            link_connected: Some(link_connected),
        })
    }

    /// Close the relay, kill both stages with their descendants and free the
    /// pipeline ports. Safe with nothing running.
    pub async fn stop_all(&self) -> StopReport {
        let mut stages = self.stages.lock().await;
        let mut terminated = Vec::new();

        if let Some(relay) = stages.relay.take() {
            relay.shutdown().await;
            self.link_connected.store(false, Ordering::SeqCst);
            terminated.push("relay".to_string());
        }

        for slot in [stages.capture.take(), stages.inference.take()] {
            let Some(process) = slot else { continue };
            let stage = process.stage();
            let was_alive = process.is_alive();
            match process.terminate().await {
                Ok(()) if was_alive => terminated.push(stage.to_string()),
                Ok(()) => {}
                Err(e) => warn!("{}", e),
            }
        }

        let released = release_ports(&self.config.supervisor.release_ports);
        for port in &released {
            terminated.push(format!("port {} (pid {})", port.port, port.pid));
        }

        info!("Stopped: {:?}", terminated);
        StopReport {
            success: true,
            terminated,
            released_ports: released,
        }
    }

    /// Liveness flags; never waits on a stage
    pub fn health(&self) -> HealthReport {
        HealthReport {
            capture_alive: self.capture_alive.load(Ordering::SeqCst),
            inference_alive: self.inference_alive.load(Ordering::SeqCst),
            link_connected: self.link_connected.load(Ordering::SeqCst),
        }
    }

    /// Signal path: stop everything once, however often it is called
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down pipeline...");
        self.stop_all().await;
        self.ui.clear();
    }

    async fn spawn_stage(
        &self,
        stage: &'static str,
        alive: &Arc<AtomicBool>,
    ) -> Result<StageProcess, SupervisionError> {
        let command = self.launcher.command(stage)?;
        StageProcess::spawn(
            stage,
            &command,
            alive.clone(),
            self.config.supervisor.startup_grace(),
            self.config.supervisor.stderr_tail_lines,
        )
        .await
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;

    /// Runs `sh -c <script>` for every stage
    pub(crate) struct ShellLauncher(pub &'static str);

    impl StageLauncher for ShellLauncher {
        fn command(&self, _stage: &'static str) -> Result<StageCommand, SupervisionError> {
            Ok(StageCommand::new("/bin/sh", ["-c", self.0]))
        }
    }

    pub(crate) fn supervisor(script: &'static str) -> PipelineSupervisor {
        let mut config = Config::default();
        config.supervisor.startup_grace_secs = 0.2;
        config.supervisor.release_ports = Vec::new();
        config.relay.link_grace_secs = 0.1;
        // Nothing listens here, so the relay stays disconnected
        config.link.hub_addr = "127.0.0.1:9".into();
        PipelineSupervisor::new(config, Box::new(ShellLauncher(script)))
    }

    #[tokio::test]
    async fn test_start_capture_is_idempotent() {
        let sup = supervisor("sleep 30");

        let first = sup.start_capture().await.unwrap();
        assert!(first.success);
        let second = sup.start_capture().await.unwrap();
        assert!(second.success);
        assert_eq!(second.message, "Packet capture already running");
        assert_eq!(first.pid, second.pid);
        assert!(sup.health().capture_alive);

        let report = sup.stop_all().await;
        assert_eq!(report.terminated, vec!["capture"]);
        assert!(!sup.health().capture_alive);
    }

    #[tokio::test]
    async fn test_concurrent_starts_spawn_once() {
        let sup = Arc::new(supervisor("sleep 30"));
        let (a, b) = tokio::join!(sup.start_capture(), sup.start_capture());
        assert_eq!(a.unwrap().pid, b.unwrap().pid);
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn test_early_exit_is_reported() {
        let sup = supervisor("echo 'no capture device' >&2; exit 1");
        let err = sup.start_capture().await.unwrap_err();
        assert!(err.to_string().contains("no capture device"));
        assert!(!sup.health().capture_alive);
    }

    #[tokio::test]
    async fn test_start_inference_reports_link() {
        let sup = supervisor("sleep 30");
        let report = sup.start_inference().await.unwrap();
        assert!(report.success);
        assert_eq!(report.link_connected, Some(false));

        let report = sup.stop_all().await;
        assert_eq!(report.terminated, vec!["relay", "inference"]);
    }

    #[tokio::test]
    async fn test_stop_all_with_nothing_running() {
        let sup = supervisor("sleep 30");
        let report = sup.stop_all().await;
        assert!(report.success);
        assert!(report.terminated.is_empty());

        sup.shutdown().await;
        sup.shutdown().await;
    }
}
