//! Capture stage process
//!
//! Connects to the inference hub, obeys its control messages and forwards
//! every feature frame the worker produces. Losing the hub while capturing
//! stops capture; the hub restarts it with a control message on reconnect.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{CaptureConfig, CaptureStage};
use crate::features::Profile;
use crate::flow::FlowConfig;
use crate::link::messages::{ControlCommand, Envelope, FeatureFrame, MessageKind};
use crate::link::{LinkClient, LinkConfig, LinkEvent, LinkHandle};

/// Capture stage wired to a link client
pub struct CaptureService {
    stage: Arc<CaptureStage>,
    frames_rx: mpsc::Receiver<FeatureFrame>,
    link: LinkHandle,
}

impl CaptureService {
    /// Build the stage and connect to `link.hub_addr`
    pub fn new(
        capture: CaptureConfig,
        flow: FlowConfig,
        profiles: Vec<Profile>,
        link: LinkConfig,
    ) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(capture.handoff_capacity.max(1));
        let stage = CaptureStage::new(capture, flow, profiles, frames_tx);
        let link = LinkClient::new(link.hub_addr.clone(), link).spawn();
        Self::with_parts(stage, frames_rx, link)
    }

    /// Assemble from prebuilt parts
    pub fn with_parts(
        stage: CaptureStage,
        frames_rx: mpsc::Receiver<FeatureFrame>,
        link: LinkHandle,
    ) -> Self {
        Self {
            stage: Arc::new(stage),
            frames_rx,
            link,
        }
    }

    pub fn stage(&self) -> &Arc<CaptureStage> {
        &self.stage
    }

    /// Run until `shutdown` resolves
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let mut events = self
            .link
            .take_events()
            .context("link events already taken")?;
        tokio::pin!(shutdown);

        info!("Capture stage running");
        loop {
            tokio::select! {
                Some(frame) = self.frames_rx.recv() => {
                    match Envelope::features(&frame) {
                        Ok(env) => {
                            self.link.send(env);
                        }
                        Err(e) => warn!("Failed to encode feature frame: {}", e),
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(LinkEvent::Connected) => info!("Connected to inference hub"),
                        Some(LinkEvent::Message(env)) => {
                            handle_control(&self.stage, &env).await;
                        }
                        Some(LinkEvent::Disconnected) => {
                            if self.stage.is_capturing() {
                                warn!("Inference hub lost, stopping capture");
                            }
                            self.stage.stop().await;
                        }
                        None => break,
                    }
                }
                _ = &mut shutdown => {
                    info!("Capture stage shutting down");
                    break;
                }
            }
        }

        self.stage.stop().await;
        let dropped = self.link.dropped();
        if dropped > 0 {
            info!("{} feature frames dropped while the hub was unreachable", dropped);
        }
        self.link.shutdown().await;
        Ok(())
    }
}

/// Apply a control message. Returns the command that was applied, if any.
pub async fn handle_control(stage: &CaptureStage, env: &Envelope) -> Option<ControlCommand> {
    if env.kind != MessageKind::Control {
        debug!("Ignoring {:?} message on capture link", env.kind);
        return None;
    }

    if let Some(err) = env.payload.get("error").and_then(|e| e.as_str()) {
        warn!("Inference hub reported: {}", err);
        return None;
    }

    let Some(command) = ControlCommand::from_payload(&env.payload) else {
        debug!("Ignoring unrecognized control message: {}", env.payload);
        return None;
    };

    info!("Received control: {}", command.as_str());
    match command {
        ControlCommand::StartCapture => {
            stage.start();
        }
        ControlCommand::StopCapture => stage.stop().await,
    }
    Some(command)
}
