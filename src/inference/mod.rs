//! Inference stage
//!
//! Hosts the link hub. Capture stages and the supervisor relay subscribe to
//! it; feature frames come in, prediction frames fan out to every subscriber.

pub mod classifier;
pub mod http;
pub mod predictor;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

pub use classifier::{Classification, Classifier, HttpClassifier, HttpClassifierConfig};
pub use predictor::Predictor;

use crate::error::{InferenceError, TransportError};
use crate::link::messages::{ControlCommand, Envelope, FeatureFrame, MessageKind, PredictionFrame};
use crate::link::{HubEvent, LinkConfig, LinkHub, SubscriberId};

/// Inference stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Model server
    pub classifier: HttpClassifierConfig,
    /// Timeout for one profile's classification (seconds)
    pub request_timeout_secs: f64,
    /// Feature frames classified at the same time
    pub max_in_flight: usize,
    /// Address for the `/predict` HTTP endpoint (empty disables it)
    pub http_addr: String,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            classifier: HttpClassifierConfig::default(),
            request_timeout_secs: 5.0,
            max_in_flight: 32,
            http_addr: "127.0.0.1:8001".to_string(),
        }
    }
}

impl InferenceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs.max(0.01))
    }
}

/// Hub plus prediction loop
pub struct InferenceStage {
    hub: Arc<LinkHub>,
    events: mpsc::Receiver<HubEvent>,
    predictor: Arc<Predictor>,
    in_flight: Arc<Semaphore>,
}

impl InferenceStage {
    /// Bind the hub on `link.hub_addr`
    pub async fn bind(
        link: &LinkConfig,
        predictor: Predictor,
        max_in_flight: usize,
    ) -> Result<Self, TransportError> {
        let (hub, events) = LinkHub::bind(&link.hub_addr, link).await?;
        Ok(Self {
            hub: Arc::new(hub),
            events,
            predictor: Arc::new(predictor),
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
        })
    }

    pub fn hub(&self) -> &Arc<LinkHub> {
        &self.hub
    }

    pub fn predictor(&self) -> Arc<Predictor> {
        self.predictor.clone()
    }

    /// Serve until `shutdown` resolves
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!("Inference stage ready on {}", self.hub.local_addr());

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(HubEvent::Connected(id)) => self.on_connect(id).await,
                        Some(HubEvent::Message(id, env)) => self.on_message(id, env).await,
                        Some(HubEvent::Disconnected(id)) => debug!("Subscriber {} left", id),
                        None => break,
                    }
                }
                _ = &mut shutdown => {
                    info!("Inference stage shutting down");
                    break;
                }
            }
        }

        self.hub.shutdown();
    }

    async fn on_connect(&self, id: SubscriberId) {
        if self.predictor.is_ready().await {
            self.hub.send_to(id, Envelope::control(ControlCommand::StartCapture));
        } else {
            warn!("Classifier not ready, turning away subscriber {}", id);
            self.hub.send_to(id, Envelope::control_error(InferenceError::NotReady.to_string()));
            // Queued frames still flush before the connection closes
            self.hub.disconnect(id);
        }
    }

    async fn on_message(&self, id: SubscriberId, env: Envelope) {
        if env.kind != MessageKind::Features {
            debug!("Ignoring {:?} message from subscriber {}", env.kind, id);
            return;
        }

        let frame: FeatureFrame = match env.decode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Invalid feature frame from subscriber {}: {}", id, e);
                return;
            }
        };

        let Ok(permit) = self.in_flight.clone().acquire_owned().await else {
            return;
        };
        let hub = self.hub.clone();
        let predictor = self.predictor.clone();
        tokio::spawn(async move {
            let result = predictor.predict(&frame).await;
            publish_prediction(&hub, &result);
            drop(permit);
        });
    }
}

fn publish_prediction(hub: &LinkHub, result: &PredictionFrame) {
    match Envelope::prediction(result) {
        Ok(env) => {
            let reached = hub.publish(&env);
            debug!("Prediction for {} sent to {} subscribers", result.source_ip, reached);
        }
        Err(e) => warn!("Failed to encode prediction: {}", e),
    }
}
