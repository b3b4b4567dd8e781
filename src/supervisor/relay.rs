//! Prediction relay
//!
//! Subscribes to the inference hub and forwards prediction frames to the UI
//! WebSocket subscribers. Control frames are never forwarded, and a frame
//! where every profile was classified as the benign label is suppressed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::link::messages::MessageKind;
use crate::link::{LinkClient, LinkConfig, LinkEvent, LinkHandle, SubscriberSet};

/// Relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Label that marks a profile's result as benign
    pub benign_label: String,
    /// Messages buffered per UI subscriber
    pub ui_queue: usize,
    /// How long start-inference waits for the relay link (seconds)
    pub link_grace_secs: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            benign_label: "BENIGN".to_string(),
            ui_queue: 64,
            link_grace_secs: 2.0,
        }
    }
}

impl RelayConfig {
    pub fn link_grace(&self) -> Duration {
        Duration::from_secs_f64(self.link_grace_secs.max(0.0))
    }
}

/// True when every named profile's `Prediction` equals `benign`
/// (trimmed, case-insensitive)
pub fn is_benign(payload: &Value, profiles: &[String], benign: &str) -> bool {
    let benign = benign.trim();
    !profiles.is_empty()
        && profiles.iter().all(|name| {
            payload
                .get(name)
                .and_then(|p| p.get("Prediction"))
                .and_then(Value::as_str)
                .is_some_and(|label| label.trim().eq_ignore_ascii_case(benign))
        })
}

/// Relay counters
#[derive(Debug, Default)]
pub struct RelayStats {
    pub forwarded: AtomicU64,
    pub suppressed: AtomicU64,
}

/// Running relay
pub struct PredictionRelay {
    link: LinkHandle,
    task: Option<JoinHandle<()>>,
    stats: Arc<RelayStats>,
}

impl PredictionRelay {
    /// Connect to the hub at `link.hub_addr` and start forwarding
    pub fn start(
        link: &LinkConfig,
        config: &RelayConfig,
        profiles: Vec<String>,
        ui: Arc<SubscriberSet<String>>,
        connected: Arc<AtomicBool>,
    ) -> Self {
        let mut handle = LinkClient::new(link.hub_addr.clone(), link.clone()).spawn();
        let stats = Arc::new(RelayStats::default());
        let task = handle.take_events().map(|events| {
            tokio::spawn(relay_loop(
                events,
                profiles,
                config.benign_label.clone(),
                ui,
                connected,
                stats.clone(),
            ))
        });

        Self {
            link: handle,
            task,
            stats,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub async fn wait_connected(&self, limit: Duration) -> bool {
        self.link.wait_connected(limit).await
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Close the link and stop forwarding
    pub async fn shutdown(mut self) {
        self.link.shutdown().await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn relay_loop(
    mut events: tokio::sync::mpsc::Receiver<LinkEvent>,
    profiles: Vec<String>,
    benign: String,
    ui: Arc<SubscriberSet<String>>,
    connected: Arc<AtomicBool>,
    stats: Arc<RelayStats>,
) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Connected => {
                info!("Relay connected to inference hub");
                connected.store(true, Ordering::SeqCst);
            }
            LinkEvent::Disconnected => {
                warn!("Relay lost inference hub");
                connected.store(false, Ordering::SeqCst);
            }
            LinkEvent::Message(env) => {
                if env.kind != MessageKind::Prediction {
                    debug!("Relay ignoring {:?} message", env.kind);
                    continue;
                }
                if is_benign(&env.payload, &profiles, &benign) {
                    stats.suppressed.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let text = env.payload.to_string();
                let reached = ui.publish(&text);
                stats.forwarded.fetch_add(1, Ordering::Relaxed);
                debug!("Forwarded prediction to {} UI subscribers", reached);
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::messages::{Envelope, PredictionFrame, ProfileOutcome};
    use crate::link::{HubEvent, LinkHub};
    use serde_json::json;

    fn profiles() -> Vec<String> {
        vec!["DDoS".into(), "IDS".into()]
    }

    #[test]
    fn test_both_benign_is_suppressed() {
        let payload = json!({
            "Source_ip": "192.168.1.11",
            "DDoS": {"Prediction": "BENIGN", "Probability": 99.0},
            "IDS": {"Prediction": " benign ", "Probability": 97.5},
        });
        assert!(is_benign(&payload, &profiles(), "BENIGN"));
    }

    #[test]
    fn test_any_other_combination_is_forwarded() {
        let cases = [
            json!({"DDoS": {"Prediction": "BENIGN"}, "IDS": {"Prediction": "PortScan"}}),
            json!({"DDoS": {"Prediction": "DDoS"}, "IDS": {"Prediction": "BENIGN"}}),
            json!({"DDoS": {"Prediction": "BENIGN"}, "IDS": null}),
            json!({"DDoS": {"error": "DDoS prediction failed"}, "IDS": {"Prediction": "BENIGN"}}),
            json!({"Source_ip": "10.0.0.1", "error": "No valid DDoS or IDS features provided"}),
        ];
        for payload in cases {
            assert!(!is_benign(&payload, &profiles(), "BENIGN"), "{}", payload);
        }
    }

    #[tokio::test]
    async fn test_relay_forwards_predictions_only() {
        let link = LinkConfig {
            hub_addr: "127.0.0.1:0".into(),
            reconnect_delay_secs: 0.1,
            ..Default::default()
        };
        let (hub, mut hub_events) = LinkHub::bind(&link.hub_addr, &link).await.unwrap();
        let link = LinkConfig {
            hub_addr: hub.local_addr().to_string(),
            ..link
        };

        let ui = Arc::new(SubscriberSet::new(16));
        let (_id, mut ui_rx) = ui.subscribe();
        let connected = Arc::new(AtomicBool::new(false));
        let relay = PredictionRelay::start(&link, &RelayConfig::default(), profiles(), ui.clone(), connected.clone());

        assert!(relay.wait_connected(Duration::from_secs(5)).await);
        assert!(matches!(hub_events.recv().await, Some(HubEvent::Connected(_))));

        let mut benign = PredictionFrame::new("192.168.1.11");
        for name in ["DDoS", "IDS"] {
            benign.profiles.insert(
                name.into(),
                Some(ProfileOutcome::Prediction {
                    prediction: "BENIGN".into(),
                    probability: 99.0,
                }),
            );
        }
        let mut attack = benign.clone();
        attack.profiles.insert(
            "IDS".into(),
            Some(ProfileOutcome::Prediction {
                prediction: "PortScan".into(),
                probability: 88.0,
            }),
        );

        hub.publish(&Envelope::control(crate::link::ControlCommand::StartCapture));
        hub.publish(&Envelope::prediction(&benign).unwrap());
        hub.publish(&Envelope::prediction(&attack).unwrap());

        let text = tokio::time::timeout(Duration::from_secs(5), ui_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let forwarded: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(forwarded["IDS"]["Prediction"], "PortScan");
        assert_eq!(forwarded["Source_ip"], "192.168.1.11");

        assert_eq!(relay.stats().suppressed.load(Ordering::Relaxed), 1);
        assert!(connected.load(Ordering::SeqCst));

        relay.shutdown().await;
        assert!(!connected.load(Ordering::SeqCst));
    }
}
