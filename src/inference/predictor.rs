//! Per-frame prediction
//!
//! Every configured profile that is present and non-empty in a feature frame
//! is classified concurrently. Failures stay local to their profile.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, warn};

use super::classifier::Classifier;
use crate::error::InferenceError;
use crate::features::Profile;
use crate::link::messages::{FeatureFrame, PredictionFrame, ProfileOutcome};

/// Runs the classifier over feature frames
#[derive(Debug, Clone)]
pub struct Predictor {
    classifier: Arc<dyn Classifier>,
    profiles: Vec<Profile>,
    timeout: Duration,
}

impl Predictor {
    pub fn new(classifier: Arc<dyn Classifier>, profiles: Vec<Profile>, timeout: Duration) -> Self {
        Self {
            classifier,
            profiles,
            timeout,
        }
    }

    pub async fn is_ready(&self) -> bool {
        self.classifier.is_ready().await
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    /// Classify one feature frame
    pub async fn predict(&self, frame: &FeatureFrame) -> PredictionFrame {
        let mut result = PredictionFrame::new(frame.src_ip.clone());

        let mut pending = Vec::new();
        let mut invalid = Vec::new();
        for profile in &self.profiles {
            if let Some(reason) = frame.rejected.get(&profile.name) {
                let err = InferenceError::InvalidVector {
                    profile: profile.name.clone(),
                    reason: reason.clone(),
                };
                invalid.push((profile, err));
                continue;
            }
            match frame.profiles.get(&profile.name) {
                Some(values) if !values.is_empty() => pending.push((profile, values.as_slice())),
                _ => {
                    result.profiles.insert(profile.name.clone(), None);
                }
            }
        }

        for name in frame.profiles.keys().chain(frame.rejected.keys()) {
            if !self.profiles.iter().any(|p| &p.name == name) {
                debug!("Ignoring unknown profile {} from {}", name, frame.src_ip);
            }
        }

        if pending.is_empty() && invalid.is_empty() {
            return PredictionFrame::failed(frame.src_ip.clone(), self.no_features_message());
        }

        for (profile, err) in invalid {
            result.profiles.insert(profile.name.clone(), Some(self.failure(profile, &frame.src_ip, err)));
        }

        let outcomes = join_all(pending.iter().map(|(profile, values)| self.classify_one(profile, values))).await;

        for ((profile, _), outcome) in pending.iter().zip(outcomes) {
            let outcome = match outcome {
                Ok(c) => ProfileOutcome::Prediction {
                    prediction: c.label,
                    probability: c.probability,
                },
                Err(e) => self.failure(profile, &frame.src_ip, e),
            };
            result.profiles.insert(profile.name.clone(), Some(outcome));
        }

        result
    }

    async fn classify_one(
        &self,
        profile: &Profile,
        values: &[f64],
    ) -> Result<super::Classification, InferenceError> {
        if values.len() != profile.len() {
            return Err(InferenceError::MalformedVector {
                profile: profile.name.clone(),
                expected: profile.len(),
                got: values.len(),
            });
        }

        match tokio::time::timeout(self.timeout, self.classifier.classify(&profile.name, values)).await {
            Ok(result) => result,
            Err(_) => Err(InferenceError::Timeout(self.timeout)),
        }
    }

    fn failure(&self, profile: &Profile, source: &str, err: InferenceError) -> ProfileOutcome {
        warn!("{} prediction failed for {}: {}", profile.name, source, err);
        ProfileOutcome::Error {
            error: format!("{} prediction failed: {}", profile.name, err),
        }
    }

    fn no_features_message(&self) -> String {
        let names: Vec<&str> = self.profiles.iter().map(|p| p.name.as_str()).collect();
        format!("No valid {} features provided", names.join(" or "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::classifier::tests::MockClassifier;

    fn predictor(classifier: MockClassifier) -> Predictor {
        Predictor::new(Arc::new(classifier), Profile::builtin(), Duration::from_millis(200))
    }

    fn frame(ddos: usize, ids: usize) -> FeatureFrame {
        let mut frame = FeatureFrame::new("192.168.1.11");
        frame.profiles.insert("DDoS".into(), vec![0.5; ddos]);
        frame.profiles.insert("IDS".into(), vec![0.5; ids]);
        frame
    }

    #[tokio::test]
    async fn test_both_profiles_classified() {
        let p = predictor(
            MockClassifier::ready()
                .answer("DDoS", "BENIGN", 0.991)
                .answer("IDS", "PortScan", 72.5),
        );
        let result = p.predict(&frame(31, 30)).await;

        assert_eq!(result.source_ip, "192.168.1.11");
        assert!(result.error.is_none());
        assert_eq!(
            result.profiles["DDoS"],
            Some(ProfileOutcome::Prediction {
                prediction: "BENIGN".into(),
                probability: 99.1
            })
        );
        assert_eq!(result.profiles["IDS"].as_ref().and_then(|o| o.label()), Some("PortScan"));
    }

    #[tokio::test]
    async fn test_failure_is_local_to_profile() {
        let p = predictor(MockClassifier::ready().answer("IDS", "BENIGN", 0.9));
        let result = p.predict(&frame(31, 30)).await;

        match &result.profiles["DDoS"] {
            Some(ProfileOutcome::Error { error }) => assert!(error.starts_with("DDoS prediction failed")),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(result.profiles["IDS"].as_ref().and_then(|o| o.label()), Some("BENIGN"));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_length_mismatch_rejected() {
        let p = predictor(MockClassifier::ready().answer("DDoS", "BENIGN", 1.0).answer("IDS", "BENIGN", 1.0));
        let result = p.predict(&frame(5, 30)).await;

        match &result.profiles["DDoS"] {
            Some(ProfileOutcome::Error { error }) => assert!(error.contains("expected 31")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_profile_is_null() {
        let p = predictor(MockClassifier::ready().answer("DDoS", "DDoS", 0.8));
        let result = p.predict(&frame(31, 0)).await;

        assert_eq!(result.profiles["IDS"], None);
        let json = serde_json::to_value(&result).unwrap();
        assert!(json["IDS"].is_null());
        assert_eq!(json["DDoS"]["Prediction"], "DDoS");
    }

    #[tokio::test]
    async fn test_no_features_is_top_level_error() {
        let p = predictor(MockClassifier::ready());
        let result = p.predict(&FeatureFrame::new("10.0.0.9")).await;

        assert_eq!(result.error.as_deref(), Some("No valid DDoS or IDS features provided"));
        assert!(result.profiles.is_empty());
    }

    #[tokio::test]
    async fn test_garbage_profile_does_not_block_the_other() {
        let p = predictor(MockClassifier::ready().answer("DDoS", "DDoS", 0.88).answer("IDS", "BENIGN", 1.0));
        let raw = serde_json::json!({
            "DDoS": vec![0.5; 31],
            "IDS": "garbage",
            "Src_ip": "10.0.0.1",
        });
        let frame: FeatureFrame = serde_json::from_value(raw).unwrap();
        let result = p.predict(&frame).await;

        assert_eq!(result.source_ip, "10.0.0.1");
        assert!(result.error.is_none());
        assert_eq!(result.profiles["DDoS"].as_ref().and_then(|o| o.label()), Some("DDoS"));
        match &result.profiles["IDS"] {
            Some(ProfileOutcome::Error { error }) => {
                assert!(error.starts_with("IDS prediction failed"));
                assert!(error.contains("not a list of numbers"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_only_garbage_profiles_still_report_inline() {
        let p = predictor(MockClassifier::ready());
        let raw = serde_json::json!({ "DDoS": {"bad": true}, "Src_ip": "10.0.0.2" });
        let frame: FeatureFrame = serde_json::from_value(raw).unwrap();
        let result = p.predict(&frame).await;

        assert!(result.error.is_none());
        assert!(matches!(result.profiles["DDoS"], Some(ProfileOutcome::Error { .. })));
        assert_eq!(result.profiles["IDS"], None);
    }

    #[tokio::test]
    async fn test_timeout_reported_inline() {
        let p = predictor(
            MockClassifier::ready()
                .answer("DDoS", "BENIGN", 1.0)
                .answer("IDS", "BENIGN", 1.0)
                .with_delay(Duration::from_secs(2)),
        );
        let result = p.predict(&frame(31, 30)).await;

        for name in ["DDoS", "IDS"] {
            match &result.profiles[name] {
                Some(ProfileOutcome::Error { error }) => assert!(error.contains("timed out")),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }
}
