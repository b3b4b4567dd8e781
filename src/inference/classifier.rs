//! Classifier seam
//!
//! The model itself lives outside this crate. [`HttpClassifier`] talks to a
//! model server over HTTP:
//! - `GET  {url}/health` → any 2xx means the models are loaded
//! - `POST {url}/classify` with `{"profile", "features"}` →
//!   `{"prediction", "probability"}`

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::InferenceError;

/// Label and confidence for one vector
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    /// Percentage in [0, 100], two decimals
    pub probability: f64,
}

/// Something that can label a projected feature vector
#[async_trait]
pub trait Classifier: Send + Sync + Debug {
    /// Classifier name for logs
    fn name(&self) -> &str;

    /// Models are loaded and requests will be served
    async fn is_ready(&self) -> bool;

    /// Classify one profile's vector
    async fn classify(&self, profile: &str, features: &[f64]) -> Result<Classification, InferenceError>;
}

/// Map a probability in [0, 1] or [0, 100] onto a two-decimal percentage
pub fn normalize_probability(p: f64) -> f64 {
    if !p.is_finite() || p < 0.0 {
        return 0.0;
    }
    let pct = if p <= 1.0 { p * 100.0 } else { p.min(100.0) };
    (pct * 100.0).round() / 100.0
}

/// Classifier server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClassifierConfig {
    /// Base URL of the model server
    pub url: String,
    /// Per-request timeout (seconds)
    pub timeout_secs: f64,
}

impl Default for HttpClassifierConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9000".to_string(),
            timeout_secs: 5.0,
        }
    }
}

/// HTTP model server client
#[derive(Debug)]
pub struct HttpClassifier {
    config: HttpClassifierConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct ClassifyRequest<'a> {
    profile: &'a str,
    features: &'a [f64],
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    prediction: String,
    #[serde(default)]
    probability: f64,
}

impl HttpClassifier {
    pub fn new(config: HttpClassifierConfig) -> Result<Self, InferenceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_secs.max(0.1)))
            .build()?;
        Ok(Self { config, client })
    }

    fn classify_url(&self) -> String {
        format!("{}/classify", self.config.url.trim_end_matches('/'))
    }

    fn health_url(&self) -> String {
        format!("{}/health", self.config.url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    fn name(&self) -> &str {
        "http"
    }

    async fn is_ready(&self) -> bool {
        match self.client.get(self.health_url()).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Classifier health check failed: {}", e);
                false
            }
        }
    }

    async fn classify(&self, profile: &str, features: &[f64]) -> Result<Classification, InferenceError> {
        let resp = self
            .client
            .post(self.classify_url())
            .json(&ClassifyRequest { profile, features })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(InferenceError::Classifier(format!("HTTP {}: {}", status, body.trim())));
        }

        let parsed: ClassifyResponse = resp.json().await?;
        Ok(Classification {
            label: parsed.prediction,
            probability: normalize_probability(parsed.probability),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Fixed answers per profile; profiles without an answer fail
    #[derive(Debug, Default)]
    pub(crate) struct MockClassifier {
        pub ready: bool,
        pub answers: HashMap<String, (String, f64)>,
        pub delay: Option<Duration>,
    }

    impl MockClassifier {
        pub(crate) fn ready() -> Self {
            Self {
                ready: true,
                ..Default::default()
            }
        }

        pub(crate) fn answer(mut self, profile: &str, label: &str, p: f64) -> Self {
            self.answers.insert(profile.to_string(), (label.to_string(), p));
            self
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }
    }

    #[async_trait]
    impl Classifier for MockClassifier {
        fn name(&self) -> &str {
            "mock"
        }

        async fn is_ready(&self) -> bool {
            self.ready
        }

        async fn classify(&self, profile: &str, _features: &[f64]) -> Result<Classification, InferenceError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.answers.get(profile) {
                Some((label, p)) => Ok(Classification {
                    label: label.clone(),
                    probability: normalize_probability(*p),
                }),
                None => Err(InferenceError::Classifier(format!("no model for {}", profile))),
            }
        }
    }

    #[test]
    fn test_normalize_probability() {
        assert_eq!(normalize_probability(0.98765), 98.77);
        assert_eq!(normalize_probability(1.0), 100.0);
        assert_eq!(normalize_probability(87.456), 87.46);
        assert_eq!(normalize_probability(250.0), 100.0);
        assert_eq!(normalize_probability(-0.5), 0.0);
        assert_eq!(normalize_probability(f64::NAN), 0.0);
    }

    #[test]
    fn test_urls_tolerate_trailing_slash() {
        let classifier = HttpClassifier::new(HttpClassifierConfig {
            url: "http://models:9000/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(classifier.classify_url(), "http://models:9000/classify");
        assert_eq!(classifier.health_url(), "http://models:9000/health");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_not_ready() {
        let classifier = HttpClassifier::new(HttpClassifierConfig {
            url: "http://127.0.0.1:1".into(),
            timeout_secs: 1.0,
        })
        .unwrap();
        assert!(!classifier.is_ready().await);
        assert!(classifier.classify("DDoS", &[0.0]).await.is_err());
    }
}
