use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::engine::CaptureConfig;
use crate::error::ConfigError;
use crate::features::Profile;
use crate::flow::FlowConfig;
use crate::inference::InferenceConfig;
use crate::link::LinkConfig;
use crate::supervisor::relay::RelayConfig;
use crate::supervisor::SupervisorConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub flow: FlowConfig,

    #[serde(default)]
    pub link: LinkConfig,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Feature profiles, in the order they appear on the wire
    #[serde(default = "Profile::builtin")]
    pub profiles: Vec<Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            flow: FlowConfig::default(),
            link: LinkConfig::default(),
            inference: InferenceConfig::default(),
            relay: RelayConfig::default(),
            supervisor: SupervisorConfig::default(),
            profiles: Profile::builtin(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// First existing file among the default locations
    pub fn locate() -> Option<PathBuf> {
        let paths = [
            PathBuf::from("/etc/flowsight/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("flowsight/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        paths.into_iter().find(|p| p.is_file())
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match Self::locate() {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content).map_err(|source| ConfigError::Write {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        Ok(())
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.profiles.is_empty() {
            return Err(ConfigError::Invalid("at least one profile is required".into()));
        }

        let mut names = HashSet::new();
        for profile in &self.profiles {
            if profile.is_empty() {
                return Err(ConfigError::Invalid(format!("profile {} has no features", profile.name)));
            }
            if !names.insert(profile.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate profile {}", profile.name)));
            }
            if profile.name == "Src_ip" || profile.name == "Source_ip" || profile.name == "error" {
                return Err(ConfigError::Invalid(format!("reserved profile name {}", profile.name)));
            }
            let unknown = profile.unknown_features();
            if !unknown.is_empty() {
                warn!("Profile {} names unknown features (always 0): {:?}", profile.name, unknown);
            }
        }

        if self.capture.queue_capacity == 0 || self.capture.handoff_capacity == 0 {
            return Err(ConfigError::Invalid("capture queues need a non-zero capacity".into()));
        }
        if self.flow.max_flows == 0 {
            return Err(ConfigError::Invalid("flow.max_flows must be positive".into()));
        }
        Ok(())
    }

    /// Profile names in wire order
    pub fn profile_names(&self) -> Vec<String> {
        self.profiles.iter().map(|p| p.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.profile_names(), vec!["DDoS", "IDS"]);
        assert_eq!(config.link.hub_addr, "127.0.0.1:8765");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.profiles, config.profiles);
        assert_eq!(parsed.flow.max_flows, config.flow.max_flows);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[capture]
allowed_sources = ["192.168.1.11", "192.168.1.2"]

[flow]
idle_timeout_secs = 30.0
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.capture.allowed_sources.len(), 2);
        assert_eq!(config.flow.idle_timeout_secs, 30.0);
        assert_eq!(config.flow.max_flows, FlowConfig::default().max_flows);
        assert_eq!(config.profiles.len(), 2);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = Config::default();
        config.relay.benign_label = "Normal".into();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.relay.benign_label, "Normal");
    }

    #[test]
    fn test_invalid_profiles_rejected() {
        let mut config = Config::default();
        config.profiles.push(Profile::ddos());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.profiles = vec![Profile::new("Empty", 1, &[])];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[flow\nmax_flows = ").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }
}
