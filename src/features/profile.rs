//! Classifier profiles
//!
//! A profile is the ordered list of feature names one downstream classifier
//! expects. The float order on the wire is fixed by this list, so any change
//! to a built-in list must bump its version.

use serde::{Deserialize, Serialize};

use super::vector::*;
use crate::link::messages::FeatureFrame;

/// Ordered, versioned feature schema for one consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub features: Vec<String>,
}

fn default_version() -> u32 {
    1
}

const DDOS_FEATURES: &[&str] = &[
    FLOW_BYTES_PER_SEC,
    AVG_PACKET_SIZE,
    FWD_PACKETS_LENGTH_TOTAL,
    PACKET_LENGTH_MAX,
    FWD_HEADER_LENGTH,
    PACKET_LENGTH_MIN,
    FWD_ACT_DATA_PACKETS,
    FWD_IAT_MAX,
    FLOW_IAT_MIN,
    ACK_FLAG_COUNT,
    AVG_FWD_SEGMENT_SIZE,
    INIT_FWD_WIN_BYTES,
    FWD_PACKET_LENGTH_MAX,
    FLOW_DURATION,
    FWD_PACKETS_PER_SEC,
    FLOW_IAT_MAX,
    FWD_IAT_MIN,
    FLOW_PACKETS_PER_SEC,
    FWD_IAT_TOTAL,
    BWD_PACKETS_PER_SEC,
    URG_FLAG_COUNT,
    BWD_PACKET_LENGTH_MIN,
    INIT_BWD_WIN_BYTES,
    FWD_PACKET_LENGTH_MIN,
    DOWN_UP_RATIO,
    FWD_PACKET_LENGTH_MEAN,
    BWD_IAT_MAX,
    BWD_PACKET_LENGTH_MEAN,
    BWD_IAT_TOTAL,
    BWD_HEADER_LENGTH,
    SUBFLOW_FWD_PACKETS,
];

const IDS_FEATURES: &[&str] = &[
    FLOW_BYTES_PER_SEC,
    AVERAGE_PACKET_SIZE,
    TOTAL_LENGTH_FWD_PACKETS,
    FWD_PACKET_LENGTH_MAX,
    FLOW_DURATION,
    FWD_HEADER_LENGTH,
    FWD_PACKETS_PER_SEC,
    MIN_PACKET_LENGTH,
    MAX_PACKET_LENGTH,
    FWD_IAT_MAX,
    FLOW_IAT_MAX,
    FLOW_IAT_MIN,
    FWD_IAT_MIN,
    FWD_IAT_TOTAL,
    BWD_PACKETS_PER_SEC,
    URG_FLAG_COUNT,
    ACK_FLAG_COUNT,
    AVG_FWD_SEGMENT_SIZE,
    INIT_WIN_BYTES_FORWARD,
    FWD_PACKET_LENGTH_MIN,
    DOWN_UP_RATIO,
    FWD_PACKET_LENGTH_MEAN,
    BWD_IAT_MAX,
    BWD_PACKET_LENGTH_MEAN,
    BWD_IAT_TOTAL,
    BWD_PACKET_LENGTH_MIN,
    BWD_HEADER_LENGTH,
    SUBFLOW_FWD_PACKETS,
    INIT_WIN_BYTES_BACKWARD,
    ACT_DATA_PKT_FWD,
];

impl Profile {
    pub fn new(name: impl Into<String>, version: u32, features: &[&str]) -> Self {
        Self {
            name: name.into(),
            version,
            features: features.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// DDoS classifier schema (31 features)
    pub fn ddos() -> Self {
        Self::new("DDoS", 1, DDOS_FEATURES)
    }

    /// Intrusion classifier schema (30 features)
    pub fn ids() -> Self {
        Self::new("IDS", 1, IDS_FEATURES)
    }

    /// Both built-in profiles in wire order
    pub fn builtin() -> Vec<Self> {
        vec![Self::ddos(), Self::ids()]
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Values in profile order. Names the vector lacks are 0.
    pub fn project(&self, vector: &FeatureVector) -> Vec<f64> {
        self.features
            .iter()
            .map(|name| vector.get(name).unwrap_or(0.0))
            .collect()
    }

    /// Names not produced by the extractor; they always project to 0
    pub fn unknown_features(&self) -> Vec<&str> {
        self.features
            .iter()
            .map(String::as_str)
            .filter(|name| !FEATURE_NAMES.contains(name))
            .collect()
    }
}

/// Project `vector` onto every profile and tag it with the source address
pub fn project_all(profiles: &[Profile], vector: &FeatureVector, source: &str) -> FeatureFrame {
    let mut frame = FeatureFrame::new(source);
    for profile in profiles {
        frame
            .profiles
            .insert(profile.name.clone(), profile.project(vector));
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lengths() {
        assert_eq!(Profile::ddos().len(), 31);
        assert_eq!(Profile::ids().len(), 30);
        assert!(Profile::ddos().unknown_features().is_empty());
        assert!(Profile::ids().unknown_features().is_empty());
    }

    #[test]
    fn test_builtin_order() {
        let ddos = Profile::ddos();
        assert_eq!(ddos.features[0], "Flow Bytes/s");
        assert_eq!(ddos.features[1], "Avg Packet Size");
        assert_eq!(ddos.features[30], "Subflow Fwd Packets");

        let ids = Profile::ids();
        assert_eq!(ids.features[1], "Average Packet Size");
        assert_eq!(ids.features[18], "Init_Win_bytes_forward");
        assert_eq!(ids.features[29], "act_data_pkt_fwd");
    }

    #[test]
    fn test_projection_fills_missing_with_zero() {
        let profile = Profile::new("custom", 1, &[FLOW_DURATION, "Does Not Exist", DOWN_UP_RATIO]);
        let vector = FeatureVector::from_pairs([(FLOW_DURATION, 1.5), (DOWN_UP_RATIO, 0.25)]);

        let projected = profile.project(&vector);
        assert_eq!(projected, vec![1.5, 0.0, 0.25]);
        assert_eq!(profile.unknown_features(), vec!["Does Not Exist"]);
    }

    #[test]
    fn test_projection_length_matches_profile() {
        let vector = FeatureVector::default();
        for profile in Profile::builtin() {
            let projected = profile.project(&vector);
            assert_eq!(projected.len(), profile.len());
            assert!(projected.iter().all(|v| *v == 0.0));
        }
    }

    #[test]
    fn test_project_all() {
        let vector = FeatureVector::from_pairs([(FLOW_DURATION, 2.0)]);
        let frame = project_all(&Profile::builtin(), &vector, "192.168.1.11");

        assert_eq!(frame.src_ip, "192.168.1.11");
        assert_eq!(frame.profiles.len(), 2);
        assert_eq!(frame.profiles["DDoS"][13], 2.0);
        assert_eq!(frame.profiles["IDS"][4], 2.0);
    }
}
