//! Named feature vectors
//!
//! The feature set covers both classifier schemas, so several features are
//! exported under two spellings (e.g. `Avg Packet Size` and
//! `Average Packet Size`). Aliases always carry the same value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const FLOW_BYTES_PER_SEC: &str = "Flow Bytes/s";
pub const AVERAGE_PACKET_SIZE: &str = "Average Packet Size";
pub const AVG_PACKET_SIZE: &str = "Avg Packet Size";
pub const TOTAL_LENGTH_FWD_PACKETS: &str = "Total Length of Fwd Packets";
pub const FWD_PACKETS_LENGTH_TOTAL: &str = "Fwd Packets Length Total";
pub const MAX_PACKET_LENGTH: &str = "Max Packet Length";
pub const PACKET_LENGTH_MAX: &str = "Packet Length Max";
pub const MIN_PACKET_LENGTH: &str = "Min Packet Length";
pub const PACKET_LENGTH_MIN: &str = "Packet Length Min";
pub const FWD_PACKET_LENGTH_MAX: &str = "Fwd Packet Length Max";
pub const FWD_PACKET_LENGTH_MIN: &str = "Fwd Packet Length Min";
pub const FWD_PACKET_LENGTH_MEAN: &str = "Fwd Packet Length Mean";
pub const BWD_PACKET_LENGTH_MIN: &str = "Bwd Packet Length Min";
pub const BWD_PACKET_LENGTH_MEAN: &str = "Bwd Packet Length Mean";
pub const FWD_HEADER_LENGTH: &str = "Fwd Header Length";
pub const BWD_HEADER_LENGTH: &str = "Bwd Header Length";
pub const FLOW_DURATION: &str = "Flow Duration";
pub const FWD_PACKETS_PER_SEC: &str = "Fwd Packets/s";
pub const BWD_PACKETS_PER_SEC: &str = "Bwd Packets/s";
pub const FLOW_PACKETS_PER_SEC: &str = "Flow Packets/s";
pub const FWD_IAT_MAX: &str = "Fwd IAT Max";
pub const FWD_IAT_MIN: &str = "Fwd IAT Min";
pub const FWD_IAT_TOTAL: &str = "Fwd IAT Total";
pub const FLOW_IAT_MAX: &str = "Flow IAT Max";
pub const FLOW_IAT_MIN: &str = "Flow IAT Min";
pub const BWD_IAT_MAX: &str = "Bwd IAT Max";
pub const BWD_IAT_TOTAL: &str = "Bwd IAT Total";
pub const FWD_ACT_DATA_PACKETS: &str = "Fwd Act Data Packets";
pub const ACT_DATA_PKT_FWD: &str = "act_data_pkt_fwd";
pub const SUBFLOW_FWD_PACKETS: &str = "Subflow Fwd Packets";
pub const INIT_FWD_WIN_BYTES: &str = "Init Fwd Win Bytes";
pub const INIT_WIN_BYTES_FORWARD: &str = "Init_Win_bytes_forward";
pub const INIT_BWD_WIN_BYTES: &str = "Init Bwd Win Bytes";
pub const INIT_WIN_BYTES_BACKWARD: &str = "Init_Win_bytes_backward";
pub const DOWN_UP_RATIO: &str = "Down/Up Ratio";
pub const AVG_FWD_SEGMENT_SIZE: &str = "Avg Fwd Segment Size";
pub const ACK_FLAG_COUNT: &str = "ACK Flag Count";
pub const URG_FLAG_COUNT: &str = "URG Flag Count";

/// Every feature name the extractor produces
pub const FEATURE_NAMES: &[&str] = &[
    FLOW_BYTES_PER_SEC,
    AVERAGE_PACKET_SIZE,
    AVG_PACKET_SIZE,
    TOTAL_LENGTH_FWD_PACKETS,
    FWD_PACKETS_LENGTH_TOTAL,
    MAX_PACKET_LENGTH,
    PACKET_LENGTH_MAX,
    MIN_PACKET_LENGTH,
    PACKET_LENGTH_MIN,
    FWD_PACKET_LENGTH_MAX,
    FWD_PACKET_LENGTH_MIN,
    FWD_PACKET_LENGTH_MEAN,
    BWD_PACKET_LENGTH_MIN,
    BWD_PACKET_LENGTH_MEAN,
    FWD_HEADER_LENGTH,
    BWD_HEADER_LENGTH,
    FLOW_DURATION,
    FWD_PACKETS_PER_SEC,
    BWD_PACKETS_PER_SEC,
    FLOW_PACKETS_PER_SEC,
    FWD_IAT_MAX,
    FWD_IAT_MIN,
    FWD_IAT_TOTAL,
    FLOW_IAT_MAX,
    FLOW_IAT_MIN,
    BWD_IAT_MAX,
    BWD_IAT_TOTAL,
    FWD_ACT_DATA_PACKETS,
    ACT_DATA_PKT_FWD,
    SUBFLOW_FWD_PACKETS,
    INIT_FWD_WIN_BYTES,
    INIT_WIN_BYTES_FORWARD,
    INIT_BWD_WIN_BYTES,
    INIT_WIN_BYTES_BACKWARD,
    DOWN_UP_RATIO,
    AVG_FWD_SEGMENT_SIZE,
    ACK_FLAG_COUNT,
    URG_FLAG_COUNT,
];

/// Number of features extracted
pub const NUM_FEATURES: usize = 38;

/// Immutable snapshot of every feature for one packet event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    values: BTreeMap<String, f64>,
}

impl FeatureVector {
    /// Build from name/value pairs. Non-finite values are stored as 0.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(name, value)| (name.into(), finite_or_zero(value)))
                .collect(),
        }
    }

    /// Get feature by name
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of features
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Clamp NaN and infinities to 0
pub fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_feature_names_are_unique() {
        let unique: HashSet<_> = FEATURE_NAMES.iter().collect();
        assert_eq!(unique.len(), FEATURE_NAMES.len());
        assert_eq!(FEATURE_NAMES.len(), NUM_FEATURES);
    }

    #[test]
    fn test_non_finite_values_are_clamped() {
        let vector = FeatureVector::from_pairs([
            (FLOW_DURATION, f64::NAN),
            (FLOW_BYTES_PER_SEC, f64::INFINITY),
            (DOWN_UP_RATIO, 2.5),
        ]);
        assert_eq!(vector.get(FLOW_DURATION), Some(0.0));
        assert_eq!(vector.get(FLOW_BYTES_PER_SEC), Some(0.0));
        assert_eq!(vector.get(DOWN_UP_RATIO), Some(2.5));
        assert_eq!(vector.get("Nope"), None);
    }
}
