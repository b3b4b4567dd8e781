//! Error taxonomy
//!
//! Every stage-local failure maps to one of these enums. None of them is
//! allowed to cross a link boundary as a fault: transport errors feed the
//! reconnect loop, capture errors feed the backoff loop, inference errors
//! become inline `{"error": ..}` entries, supervision errors become JSON
//! failure responses.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Connect/send/frame failures on a StreamLink
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("link closed by peer")]
    Closed,

    #[error("frame too large: {size} bytes (limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Driver failures while acquiring packets
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("permission denied opening capture: {0}")]
    Permission(String),

    #[error("capture device error: {0}")]
    Device(String),

    #[error("capture source unavailable: {0}")]
    Unavailable(String),

    #[error("end of capture source")]
    Exhausted,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl CaptureError {
    /// Classify a driver message, mapping privilege failures to `Permission`
    pub fn from_driver_message(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        let lower = msg.to_lowercase();
        if lower.contains("permission") || lower.contains("not permitted") {
            CaptureError::Permission(msg)
        } else {
            CaptureError::Device(msg)
        }
    }

    pub fn is_permission(&self) -> bool {
        match self {
            CaptureError::Permission(_) => true,
            CaptureError::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}

/// A packet field needed by a feature could not be read
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FeatureComputeError {
    #[error("missing packet field: {0}")]
    MissingField(&'static str),

    #[error("non-finite value for feature {0}")]
    NonFinite(&'static str),
}

/// Classification failure for a single profile
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("{profile} vector has {got} values, expected {expected}")]
    MalformedVector {
        profile: String,
        expected: usize,
        got: usize,
    },

    #[error("{profile} vector is not a list of numbers: {reason}")]
    InvalidVector { profile: String, reason: String },

    #[error("classifier error: {0}")]
    Classifier(String),

    #[error("classifier timed out after {0:?}")]
    Timeout(Duration),

    #[error("Models not loaded")]
    NotReady,
}

impl From<reqwest::Error> for InferenceError {
    fn from(err: reqwest::Error) -> Self {
        InferenceError::Classifier(err.to_string())
    }
}

/// Spawn/terminate failures of stage processes
#[derive(Debug, Error)]
pub enum SupervisionError {
    #[error("failed to spawn {stage}: {source}")]
    Spawn {
        stage: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{stage} exited during startup ({status}): {stderr}")]
    EarlyExit {
        stage: &'static str,
        status: String,
        stderr: String,
    },

    #[error("failed to terminate {stage} (pid {pid})")]
    Terminate { stage: &'static str, pid: u32 },

    #[error("cannot locate stage executable: {0}")]
    Executable(io::Error),
}

/// Configuration read/parse failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_message_classification() {
        let err = CaptureError::from_driver_message("eth0: You don't have permission to capture on that device");
        assert!(err.is_permission());

        let err = CaptureError::from_driver_message("socket: Operation not permitted");
        assert!(err.is_permission());

        let err = CaptureError::from_driver_message("No such device exists");
        assert!(!err.is_permission());
    }

    #[test]
    fn test_io_permission_is_permission() {
        let err = CaptureError::Io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(err.is_permission());
    }
}
