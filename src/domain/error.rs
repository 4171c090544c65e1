//! Coordinator error taxonomy
//!
//! These never escape an RPC handler: every entry point renders them into a
//! `{message}` reply and carries on.

use thiserror::Error;

/// Failure talking to a device
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("timed out after {0} ms")]
    Timeout(u64),
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("rejected with HTTP {0}")]
    Rejected(u16),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinatorError {
    #[error("No registered device matches {0}")]
    NotRegistered(String),
    #[error("Device {device} unavailable: {source}")]
    DownstreamUnavailable {
        device: String,
        #[source]
        source: DeviceError,
    },
    #[error("No barrier client connected")]
    MissingBarrier,
    #[error("{0}")]
    AuthenticationFailure(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl CoordinatorError {
    pub fn downstream(device: impl std::fmt::Display, source: DeviceError) -> Self {
        CoordinatorError::DownstreamUnavailable { device: device.to_string(), source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = CoordinatorError::downstream("road_light/north", DeviceError::Timeout(2000));
        assert_eq!(err.to_string(), "Device road_light/north unavailable: timed out after 2000 ms");
        assert_eq!(
            CoordinatorError::NotRegistered("road_light".to_string()).to_string(),
            "No registered device matches road_light"
        );
        assert_eq!(CoordinatorError::MissingBarrier.to_string(), "No barrier client connected");
    }
}
