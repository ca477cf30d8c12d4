use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated by the flow dashboard.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum DashboardError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("HTTP error status: {0}")]
    Status(u16),

    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error("invalid timestamp: {0}")]
    Timestamp(String),

    #[error("sample at {incoming} is older than latest sample at {latest}")]
    OutOfOrder {
        latest: DateTime<Utc>,
        incoming: DateTime<Utc>,
    },

    #[error("local storage failed: {0}")]
    Storage(String),

    #[error("negotiate failed: {0}")]
    Negotiate(String),

    #[error("hub handshake rejected: {0}")]
    Handshake(String),

    #[error("WebSocket error: {0}")]
    Socket(String),
}

impl DashboardError {
    /// Determine if an error came from the network path, in which case the caller logs it
    /// and continues with whatever state it already has.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_transport(&self) -> bool {
        match self {
            DashboardError::Http(_)
            | DashboardError::Status(_)
            | DashboardError::Negotiate(_)
            | DashboardError::Handshake(_)
            | DashboardError::Socket(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for DashboardError {
    fn from(value: reqwest::Error) -> Self {
        match value.status() {
            Some(status) => Self::Status(status.as_u16()),
            None => Self::Http(value.to_string()),
        }
    }
}

impl From<serde_json::Error> for DashboardError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

impl From<std::io::Error> for DashboardError {
    fn from(value: std::io::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DashboardError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Socket(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dashboard_error_is_transport() {
        struct TestCase {
            input: DashboardError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: transport w/ DashboardError::Http
                input: DashboardError::Http("connection refused".to_string()),
                expected: true,
            },
            TestCase {
                // TC1: transport w/ DashboardError::Status
                input: DashboardError::Status(503),
                expected: true,
            },
            TestCase {
                // TC2: not transport w/ DashboardError::Decode
                input: DashboardError::Decode("expected value at line 1".to_string()),
                expected: false,
            },
            TestCase {
                // TC3: not transport w/ DashboardError::Timestamp
                input: DashboardError::Timestamp("yesterday".to_string()),
                expected: false,
            },
            TestCase {
                // TC4: transport w/ DashboardError::Socket
                input: DashboardError::Socket("Connection reset without closing handshake".to_string()),
                expected: true,
            },
            TestCase {
                // TC5: not transport w/ DashboardError::Storage
                input: DashboardError::from(std::io::Error::other("disk full")),
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.is_transport();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_json_error_maps_to_decode() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(DashboardError::from(err), DashboardError::Decode(_)));
    }
}
