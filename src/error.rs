use serde::{Deserialize, Serialize};

/// Error kind reported to the observer alongside the human-readable reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ConnectionError,
    CommandError,
    SafetyViolation,
    PatrolValidationError,
    EmergencyTriggered,
}

/// Every fallible flight operation resolves to one of these.
///
/// `SafetyViolation` and `PatrolValidation` never reach the transport.
/// `Command` means the transport rejected or timed out a dispatched command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlightError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command error: {0}")]
    Command(String),

    #[error("safety violation: {0}")]
    SafetyViolation(String),

    #[error("patrol validation failed: {0}")]
    PatrolValidation(String),

    #[error("emergency triggered: {0}")]
    EmergencyTriggered(String),
}

impl FlightError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::ConnectionError,
            Self::Command(_) => ErrorKind::CommandError,
            Self::SafetyViolation(_) => ErrorKind::SafetyViolation,
            Self::PatrolValidation(_) => ErrorKind::PatrolValidationError,
            Self::EmergencyTriggered(_) => ErrorKind::EmergencyTriggered,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Connection(r)
            | Self::Command(r)
            | Self::SafetyViolation(r)
            | Self::PatrolValidation(r)
            | Self::EmergencyTriggered(r) => r,
        }
    }

    pub fn is_safety_violation(&self) -> bool {
        matches!(self, Self::SafetyViolation(_))
    }
}

/// Failures reported by a [`crate::transport::LinkTransport`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("link not open")]
    NotConnected,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("link i/o error: {0}")]
    Io(String),
}

impl From<TransportError> for FlightError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotConnected | TransportError::Handshake(_) => {
                FlightError::Connection(e.to_string())
            }
            TransportError::Rejected(_) | TransportError::Timeout(_) | TransportError::Io(_) => {
                FlightError::Command(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_reason() {
        let err = FlightError::SafetyViolation("battery 15% below minimum 20%".into());
        assert_eq!(err.kind(), ErrorKind::SafetyViolation);
        assert_eq!(err.reason(), "battery 15% below minimum 20%");
        assert!(err.is_safety_violation());
        assert_eq!(err.to_string(), "safety violation: battery 15% below minimum 20%");
    }

    #[test]
    fn test_transport_error_mapping() {
        let handshake: FlightError = TransportError::Handshake("no reply".into()).into();
        assert_eq!(handshake.kind(), ErrorKind::ConnectionError);

        let timeout: FlightError = TransportError::Timeout("land").into();
        assert_eq!(timeout.kind(), ErrorKind::CommandError);
        assert!(timeout.reason().contains("land"));
    }
}
