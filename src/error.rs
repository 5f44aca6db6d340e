//! Error types shared by the sink, the registry and the admission path.

use std::error::Error;
use std::fmt;

/// Errors raised by the sink and its collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// A peer with this id is already registered
    DuplicateId(String),
    /// Offer/answer exchange failed; carries the underlying cause
    Negotiation(String),
    /// A single peer refused a sample
    Delivery { peer_id: String, reason: String },
    /// Admission request did not carry a usable offer
    InvalidOffer(String),
    /// The element is not started (or was stopped mid-operation)
    NotStarted,
    /// The element is already started
    AlreadyStarted,
    /// Operation not allowed in the current state
    InvalidState(String),
    /// The distribution track no longer exists
    TrackClosed,
    /// Transport-level failure outside of negotiation
    Transport(String),
    /// Bad configuration
    Config(String),
}

impl SinkError {
    /// Stable machine-readable code, used in admission error payloads
    pub fn code(&self) -> &'static str {
        match self {
            SinkError::DuplicateId(_) => "duplicate_id",
            SinkError::Negotiation(_) => "negotiation_failed",
            SinkError::Delivery { .. } => "delivery_failed",
            SinkError::InvalidOffer(_) => "invalid_offer",
            SinkError::NotStarted => "not_started",
            SinkError::AlreadyStarted => "already_started",
            SinkError::InvalidState(_) => "invalid_state",
            SinkError::TrackClosed => "track_closed",
            SinkError::Transport(_) => "transport_error",
            SinkError::Config(_) => "invalid_config",
        }
    }

    /// HTTP status the admission endpoint answers with
    pub fn status_code(&self) -> u16 {
        match self {
            SinkError::InvalidOffer(_) | SinkError::Config(_) => 400,
            SinkError::DuplicateId(_) | SinkError::AlreadyStarted | SinkError::InvalidState(_) => 409,
            SinkError::NotStarted | SinkError::TrackClosed => 503,
            SinkError::Negotiation(_) | SinkError::Delivery { .. } | SinkError::Transport(_) => 500,
        }
    }

    /// Whether the producer must stop after seeing this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, SinkError::TrackClosed | SinkError::NotStarted)
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::DuplicateId(id) => write!(f, "Duplicate peer id: {}", id),
            SinkError::Negotiation(msg) => write!(f, "Negotiation failed: {}", msg),
            SinkError::Delivery { peer_id, reason } => {
                write!(f, "Delivery to peer {} failed: {}", peer_id, reason)
            }
            SinkError::InvalidOffer(msg) => write!(f, "Invalid offer: {}", msg),
            SinkError::NotStarted => write!(f, "Sink is not started"),
            SinkError::AlreadyStarted => write!(f, "Sink is already started"),
            SinkError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            SinkError::TrackClosed => write!(f, "Distribution track is closed"),
            SinkError::Transport(msg) => write!(f, "Transport error: {}", msg),
            SinkError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for SinkError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_error_class() {
        assert_eq!(SinkError::InvalidOffer("x".into()).status_code(), 400);
        assert_eq!(SinkError::DuplicateId("a".into()).status_code(), 409);
        assert_eq!(SinkError::NotStarted.status_code(), 503);
        assert_eq!(SinkError::Negotiation("boom".into()).status_code(), 500);
    }

    #[test]
    fn only_producer_contract_errors_are_fatal() {
        assert!(SinkError::TrackClosed.is_fatal());
        assert!(!SinkError::Delivery { peer_id: "p".into(), reason: "full".into() }.is_fatal());
        assert!(!SinkError::Negotiation("x".into()).is_fatal());
    }

    #[test]
    fn negotiation_message_keeps_cause() {
        let err = SinkError::Negotiation("set remote description: bad sdp".into());
        assert_eq!(err.to_string(), "Negotiation failed: set remote description: bad sdp");
    }
}
