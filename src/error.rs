//! Signalling error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignallingError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("unknown call: {0}")]
    UnknownCall(String),

    #[error("invalid state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("operation not valid here: {0}")]
    InvalidOperation(&'static str),

    #[error("homeserver transport: {0}")]
    Transport(String),

    #[error("device message encryption: {0}")]
    Encryption(String),

    #[error("webrtc engine: {0}")]
    WebRtc(String),

    #[error("outgoing call lost glare resolution")]
    GlareLost,
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
