//! Core identifier and media types shared across the signalling crate.
//!
//! Matrix identifiers are opaque strings on the wire; each gets its own
//! newtype so a `SessionId` cannot be passed where a `DeviceId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

opaque_id!(
    /// A Matrix user id (`@alice:example.org`).
    UserId
);
opaque_id!(
    /// A device id within a user's account.
    DeviceId
);
opaque_id!(
    /// A Matrix room id (`!room:example.org`).
    RoomId
);
opaque_id!(
    /// Conference id: the state key of the `m.call` event.
    ConfId
);
opaque_id!(
    /// Identifier of one call leg, minted by the initiator.
    CallId
);
opaque_id!(
    /// Per-client-incarnation session id; a change means the peer restarted.
    SessionId
);
opaque_id!(
    /// The `party_id` carried on signalling messages.
    PartyId
);

fn random_hex_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl ConfId {
    /// Generate a conference id for a locally initiated call.
    pub fn generate() -> Self {
        Self(random_hex_id())
    }
}

impl CallId {
    /// Generate a new random call id (32 lowercase hex characters).
    pub fn generate() -> Self {
        Self(random_hex_id())
    }
}

impl SessionId {
    /// Generate a session id for this client incarnation.
    pub fn generate() -> Self {
        Self(random_hex_id())
    }
}

/// Uniquely identifies a participating device within a conference.
///
/// Ordered lexicographically by `(user_id, device_id)`; initiator selection
/// and the polite/impolite split are plain comparisons on this key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberKey {
    pub user_id: UserId,
    pub device_id: DeviceId,
}

impl MemberKey {
    pub fn new(user_id: UserId, device_id: DeviceId) -> Self {
        Self { user_id, device_id }
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.device_id)
    }
}

/// Call leg direction from our perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Reason for ending a call leg, as carried in `m.call.hangup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallHangupReason {
    IceFailed,
    IceTimeout,
    InviteTimeout,
    UserHangup,
    UserMediaFailed,
    UserBusy,
    AnsweredElsewhere,
    Replaced,
    Transferred,
    NewSession,
    #[default]
    #[serde(other)]
    UnknownError,
}

impl CallHangupReason {
    /// Whether the Member may re-run `connect()` after this reason.
    ///
    /// Deliberate terminations are final; infrastructure failures are not.
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::UserHangup
                | Self::AnsweredElsewhere
                | Self::Replaced
                | Self::UserBusy
                | Self::Transferred
                | Self::NewSession
        )
    }
}

/// SDP description type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP blob with its type, passed through opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One ICE candidate as carried in `m.call.candidates`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }

    /// The end-of-gathering sentinel: an empty candidate string.
    pub fn end_of_candidates() -> Self {
        Self::new("")
    }

    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.is_empty()
    }
}

/// Kind of a local media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Handle to one locally captured track. The engine owns the actual media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

impl MediaTrack {
    pub fn audio(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Audio,
        }
    }

    pub fn video(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Video,
        }
    }
}

/// The locally captured media shared read-only with every call leg.
///
/// Owned by the GroupCall while joined; legs hold weak references.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalMedia {
    pub stream_id: String,
    pub tracks: Vec<MediaTrack>,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
        }
    }

    /// Track ids in order; renegotiation is needed iff this set changes.
    pub fn track_ids(&self) -> Vec<&str> {
        self.tracks.iter().map(|t| t.id.as_str()).collect()
    }
}

/// Local mute state, fanned out as SDP stream metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MuteSettings {
    pub audio_muted: bool,
    pub video_muted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_hex_and_unique() {
        for _ in 0..50 {
            let id = CallId::generate();
            assert_eq!(id.as_str().len(), 32);
            assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        }
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn test_member_key_ordering_is_lexicographic() {
        let a1 = MemberKey::new("@a:hs".into(), "D1".into());
        let a2 = MemberKey::new("@a:hs".into(), "D2".into());
        let b1 = MemberKey::new("@b:hs".into(), "D1".into());

        assert!(a1 < a2, "same user orders by device id");
        assert!(a2 < b1, "user id dominates device id");
    }

    #[test]
    fn test_hangup_reason_retryability() {
        assert!(CallHangupReason::IceFailed.is_retryable());
        assert!(CallHangupReason::IceTimeout.is_retryable());
        assert!(CallHangupReason::UnknownError.is_retryable());

        assert!(!CallHangupReason::UserHangup.is_retryable());
        assert!(!CallHangupReason::AnsweredElsewhere.is_retryable());
        assert!(!CallHangupReason::Replaced.is_retryable());
        assert!(!CallHangupReason::UserBusy.is_retryable());
        assert!(!CallHangupReason::Transferred.is_retryable());
        assert!(!CallHangupReason::NewSession.is_retryable());
    }

    #[test]
    fn test_hangup_reason_wire_names() {
        let json = serde_json::to_string(&CallHangupReason::IceFailed).unwrap();
        assert_eq!(json, "\"ice_failed\"");

        let parsed: CallHangupReason = serde_json::from_str("\"user_hangup\"").unwrap();
        assert_eq!(parsed, CallHangupReason::UserHangup);

        // Forward compatibility: unrecognized reasons decode to UnknownError.
        let parsed: CallHangupReason = serde_json::from_str("\"some_future_reason\"").unwrap();
        assert_eq!(parsed, CallHangupReason::UnknownError);
    }

    #[test]
    fn test_end_of_candidates_sentinel() {
        assert!(IceCandidate::end_of_candidates().is_end_of_candidates());
        assert!(!IceCandidate::new("candidate:1 1 udp ...").is_end_of_candidates());
    }
}
