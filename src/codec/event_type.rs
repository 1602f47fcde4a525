//! Call event type definitions.
//!
//! These are the `m.call.*` event types used for conference signalling:
//! two room-state families and seven to-device message types.

use std::fmt;

/// Event types for call control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallEventType {
    /// Conference state event; state key is the conference id.
    Call,
    /// Per-user membership state event; state key is the user id.
    CallMember,
    /// Initial offer for one leg.
    Invite,
    /// Answer to an invite.
    Answer,
    /// ICE candidates for an established or establishing leg.
    Candidates,
    /// Leg terminated by either side, with a reason.
    Hangup,
    /// Leg declined before setup.
    Reject,
    /// SDP re-exchange on an established leg.
    Negotiate,
    /// Mute/purpose metadata update for the sender's streams.
    SdpStreamMetadataChanged,
}

impl CallEventType {
    /// All event types, state events first.
    pub const ALL: [CallEventType; 9] = [
        Self::Call,
        Self::CallMember,
        Self::Invite,
        Self::Answer,
        Self::Candidates,
        Self::Hangup,
        Self::Reject,
        Self::Negotiate,
        Self::SdpStreamMetadataChanged,
    ];

    /// The wire event type string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "m.call",
            Self::CallMember => "m.call.member",
            Self::Invite => "m.call.invite",
            Self::Answer => "m.call.answer",
            Self::Candidates => "m.call.candidates",
            Self::Hangup => "m.call.hangup",
            Self::Reject => "m.call.reject",
            Self::Negotiate => "m.call.negotiate",
            Self::SdpStreamMetadataChanged => "m.call.sdp_stream_metadata_changed",
        }
    }

    /// Parse from a wire event type string.
    pub fn from_type(event_type: &str) -> Option<Self> {
        match event_type {
            "m.call" => Some(Self::Call),
            "m.call.member" => Some(Self::CallMember),
            "m.call.invite" => Some(Self::Invite),
            "m.call.answer" => Some(Self::Answer),
            "m.call.candidates" => Some(Self::Candidates),
            "m.call.hangup" => Some(Self::Hangup),
            "m.call.reject" => Some(Self::Reject),
            "m.call.negotiate" => Some(Self::Negotiate),
            "m.call.sdp_stream_metadata_changed" => Some(Self::SdpStreamMetadataChanged),
            _ => None,
        }
    }

    /// Whether this type travels as room state.
    pub const fn is_state_event(&self) -> bool {
        matches!(self, Self::Call | Self::CallMember)
    }

    /// Whether this type travels as a to-device message.
    pub const fn is_to_device(&self) -> bool {
        !self.is_state_event()
    }

    /// Whether this type terminates a leg.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Hangup | Self::Reject)
    }
}

impl fmt::Display for CallEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
