//! Group call signalling core for a Matrix client.
//!
//! This crate coordinates a multi-party WebRTC conference by exchanging
//! control events through the homeserver: the `m.call` / `m.call.member`
//! room-state pair describes who is in which conference on which device, and
//! `m.call.*` to-device messages drive one peer-to-peer leg per remote
//! device through its lifecycle.
//!
//! # Architecture
//!
//! - [`codec`] types: the wire schema (state event content, to-device
//!   message envelope and payloads)
//! - [`PeerCall`]: state machine for one leg, wrapping the injected WebRTC
//!   engine
//! - [`Member`]: one leg per remote device, initiator selection and retries
//! - [`GroupCall`]: one conference; membership reconciliation and buffering
//!   of messages that arrive before their sender's membership
//! - [`CallRegistry`]: dispatches inbound events to the right conference
//!
//! The homeserver transport, device-message encrypter and WebRTC engine are
//! injected behind the traits in [`external`]; the core itself performs no
//! I/O and is driven entirely by inbound events and local intents.

mod codec;
mod error;
mod events;
mod external;
mod group_call;
mod member;
mod peer_call;
mod registry;
#[cfg(test)]
mod test_support;
mod types;

pub use codec::{
    CallContent, CallEventType, FeedPurpose, GroupCallIntent, GroupCallKind, MemberCallEntry,
    MemberContent, MemberDevice, MemberFeed, MessageEnvelope, SignallingMessage,
    SignallingPayload, VOIP_VERSION,
};
pub use error::{InvalidTransition, SignallingError};
pub use events::{
    ConferenceAnnounced, EventBus, GroupCallUpdate, MemberChange, MemberUpdate, PeerCallUpdate,
};
pub use external::{
    Clock, DeviceMessageEncrypter, EncryptedEnvelope, EngineEvent, HomeserverTransport,
    IceConnectionState, IceServerConfig, PeerConnectionApi, PeerConnectionFactory, SystemClock,
    ToDeviceMessages,
};
pub use group_call::{GroupCall, GroupCallState, SignallingConfig};
pub use member::Member;
pub use peer_call::{INVITE_LIFETIME_MS, PeerCall, PeerCallState, PeerMessage};
pub use registry::CallRegistry;
pub use types::{
    CallDirection, CallHangupReason, CallId, ConfId, DeviceId, IceCandidate, LocalMedia,
    MediaTrack, MemberKey, MuteSettings, PartyId, RoomId, SdpType, SessionDescription, SessionId,
    TrackKind, UserId,
};
