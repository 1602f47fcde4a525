//! Wire schema for conference signalling: event types, state event content
//! and to-device messages.

mod event_type;
mod state_events;
mod to_device;

pub use event_type::CallEventType;
pub use state_events::{
    CallContent, FeedPurpose, GroupCallIntent, GroupCallKind, MemberCallEntry, MemberContent,
    MemberDevice, MemberFeed,
};
pub use to_device::{MessageEnvelope, SignallingMessage, SignallingPayload, VOIP_VERSION};
