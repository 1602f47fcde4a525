//! Change notifications for embedders (UI, call widgets).
//!
//! One broadcast channel per notification type; subscribers that lag simply
//! miss updates, they never block the signalling task.

use crate::group_call::GroupCallState;
use crate::peer_call::PeerCallState;
use crate::types::{CallId, ConfId, MemberKey, RoomId, SessionId};
use std::sync::Arc;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 100;

/// A GroupCall changed lifecycle state or content.
#[derive(Debug, Clone)]
pub struct GroupCallUpdate {
    pub room_id: RoomId,
    pub conf_id: ConfId,
    pub state: GroupCallState,
    pub terminated: bool,
}

/// What happened to a Member entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberChange {
    Added,
    Updated,
    SessionReplaced,
    Removed,
}

/// A Member was added, updated, replaced or removed.
#[derive(Debug, Clone)]
pub struct MemberUpdate {
    pub room_id: RoomId,
    pub conf_id: ConfId,
    pub key: MemberKey,
    pub session_id: SessionId,
    pub change: MemberChange,
}

/// A call leg changed state.
#[derive(Debug, Clone)]
pub struct PeerCallUpdate {
    pub room_id: RoomId,
    pub conf_id: ConfId,
    pub key: MemberKey,
    pub call_id: CallId,
    pub state: PeerCallState,
}

/// A new, non-terminated conference appeared in a room.
#[derive(Debug, Clone)]
pub struct ConferenceAnnounced {
    pub room_id: RoomId,
    pub conf_id: ConfId,
}

macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with a separate broadcast channel per event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (group_call, Arc<GroupCallUpdate>),
    (member, Arc<MemberUpdate>),
    (peer_call, Arc<PeerCallUpdate>),
    (conference_announced, Arc<ConferenceAnnounced>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
