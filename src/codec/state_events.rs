//! Room-state event content for `m.call` and `m.call.member`.

use crate::error::SignallingError;
use crate::types::{ConfId, DeviceId, SessionId};
use serde::{Deserialize, Serialize};

/// How clients should surface the conference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupCallIntent {
    #[serde(rename = "m.ring")]
    Ring,
    #[serde(rename = "m.prompt")]
    Prompt,
    #[serde(rename = "m.room")]
    Room,
}

/// Conference media kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupCallKind {
    #[serde(rename = "m.voice")]
    Voice,
    #[serde(rename = "m.video")]
    Video,
}

/// Content of the `m.call` conference state event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallContent {
    #[serde(rename = "m.intent")]
    pub intent: GroupCallIntent,
    #[serde(rename = "m.type")]
    pub kind: GroupCallKind,
    #[serde(rename = "m.name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "m.terminated", default, skip_serializing_if = "std::ops::Not::not")]
    pub terminated: bool,
}

impl CallContent {
    pub fn new(intent: GroupCallIntent, kind: GroupCallKind) -> Self {
        Self {
            intent,
            kind,
            name: None,
            terminated: false,
        }
    }

    pub fn parse(content: &serde_json::Value) -> Result<Self, SignallingError> {
        serde_json::from_value(content.clone())
            .map_err(|e| SignallingError::MalformedEvent(format!("m.call content: {}", e)))
    }

    pub fn to_content(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("call content serializes")
    }
}

/// Purpose of one published feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedPurpose {
    #[serde(rename = "m.usermedia")]
    UserMedia,
    #[serde(rename = "m.screenshare")]
    ScreenShare,
}

/// One feed a device publishes into the conference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberFeed {
    pub purpose: FeedPurpose,
}

/// One device of a user participating in a conference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDevice {
    pub device_id: DeviceId,
    pub session_id: SessionId,
    #[serde(default)]
    pub feeds: Vec<MemberFeed>,
}

/// One conference a user participates in, with all their devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberCallEntry {
    #[serde(rename = "m.call_id")]
    pub conf_id: ConfId,
    #[serde(rename = "m.devices", default)]
    pub devices: Vec<MemberDevice>,
}

/// Content of the `m.call.member` state event (state key: the user id).
///
/// A user in several conferences of the same room has one entry per
/// conference in `m.calls`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemberContent {
    #[serde(rename = "m.calls", default)]
    pub calls: Vec<MemberCallEntry>,
}

impl MemberContent {
    pub fn parse(content: &serde_json::Value) -> Result<Self, SignallingError> {
        serde_json::from_value(content.clone())
            .map_err(|e| SignallingError::MalformedEvent(format!("m.call.member content: {}", e)))
    }

    pub fn to_content(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("member content serializes")
    }

    /// The entry for one conference, if present.
    pub fn entry(&self, conf_id: &ConfId) -> Option<&MemberCallEntry> {
        self.calls.iter().find(|c| &c.conf_id == conf_id)
    }

    /// Insert or replace this device in the given conference entry.
    pub fn upsert_device(&mut self, conf_id: &ConfId, device: MemberDevice) {
        match self.calls.iter_mut().find(|c| &c.conf_id == conf_id) {
            Some(entry) => {
                entry.devices.retain(|d| d.device_id != device.device_id);
                entry.devices.push(device);
            }
            None => self.calls.push(MemberCallEntry {
                conf_id: conf_id.clone(),
                devices: vec![device],
            }),
        }
    }

    /// Remove this device from the given conference entry; empty entries are
    /// dropped so the event shrinks back when we leave our last conference.
    pub fn remove_device(&mut self, conf_id: &ConfId, device_id: &DeviceId) {
        if let Some(entry) = self.calls.iter_mut().find(|c| &c.conf_id == conf_id) {
            entry.devices.retain(|d| &d.device_id != device_id);
        }
        self.calls.retain(|c| !c.devices.is_empty());
    }
}
