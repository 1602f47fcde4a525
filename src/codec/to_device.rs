//! To-device signalling message parsing and building.
//!
//! Every signalling message shares one envelope identifying the leg and the
//! sender/destination sessions, plus a payload that depends on the event
//! type. Unknown `m.call.*` types decode to [`SignallingPayload::Unknown`]
//! so forward-compatible traffic survives a decode/encode cycle.

use super::event_type::CallEventType;
use crate::error::SignallingError;
use crate::types::{
    CallHangupReason, CallId, ConfId, DeviceId, IceCandidate, PartyId, SessionDescription,
    SessionId,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// VoIP schema version stamped on outbound messages.
pub const VOIP_VERSION: u32 = 1;

fn default_version() -> u32 {
    VOIP_VERSION
}

/// Common fields carried by every to-device signalling message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub call_id: CallId,
    pub conf_id: ConfId,
    pub party_id: PartyId,
    pub device_id: DeviceId,
    pub sender_session_id: SessionId,
    pub dest_session_id: SessionId,
    pub seq: u64,
    #[serde(default = "default_version")]
    pub version: u32,
}

/// Variant-specific payload of a signalling message.
#[derive(Debug, Clone, PartialEq)]
pub enum SignallingPayload {
    Invite {
        offer: SessionDescription,
        /// Milliseconds the invite stays valid.
        lifetime_ms: u32,
    },
    Answer {
        answer: SessionDescription,
    },
    Candidates {
        candidates: Vec<IceCandidate>,
    },
    Hangup {
        reason: CallHangupReason,
    },
    Reject,
    Negotiate {
        description: SessionDescription,
    },
    SdpStreamMetadataChanged {
        metadata: serde_json::Value,
    },
    /// Forward-compatible passthrough for unrecognized `m.call.*` types.
    Unknown {
        event_type: String,
        content: serde_json::Value,
    },
}

/// A parsed (or to-be-sent) to-device signalling message.
#[derive(Debug, Clone, PartialEq)]
pub struct SignallingMessage {
    pub envelope: MessageEnvelope,
    pub payload: SignallingPayload,
}

fn field<T: DeserializeOwned>(
    content: &serde_json::Value,
    name: &str,
) -> Result<T, SignallingError> {
    let value = content
        .get(name)
        .ok_or_else(|| SignallingError::MalformedEvent(format!("missing field '{}'", name)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| SignallingError::MalformedEvent(format!("field '{}': {}", name, e)))
}

impl SignallingMessage {
    /// Parse a to-device message from its event type and content.
    pub fn parse(event_type: &str, content: &serde_json::Value) -> Result<Self, SignallingError> {
        let envelope: MessageEnvelope = serde_json::from_value(content.clone())
            .map_err(|e| SignallingError::MalformedEvent(format!("envelope: {}", e)))?;

        let payload = match CallEventType::from_type(event_type) {
            Some(CallEventType::Invite) => SignallingPayload::Invite {
                offer: field(content, "offer")?,
                lifetime_ms: field(content, "lifetime")?,
            },
            Some(CallEventType::Answer) => SignallingPayload::Answer {
                answer: field(content, "answer")?,
            },
            Some(CallEventType::Candidates) => SignallingPayload::Candidates {
                candidates: field(content, "candidates")?,
            },
            Some(CallEventType::Hangup) => SignallingPayload::Hangup {
                reason: field(content, "reason")?,
            },
            Some(CallEventType::Reject) => SignallingPayload::Reject,
            Some(CallEventType::Negotiate) => SignallingPayload::Negotiate {
                description: field(content, "description")?,
            },
            Some(CallEventType::SdpStreamMetadataChanged) => {
                SignallingPayload::SdpStreamMetadataChanged {
                    metadata: field(content, "sdp_stream_metadata")?,
                }
            }
            Some(CallEventType::Call) | Some(CallEventType::CallMember) => {
                return Err(SignallingError::MalformedEvent(format!(
                    "'{}' is a state event, not a to-device message",
                    event_type
                )));
            }
            None => SignallingPayload::Unknown {
                event_type: event_type.to_string(),
                content: content.clone(),
            },
        };

        Ok(Self { envelope, payload })
    }

    /// The wire event type for this message.
    pub fn event_type(&self) -> &str {
        match &self.payload {
            SignallingPayload::Invite { .. } => CallEventType::Invite.as_str(),
            SignallingPayload::Answer { .. } => CallEventType::Answer.as_str(),
            SignallingPayload::Candidates { .. } => CallEventType::Candidates.as_str(),
            SignallingPayload::Hangup { .. } => CallEventType::Hangup.as_str(),
            SignallingPayload::Reject => CallEventType::Reject.as_str(),
            SignallingPayload::Negotiate { .. } => CallEventType::Negotiate.as_str(),
            SignallingPayload::SdpStreamMetadataChanged { .. } => {
                CallEventType::SdpStreamMetadataChanged.as_str()
            }
            SignallingPayload::Unknown { event_type, .. } => event_type,
        }
    }

    /// Build the wire content: envelope fields plus the variant's fields.
    pub fn to_content(&self) -> serde_json::Value {
        let mut content = serde_json::to_value(&self.envelope).expect("envelope serializes");
        let object = content.as_object_mut().expect("envelope is an object");

        match &self.payload {
            SignallingPayload::Invite { offer, lifetime_ms } => {
                object.insert(
                    "offer".into(),
                    serde_json::to_value(offer).expect("sdp serializes"),
                );
                object.insert("lifetime".into(), (*lifetime_ms).into());
            }
            SignallingPayload::Answer { answer } => {
                object.insert(
                    "answer".into(),
                    serde_json::to_value(answer).expect("sdp serializes"),
                );
            }
            SignallingPayload::Candidates { candidates } => {
                object.insert(
                    "candidates".into(),
                    serde_json::to_value(candidates).expect("candidates serialize"),
                );
            }
            SignallingPayload::Hangup { reason } => {
                object.insert(
                    "reason".into(),
                    serde_json::to_value(reason).expect("reason serializes"),
                );
            }
            SignallingPayload::Reject => {}
            SignallingPayload::Negotiate { description } => {
                object.insert(
                    "description".into(),
                    serde_json::to_value(description).expect("sdp serializes"),
                );
            }
            SignallingPayload::SdpStreamMetadataChanged { metadata } => {
                object.insert("sdp_stream_metadata".into(), metadata.clone());
            }
            SignallingPayload::Unknown {
                content: unknown, ..
            } => {
                if let Some(extra) = unknown.as_object() {
                    for (k, v) in extra {
                        object.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
            }
        }

        content
    }
}
