//! Injected capability traits.
//!
//! The signalling core never talks to the network, the crypto layer or the
//! media stack directly. Each collaborator is injected behind one of these
//! traits, which keeps the core deterministic under test: the scenario tests
//! drive it entirely through mock implementations.

use crate::error::SignallingError;
use crate::types::{
    DeviceId, IceCandidate, LocalMedia, RoomId, SessionDescription, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// TURN/STUN settings returned by the homeserver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Seconds the credentials stay valid.
    pub ttl_secs: Option<u64>,
}

/// Per-device payload map for a to-device send: user id → device id → content.
pub type ToDeviceMessages = BTreeMap<UserId, BTreeMap<DeviceId, serde_json::Value>>;

/// The homeserver transport.
#[async_trait]
pub trait HomeserverTransport: Send + Sync {
    /// Send a room state event; resolves to the event id.
    async fn send_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
        content: serde_json::Value,
    ) -> Result<String, SignallingError>;

    /// Send a to-device message batch under one transaction id.
    async fn send_to_device(
        &self,
        event_type: &str,
        messages: ToDeviceMessages,
        txn_id: &str,
    ) -> Result<(), SignallingError>;

    /// Fetch TURN settings for the local user.
    async fn query_turn_settings(&self) -> Result<IceServerConfig, SignallingError>;
}

/// Output of the device-message encrypter: a replacement event type and body.
#[derive(Debug, Clone)]
pub struct EncryptedEnvelope {
    pub event_type: String,
    pub content: serde_json::Value,
}

/// The end-to-end device-message encryption layer.
#[async_trait]
pub trait DeviceMessageEncrypter: Send + Sync {
    async fn encrypt(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        device_id: &DeviceId,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<EncryptedEnvelope, SignallingError>;
}

/// ICE connection state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Event emitted by the WebRTC engine for one leg.
///
/// The embedder forwards these into [`crate::registry::CallRegistry`] so that
/// every state transition happens on the signalling task.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    NegotiationNeeded,
    IceCandidate(IceCandidate),
    IceGatheringComplete,
    IceConnectionState(IceConnectionState),
    /// Unrecoverable engine failure; the leg ends.
    FatalError(String),
}

/// One peer connection owned by a call leg.
#[async_trait]
pub trait PeerConnectionApi: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, SignallingError>;
    async fn create_answer(&self) -> Result<SessionDescription, SignallingError>;
    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), SignallingError>;
    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), SignallingError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), SignallingError>;
    /// Replace the connection's outgoing tracks with the given media.
    async fn set_tracks(&self, media: &LocalMedia) -> Result<(), SignallingError>;
    /// Roll back a local offer (polite side of a negotiation collision).
    async fn rollback(&self) -> Result<(), SignallingError>;
    /// Release all engine resources. Infallible and idempotent.
    async fn close(&self);
}

/// Creates peer connections, one per leg.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create_peer_connection(
        &self,
        ice_servers: Option<&IceServerConfig>,
    ) -> Result<Arc<dyn PeerConnectionApi>, SignallingError>;
}

/// Time source, injected so tests control the clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
