//! Dispatches inbound room-state events, to-device messages and engine
//! events to the right conference.
//!
//! The registry is the embedder's entry point: wire the sync loop's `m.call`
//! and `m.call.member` state events plus call to-device messages into it,
//! and forward engine callbacks per leg. It surfaces nothing; malformed or
//! unroutable traffic is logged and dropped.

use crate::codec::{CallContent, CallEventType, GroupCallIntent, GroupCallKind, MemberContent};
use crate::error::SignallingError;
use crate::events::{ConferenceAnnounced, EventBus};
use crate::external::{
    Clock, DeviceMessageEncrypter, EngineEvent, HomeserverTransport, PeerConnectionFactory,
};
use crate::group_call::{CallContext, GroupCall, SignallingConfig};
use crate::types::{CallId, ConfId, DeviceId, RoomId, SessionId, UserId};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

type CallKey = (RoomId, ConfId);

/// Owns every conference the client knows about.
pub struct CallRegistry {
    own_user_id: UserId,
    own_device_id: DeviceId,
    own_session_id: SessionId,
    transport: Arc<dyn HomeserverTransport>,
    encrypter: Arc<dyn DeviceMessageEncrypter>,
    factory: Arc<dyn PeerConnectionFactory>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: SignallingConfig,
    calls: RwLock<HashMap<CallKey, Arc<GroupCall>>>,
    /// Terminated conferences, kept for a grace window so late to-device
    /// messages still find a home and are dropped cleanly.
    terminated: RwLock<HashMap<CallKey, (Arc<GroupCall>, DateTime<Utc>)>>,
}

impl CallRegistry {
    pub fn new(
        own_user_id: UserId,
        own_device_id: DeviceId,
        transport: Arc<dyn HomeserverTransport>,
        encrypter: Arc<dyn DeviceMessageEncrypter>,
        factory: Arc<dyn PeerConnectionFactory>,
        clock: Arc<dyn Clock>,
        config: SignallingConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            own_user_id,
            own_device_id,
            own_session_id: SessionId::generate(),
            transport,
            encrypter,
            factory,
            events: Arc::new(EventBus::new()),
            clock,
            config,
            calls: RwLock::new(HashMap::new()),
            terminated: RwLock::new(HashMap::new()),
        })
    }

    /// The session id minted for this client incarnation.
    pub fn session_id(&self) -> &SessionId {
        &self.own_session_id
    }

    /// Change-notification channels.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    fn context(&self, room_id: &RoomId, conf_id: &ConfId) -> CallContext {
        CallContext {
            room_id: room_id.clone(),
            conf_id: conf_id.clone(),
            own_user_id: self.own_user_id.clone(),
            own_device_id: self.own_device_id.clone(),
            own_session_id: self.own_session_id.clone(),
            transport: self.transport.clone(),
            encrypter: self.encrypter.clone(),
            factory: self.factory.clone(),
            events: self.events.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
        }
    }

    /// Start a new conference in a room and announce it.
    pub async fn create_group_call(
        &self,
        room_id: &RoomId,
        intent: GroupCallIntent,
        kind: GroupCallKind,
        name: Option<String>,
    ) -> Result<Arc<GroupCall>, SignallingError> {
        let conf_id = ConfId::generate();
        let mut content = CallContent::new(intent, kind);
        content.name = name;

        let call = Arc::new(GroupCall::new(
            self.context(room_id, &conf_id),
            content,
            true,
        ));
        call.create().await?;

        self.calls
            .write()
            .await
            .insert((room_id.clone(), conf_id.clone()), call.clone());
        Ok(call)
    }

    /// A conference in a room, if the registry still tracks it (including
    /// terminated ones inside the grace window).
    pub async fn get_group_call(
        &self,
        room_id: &RoomId,
        conf_id: &ConfId,
    ) -> Option<Arc<GroupCall>> {
        let key = (room_id.clone(), conf_id.clone());
        if let Some(call) = self.calls.read().await.get(&key) {
            return Some(call.clone());
        }
        self.terminated
            .read()
            .await
            .get(&key)
            .map(|(call, _)| call.clone())
    }

    /// Apply one `m.call` room-state event.
    pub async fn handle_call_state_event(
        &self,
        room_id: &RoomId,
        state_key: &str,
        content: &serde_json::Value,
    ) {
        self.sweep_terminated().await;

        let parsed = match CallContent::parse(content) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("room {}: dropping malformed m.call event: {}", room_id, e);
                return;
            }
        };
        let conf_id = ConfId::new(state_key);
        let key = (room_id.clone(), conf_id.clone());

        let existing = self.calls.read().await.get(&key).cloned();
        match existing {
            Some(call) => {
                let terminated = parsed.terminated;
                call.apply_call_content(parsed).await;
                if terminated {
                    self.calls.write().await.remove(&key);
                    self.terminated
                        .write()
                        .await
                        .insert(key, (call, self.clock.now()));
                }
            }
            None if parsed.terminated => {
                debug!(
                    "room {}: conference {} announced already terminated, ignoring",
                    room_id, conf_id
                );
            }
            None => {
                let call = Arc::new(GroupCall::new(
                    self.context(room_id, &conf_id),
                    parsed,
                    false,
                ));
                self.calls.write().await.insert(key, call);
                let _ = self.events.conference_announced.send(Arc::new(
                    ConferenceAnnounced {
                        room_id: room_id.clone(),
                        conf_id,
                    },
                ));
            }
        }
    }

    /// Apply one `m.call.member` room-state event; fans out to every
    /// conference the user's `m.calls` list references.
    pub async fn handle_member_state_event(
        &self,
        room_id: &RoomId,
        state_key: &str,
        content: &serde_json::Value,
        event_timestamp: DateTime<Utc>,
    ) {
        self.sweep_terminated().await;

        let parsed = match MemberContent::parse(content) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    "room {}: dropping malformed m.call.member event: {}",
                    room_id, e
                );
                return;
            }
        };
        let user_id = UserId::new(state_key);

        for entry in &parsed.calls {
            let key = (room_id.clone(), entry.conf_id.clone());
            let Some(call) = self.calls.read().await.get(&key).cloned() else {
                debug!(
                    "room {}: membership for unknown conference {}, dropping",
                    room_id, entry.conf_id
                );
                continue;
            };
            call.update_membership(&user_id, &entry.devices, event_timestamp)
                .await;
        }

        // A conference the user vanished from entirely needs an empty
        // reconciliation pass so its member gets removed.
        let referenced: Vec<ConfId> = parsed.calls.iter().map(|c| c.conf_id.clone()).collect();
        let all_calls: Vec<(CallKey, Arc<GroupCall>)> = self
            .calls
            .read()
            .await
            .iter()
            .filter(|((r, c), _)| r == room_id && !referenced.contains(c))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (_, call) in all_calls {
            call.update_membership(&user_id, &[], event_timestamp).await;
        }
    }

    /// Route one inbound call to-device message by its `conf_id`.
    pub async fn handle_to_device(
        &self,
        sender: &UserId,
        event_type: &str,
        content: &serde_json::Value,
    ) {
        self.sweep_terminated().await;

        if CallEventType::from_type(event_type).is_some_and(|et| et.is_state_event()) {
            warn!("to-device message with state event type {}, dropping", event_type);
            return;
        }

        let message = match crate::codec::SignallingMessage::parse(event_type, content) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping malformed {} from {}: {}", event_type, sender, e);
                return;
            }
        };

        let room_and_call = {
            let calls = self.calls.read().await;
            calls
                .iter()
                .find(|((_, conf), _)| conf == &message.envelope.conf_id)
                .map(|(_, call)| call.clone())
        };

        match room_and_call {
            Some(call) => call.handle_device_message(sender, message).await,
            None => {
                let is_terminated = self
                    .terminated
                    .read()
                    .await
                    .keys()
                    .any(|(_, conf)| conf == &message.envelope.conf_id);
                if is_terminated {
                    debug!(
                        "late {} for terminated conference {}, dropping",
                        event_type, message.envelope.conf_id
                    );
                } else {
                    debug!(
                        "{} references unknown conference {}, dropping",
                        event_type, message.envelope.conf_id
                    );
                }
            }
        }
    }

    /// Forward one engine event to the leg owning `call_id`.
    pub async fn handle_engine_event(
        &self,
        room_id: &RoomId,
        conf_id: &ConfId,
        call_id: &CallId,
        event: EngineEvent,
    ) {
        let key = (room_id.clone(), conf_id.clone());
        let Some(call) = self.calls.read().await.get(&key).cloned() else {
            debug!(
                "engine event for unknown conference {}, dropping",
                conf_id
            );
            return;
        };
        call.handle_engine_event(call_id, event).await;
    }

    /// Drop terminated conferences whose grace window elapsed.
    async fn sweep_terminated(&self) {
        let grace = chrono::Duration::seconds(self.config.terminated_grace.as_secs() as i64);
        let cutoff = self.clock.now() - grace;
        self.terminated
            .write()
            .await
            .retain(|_, (_, terminated_at)| *terminated_at > cutoff);
    }
}
