//! One conference in one room: membership bookkeeping, join lifecycle and
//! to-device message routing.
//!
//! All per-conference state sits behind a single `tokio::sync::Mutex`, so
//! operations on one conference are serialized even when they suspend on the
//! homeserver or the engine. Invariants therefore hold across every await.

use crate::codec::{
    CallContent, CallEventType, FeedPurpose, GroupCallIntent, MemberContent, MemberDevice,
    MemberFeed, SignallingMessage,
};
use crate::error::SignallingError;
use crate::events::{EventBus, GroupCallUpdate, MemberChange, MemberUpdate};
use crate::external::{
    Clock, DeviceMessageEncrypter, EngineEvent, HomeserverTransport, IceServerConfig,
    PeerConnectionFactory,
};
use crate::member::Member;
use crate::types::{
    CallId, ConfId, DeviceId, LocalMedia, MemberKey, MuteSettings, RoomId, SessionId, UserId,
};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Tunables for the signalling core.
#[derive(Debug, Clone)]
pub struct SignallingConfig {
    /// To-device messages buffered per unknown sender before oldest-drop.
    pub max_buffered_per_key: usize,
    /// Reconnect attempts per member without a session change.
    pub max_connect_retries: u8,
    /// Attempts per homeserver RPC before surfacing the failure.
    pub transport_attempts: u32,
    /// Timeout per homeserver RPC attempt.
    pub rpc_timeout: Duration,
    /// Initial backoff between RPC attempts; doubles per retry.
    pub retry_backoff: Duration,
    /// How long a terminated conference keeps accepting (and dropping) late
    /// to-device messages.
    pub terminated_grace: Duration,
    /// Send signalling in the clear when the encrypter fails.
    pub allow_unencrypted_fallback: bool,
}

impl Default for SignallingConfig {
    fn default() -> Self {
        Self {
            max_buffered_per_key: 64,
            max_connect_retries: 3,
            transport_attempts: 3,
            rpc_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(250),
            terminated_grace: Duration::from_secs(30),
            allow_unencrypted_fallback: false,
        }
    }
}

/// Everything a conference and its members need to reach the outside world.
pub(crate) struct CallContext {
    pub room_id: RoomId,
    pub conf_id: ConfId,
    pub own_user_id: UserId,
    pub own_device_id: DeviceId,
    pub own_session_id: SessionId,
    pub transport: Arc<dyn HomeserverTransport>,
    pub encrypter: Arc<dyn DeviceMessageEncrypter>,
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub events: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
    pub config: SignallingConfig,
}

impl CallContext {
    pub(crate) fn own_key(&self) -> MemberKey {
        MemberKey::new(self.own_user_id.clone(), self.own_device_id.clone())
    }

    /// Send a state event with per-attempt timeout and doubling backoff.
    pub(crate) async fn send_state_with_retry(
        &self,
        event_type: &str,
        state_key: &str,
        content: serde_json::Value,
    ) -> Result<String, SignallingError> {
        let mut delay = self.config.retry_backoff;
        for attempt in 1..=self.config.transport_attempts {
            let send = self
                .transport
                .send_state_event(&self.room_id, event_type, state_key, content.clone());
            let result = match tokio::time::timeout(self.config.rpc_timeout, send).await {
                Ok(result) => result,
                Err(_) => Err(SignallingError::Transport("request timed out".into())),
            };
            match result {
                Ok(event_id) => return Ok(event_id),
                Err(e) if attempt == self.config.transport_attempts => return Err(e),
                Err(e) => {
                    warn!(
                        "room {}: state send attempt {} failed: {}",
                        self.room_id, attempt, e
                    );
                    sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        unreachable!("loop returns on the final attempt")
    }
}

/// Lifecycle of the local device's relationship to a conference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCallState {
    /// Locally initiated, not announced to the room yet.
    Fledgling,
    /// Announcement in flight.
    Creating,
    /// Announced (or observed), not joined.
    Created,
    /// Own membership written, waiting for the echo via sync.
    Joining,
    /// Own membership observed back.
    Joined,
}

impl GroupCallState {
    pub fn has_joined(&self) -> bool {
        matches!(self, Self::Joining | Self::Joined)
    }
}

struct GroupCallInner {
    state: GroupCallState,
    content: CallContent,
    members: HashMap<MemberKey, Member>,
    buffered: HashMap<MemberKey, VecDeque<SignallingMessage>>,
    local_media: Option<Arc<LocalMedia>>,
    local_mute: MuteSettings,
    turn_config: Option<IceServerConfig>,
    own_device_index: usize,
    own_event_timestamp: Option<DateTime<Utc>>,
    /// Last known content of our own `m.call.member` event, so joining a
    /// second conference in the room does not clobber the first.
    own_member_content: MemberContent,
}

/// One conference: owns the member set and the local join lifecycle.
pub struct GroupCall {
    ctx: CallContext,
    inner: Mutex<GroupCallInner>,
}

impl GroupCall {
    pub(crate) fn new(ctx: CallContext, content: CallContent, locally_initiated: bool) -> Self {
        let state = if locally_initiated {
            GroupCallState::Fledgling
        } else {
            GroupCallState::Created
        };
        Self {
            ctx,
            inner: Mutex::new(GroupCallInner {
                state,
                content,
                members: HashMap::new(),
                buffered: HashMap::new(),
                local_media: None,
                local_mute: MuteSettings::default(),
                turn_config: None,
                own_device_index: 0,
                own_event_timestamp: None,
                own_member_content: MemberContent::default(),
            }),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.ctx.room_id
    }

    pub fn conf_id(&self) -> &ConfId {
        &self.ctx.conf_id
    }

    pub async fn state(&self) -> GroupCallState {
        self.inner.lock().await.state
    }

    pub async fn content(&self) -> CallContent {
        self.inner.lock().await.content.clone()
    }

    pub async fn has_joined(&self) -> bool {
        self.inner.lock().await.state.has_joined()
    }

    pub async fn member_count(&self) -> usize {
        self.inner.lock().await.members.len()
    }

    /// Our position in the own membership device list.
    pub async fn own_device_index(&self) -> usize {
        self.inner.lock().await.own_device_index
    }

    /// Server timestamp of the last observed own membership event.
    pub async fn own_event_timestamp(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().await.own_event_timestamp
    }

    pub async fn member_session(&self, key: &MemberKey) -> Option<SessionId> {
        self.inner
            .lock()
            .await
            .members
            .get(key)
            .map(|m| m.session_id().clone())
    }

    pub async fn member_retry_count(&self, key: &MemberKey) -> Option<u8> {
        self.inner.lock().await.members.get(key).map(|m| m.retry_count())
    }

    pub async fn member_peer_state(&self, key: &MemberKey) -> Option<crate::peer_call::PeerCallState> {
        self.inner
            .lock()
            .await
            .members
            .get(key)
            .and_then(|m| m.peer_call_state().cloned())
    }

    pub async fn member_call_id(&self, key: &MemberKey) -> Option<CallId> {
        self.inner
            .lock()
            .await
            .members
            .get(key)
            .and_then(|m| m.peer_call_id().cloned())
    }

    fn notify(&self, inner: &GroupCallInner) {
        let _ = self.ctx.events.group_call.send(Arc::new(GroupCallUpdate {
            room_id: self.ctx.room_id.clone(),
            conf_id: self.ctx.conf_id.clone(),
            state: inner.state,
            terminated: inner.content.terminated,
        }));
    }

    fn notify_member(&self, key: &MemberKey, session_id: &SessionId, change: MemberChange) {
        let _ = self.ctx.events.member.send(Arc::new(MemberUpdate {
            room_id: self.ctx.room_id.clone(),
            conf_id: self.ctx.conf_id.clone(),
            key: key.clone(),
            session_id: session_id.clone(),
            change,
        }));
    }

    /// Announce a locally initiated conference to the room.
    pub async fn create(&self) -> Result<(), SignallingError> {
        let mut inner = self.inner.lock().await;
        if inner.state != GroupCallState::Fledgling {
            return Err(SignallingError::InvalidOperation(
                "create on an already announced conference",
            ));
        }
        inner.state = GroupCallState::Creating;

        let content = inner.content.to_content();
        match self
            .ctx
            .send_state_with_retry(
                CallEventType::Call.as_str(),
                self.ctx.conf_id.as_str(),
                content,
            )
            .await
        {
            Ok(_) => {
                inner.state = GroupCallState::Created;
                self.notify(&inner);
                Ok(())
            }
            Err(e) => {
                inner.state = GroupCallState::Fledgling;
                Err(e)
            }
        }
    }

    /// Join: publish our device in the membership event, fetch TURN settings
    /// and connect every known member. Completes to `Joined` once the own
    /// membership echo arrives through [`GroupCall::update_membership`].
    pub async fn join(&self, media: Arc<LocalMedia>) -> Result<(), SignallingError> {
        let mut inner = self.inner.lock().await;
        if inner.state != GroupCallState::Created {
            return Err(SignallingError::InvalidOperation(
                "join is only valid on a created, not-yet-joined conference",
            ));
        }
        inner.state = GroupCallState::Joining;
        inner.local_media = Some(media.clone());

        match tokio::time::timeout(
            self.ctx.config.rpc_timeout,
            self.ctx.transport.query_turn_settings(),
        )
        .await
        {
            Ok(Ok(turn)) => inner.turn_config = Some(turn),
            Ok(Err(e)) => warn!("conf {}: TURN query failed: {}", self.ctx.conf_id, e),
            Err(_) => warn!("conf {}: TURN query timed out", self.ctx.conf_id),
        }

        let mut own_content = inner.own_member_content.clone();
        own_content.upsert_device(
            &self.ctx.conf_id,
            MemberDevice {
                device_id: self.ctx.own_device_id.clone(),
                session_id: self.ctx.own_session_id.clone(),
                feeds: vec![MemberFeed {
                    purpose: FeedPurpose::UserMedia,
                }],
            },
        );

        if let Err(e) = self
            .ctx
            .send_state_with_retry(
                CallEventType::CallMember.as_str(),
                self.ctx.own_user_id.as_str(),
                own_content.to_content(),
            )
            .await
        {
            inner.state = GroupCallState::Created;
            inner.local_media = None;
            return Err(e);
        }
        inner.own_member_content = own_content;

        let GroupCallInner {
            members,
            turn_config,
            ..
        } = &mut *inner;
        for member in members.values_mut() {
            if let Err(e) = member.connect(&self.ctx, &media, turn_config.as_ref()).await {
                warn!(
                    "conf {}: connect to {} failed: {}",
                    self.ctx.conf_id,
                    member.key(),
                    e
                );
            }
        }

        self.notify(&inner);
        Ok(())
    }

    /// Leave the conference and release every leg. A `Ring` conference left
    /// empty is also terminated.
    pub async fn leave(&self) -> Result<(), SignallingError> {
        let mut inner = self.inner.lock().await;
        if !inner.state.has_joined() {
            return Err(SignallingError::InvalidOperation(
                "leave without having joined",
            ));
        }

        for (key, member) in inner.members.iter_mut() {
            member.dispose().await;
            debug!("conf {}: disposed leg to {}", self.ctx.conf_id, key);
        }
        let removed: Vec<(MemberKey, SessionId)> = inner
            .members
            .drain()
            .map(|(k, m)| (k, m.session_id().clone()))
            .collect();
        inner.buffered.clear();
        inner.local_media = None;
        inner.turn_config = None;
        inner.state = GroupCallState::Created;

        let mut own_content = inner.own_member_content.clone();
        own_content.remove_device(&self.ctx.conf_id, &self.ctx.own_device_id);
        self.ctx
            .send_state_with_retry(
                CallEventType::CallMember.as_str(),
                self.ctx.own_user_id.as_str(),
                own_content.to_content(),
            )
            .await?;
        inner.own_member_content = own_content;

        if inner.content.intent == GroupCallIntent::Ring && removed.is_empty() {
            inner.content.terminated = true;
            self.ctx
                .send_state_with_retry(
                    CallEventType::Call.as_str(),
                    self.ctx.conf_id.as_str(),
                    inner.content.to_content(),
                )
                .await?;
        }

        for (key, session_id) in &removed {
            self.notify_member(key, session_id, MemberChange::Removed);
        }
        self.notify(&inner);
        Ok(())
    }

    /// Replace the shared local media on every leg. The previous media is
    /// released only after every member migrated.
    pub async fn set_media(&self, media: Arc<LocalMedia>) -> Result<(), SignallingError> {
        let mut inner = self.inner.lock().await;
        if !inner.state.has_joined() {
            return Err(SignallingError::InvalidOperation(
                "set_media without having joined",
            ));
        }

        let previous = inner.local_media.clone();
        let GroupCallInner { members, .. } = &mut *inner;
        for member in members.values_mut() {
            if let Err(e) = member.set_media(&self.ctx, &media).await {
                warn!(
                    "conf {}: set_media on {} failed: {}",
                    self.ctx.conf_id,
                    member.key(),
                    e
                );
            }
        }
        inner.local_media = Some(media);
        drop(previous);
        Ok(())
    }

    /// Update local mute; unchanged settings are a no-op.
    pub async fn set_muted(&self, mute: MuteSettings) {
        let mut inner = self.inner.lock().await;
        if inner.local_mute == mute {
            return;
        }
        inner.local_mute = mute;

        let GroupCallInner { members, .. } = &mut *inner;
        for member in members.values_mut() {
            member.set_muted(&self.ctx, mute).await;
        }
    }

    /// Mark the conference terminated (observed via the `m.call` state
    /// event) and release everything.
    pub(crate) async fn apply_call_content(&self, content: CallContent) {
        let mut inner = self.inner.lock().await;
        let terminated = content.terminated && !inner.content.terminated;
        inner.content = content;

        if terminated {
            info!("conf {}: terminated by state event", self.ctx.conf_id);
            let GroupCallInner { members, .. } = &mut *inner;
            for member in members.values_mut() {
                member.dispose().await;
            }
            inner.members.clear();
            inner.buffered.clear();
            inner.local_media = None;
            inner.turn_config = None;
            if inner.state.has_joined() {
                inner.state = GroupCallState::Created;
            }
            self.notify(&inner);
        }
    }

    /// Reconcile one user's device list for this conference.
    pub(crate) async fn update_membership(
        &self,
        user_id: &UserId,
        devices: &[MemberDevice],
        event_timestamp: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().await;

        if user_id == &self.ctx.own_user_id {
            let mut own_content = inner.own_member_content.clone();
            if let Some(entry) = own_content
                .calls
                .iter_mut()
                .find(|c| c.conf_id == self.ctx.conf_id)
            {
                entry.devices = devices.to_vec();
            } else if !devices.is_empty() {
                own_content.calls.push(crate::codec::MemberCallEntry {
                    conf_id: self.ctx.conf_id.clone(),
                    devices: devices.to_vec(),
                });
            }
            inner.own_member_content = own_content;

            let own_device = devices
                .iter()
                .position(|d| d.device_id == self.ctx.own_device_id);
            match own_device {
                Some(index) => {
                    inner.own_device_index = index;
                    inner.own_event_timestamp = Some(event_timestamp);
                    if inner.state == GroupCallState::Joining {
                        inner.state = GroupCallState::Joined;
                        info!("conf {}: join confirmed", self.ctx.conf_id);
                        self.notify(&inner);
                    }
                }
                None if inner.state.has_joined() => {
                    // Our membership disappeared underneath us.
                    warn!("conf {}: own device dropped from membership", self.ctx.conf_id);
                    let GroupCallInner { members, .. } = &mut *inner;
                    for member in members.values_mut() {
                        member.dispose().await;
                    }
                    inner.members.clear();
                    inner.local_media = None;
                    inner.turn_config = None;
                    inner.state = GroupCallState::Created;
                    self.notify(&inner);
                    return;
                }
                None => {}
            }
        }

        for (index, device) in devices.iter().enumerate() {
            let key = MemberKey::new(user_id.clone(), device.device_id.clone());
            if key == self.ctx.own_key() {
                continue;
            }
            self.reconcile_device(&mut inner, key, device, index, event_timestamp)
                .await;
        }

        // Devices gone from the list take their members with them.
        let stale: Vec<MemberKey> = inner
            .members
            .keys()
            .filter(|k| {
                k.user_id == *user_id && !devices.iter().any(|d| d.device_id == k.device_id)
            })
            .cloned()
            .collect();
        for key in stale {
            if let Some(mut member) = inner.members.remove(&key) {
                member.dispose().await;
                info!("conf {}: member {} left", self.ctx.conf_id, key);
                self.notify_member(&key, member.session_id(), MemberChange::Removed);
            }
        }
    }

    async fn reconcile_device(
        &self,
        inner: &mut GroupCallInner,
        key: MemberKey,
        device: &MemberDevice,
        device_index: usize,
        event_timestamp: DateTime<Utc>,
    ) {
        let existing_session = inner.members.get(&key).map(|m| m.session_id().clone());
        let change = match existing_session {
            None => {
                debug!(
                    "conf {}: new member {} (session {})",
                    self.ctx.conf_id, key, device.session_id
                );
                inner.members.insert(
                    key.clone(),
                    Member::new(
                        key.clone(),
                        device.session_id.clone(),
                        device_index,
                        event_timestamp,
                    ),
                );
                MemberChange::Added
            }
            Some(session) if session != device.session_id => {
                info!(
                    "conf {}: member {} restarted (session {} -> {})",
                    self.ctx.conf_id, key, session, device.session_id
                );
                if let Some(mut old) = inner.members.remove(&key) {
                    old.dispose().await;
                }
                inner.members.insert(
                    key.clone(),
                    Member::new(
                        key.clone(),
                        device.session_id.clone(),
                        device_index,
                        event_timestamp,
                    ),
                );
                MemberChange::SessionReplaced
            }
            Some(_) => {
                if let Some(member) = inner.members.get_mut(&key) {
                    member.update_info(device_index, event_timestamp);
                }
                MemberChange::Updated
            }
        };
        self.notify_member(&key, &device.session_id, change);

        let GroupCallInner {
            members,
            buffered,
            local_media,
            turn_config,
            state,
            ..
        } = inner;
        let Some(member) = members.get_mut(&key) else {
            return;
        };

        if state.has_joined()
            && matches!(change, MemberChange::Added | MemberChange::SessionReplaced)
            && let Some(media) = local_media.clone()
        {
            if let Err(e) = member.connect(&self.ctx, &media, turn_config.as_ref()).await {
                warn!("conf {}: connect to {} failed: {}", self.ctx.conf_id, key, e);
            }
        }

        Self::flush_buffered(
            &self.ctx,
            buffered,
            member,
            local_media.as_ref(),
            turn_config.as_ref(),
        )
        .await;
    }

    /// Deliver buffered messages whose sender session now matches, in
    /// arrival order; the rest keep waiting.
    async fn flush_buffered(
        ctx: &CallContext,
        buffered: &mut HashMap<MemberKey, VecDeque<SignallingMessage>>,
        member: &mut Member,
        media: Option<&Arc<LocalMedia>>,
        ice: Option<&IceServerConfig>,
    ) {
        let Some(queue) = buffered.remove(member.key()) else {
            return;
        };
        let mut remaining = VecDeque::new();
        for message in queue {
            if &message.envelope.sender_session_id == member.session_id() {
                debug!(
                    "conf {}: delivering buffered {} to {}",
                    ctx.conf_id,
                    message.event_type(),
                    member.key()
                );
                if let Err(e) = member.handle_message(ctx, &message, media, ice).await {
                    warn!(
                        "conf {}: buffered message for {} failed: {}",
                        ctx.conf_id,
                        member.key(),
                        e
                    );
                }
            } else {
                remaining.push_back(message);
            }
        }
        if !remaining.is_empty() {
            buffered.insert(member.key().clone(), remaining);
        }
    }

    /// Route one inbound to-device message, buffering it when its sender is
    /// not (yet) a known member with a matching session.
    pub(crate) async fn handle_device_message(&self, sender: &UserId, message: SignallingMessage) {
        let mut inner = self.inner.lock().await;

        if message.envelope.dest_session_id != self.ctx.own_session_id {
            debug!(
                "conf {}: message for session {} is not for us, dropping",
                self.ctx.conf_id, message.envelope.dest_session_id
            );
            return;
        }

        let key = MemberKey::new(sender.clone(), message.envelope.device_id.clone());
        let GroupCallInner {
            members,
            buffered,
            local_media,
            turn_config,
            ..
        } = &mut *inner;

        if let Some(member) = members.get_mut(&key)
            && member.session_id() == &message.envelope.sender_session_id
        {
            if let Err(e) = member
                .handle_message(&self.ctx, &message, local_media.as_ref(), turn_config.as_ref())
                .await
            {
                warn!(
                    "conf {}: message from {} failed: {}",
                    self.ctx.conf_id, key, e
                );
            }
            return;
        }

        let queue = buffered.entry(key.clone()).or_default();
        queue.push_back(message);
        if queue.len() > self.ctx.config.max_buffered_per_key {
            queue.pop_front();
            warn!(
                "conf {}: buffer for {} full, dropped oldest message",
                self.ctx.conf_id, key
            );
        } else {
            debug!(
                "conf {}: buffered message from unknown sender {} ({} held)",
                self.ctx.conf_id,
                key,
                queue.len()
            );
        }
    }

    #[cfg(test)]
    pub(crate) async fn buffered_count(&self, key: &MemberKey) -> usize {
        self.inner
            .lock()
            .await
            .buffered
            .get(key)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Route one engine event to the leg owning `call_id`.
    pub(crate) async fn handle_engine_event(&self, call_id: &CallId, event: EngineEvent) {
        let mut inner = self.inner.lock().await;
        let GroupCallInner {
            members,
            local_media,
            turn_config,
            ..
        } = &mut *inner;

        let Some(member) = members
            .values_mut()
            .find(|m| m.peer_call_id() == Some(call_id))
        else {
            debug!(
                "conf {}: engine event for unknown call {}, dropping",
                self.ctx.conf_id, call_id
            );
            return;
        };

        if let Err(e) = member
            .handle_engine_event(
                &self.ctx,
                call_id,
                event,
                local_media.as_ref(),
                turn_config.as_ref(),
            )
            .await
        {
            warn!(
                "conf {}: engine event for {} failed: {}",
                self.ctx.conf_id, call_id, e
            );
        }
    }
}
