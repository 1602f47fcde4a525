//! Conference member: one remote device and its single call leg.
//!
//! The Member decides which side initiates, owns at most one [`PeerCall`] at
//! a time, applies the retry policy when a leg ends for a retryable reason,
//! and stamps the conference envelope onto every outbound message before
//! encrypting and transmitting it.

use crate::codec::{MessageEnvelope, SignallingMessage, SignallingPayload, VOIP_VERSION};
use crate::error::SignallingError;
use crate::events::PeerCallUpdate;
use crate::external::IceServerConfig;
use crate::group_call::CallContext;
use crate::peer_call::{PeerCall, PeerCallState, PeerMessage};
use crate::types::{
    CallDirection, CallHangupReason, CallId, LocalMedia, MemberKey, MuteSettings, PartyId,
    SessionId,
};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::time::sleep;

fn txn_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// One remote device participating in a conference.
pub struct Member {
    key: MemberKey,
    session_id: SessionId,
    device_index: usize,
    event_timestamp: DateTime<Utc>,
    peer_call: Option<PeerCall>,
    retry_count: u8,
    local_media: Weak<LocalMedia>,
    next_seq: u64,
    last_notified_state: Option<PeerCallState>,
}

impl Member {
    pub(crate) fn new(
        key: MemberKey,
        session_id: SessionId,
        device_index: usize,
        event_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            session_id,
            device_index,
            event_timestamp,
            peer_call: None,
            retry_count: 0,
            local_media: Weak::new(),
            next_seq: 0,
            last_notified_state: None,
        }
    }

    pub fn key(&self) -> &MemberKey {
        &self.key
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }

    pub fn event_timestamp(&self) -> DateTime<Utc> {
        self.event_timestamp
    }

    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    /// Whether the media this member's leg was wired to is still alive.
    /// The GroupCall owns the media; this reference never keeps it so.
    pub fn media_alive(&self) -> bool {
        self.local_media.strong_count() > 0
    }

    pub fn peer_call_state(&self) -> Option<&PeerCallState> {
        self.peer_call.as_ref().map(|pc| pc.state())
    }

    pub fn peer_call_id(&self) -> Option<&CallId> {
        self.peer_call.as_ref().map(|pc| pc.call_id())
    }

    pub(crate) fn update_info(&mut self, device_index: usize, event_timestamp: DateTime<Utc>) {
        self.device_index = device_index;
        self.event_timestamp = event_timestamp;
    }

    /// Both peers run this rule and agree without coordination: the side
    /// with the lexicographically greater `(user_id, device_id)` initiates.
    fn we_initiate(&self, ctx: &CallContext) -> bool {
        self.key < ctx.own_key()
    }

    /// The polite side of Perfect Negotiation, same ordering rule.
    fn polite(&self, ctx: &CallContext) -> bool {
        self.we_initiate(ctx)
    }

    /// Establish (or keep) the leg towards this device.
    ///
    /// On the initiating side this creates an outgoing PeerCall with a fresh
    /// call id; on the receiving side it answers a pending invite if one is
    /// already ringing, otherwise it waits for the remote's invite.
    pub(crate) async fn connect(
        &mut self,
        ctx: &CallContext,
        media: &Arc<LocalMedia>,
        ice: Option<&IceServerConfig>,
    ) -> Result<(), SignallingError> {
        self.local_media = Arc::downgrade(media);

        if let Some(pc) = &mut self.peer_call
            && !pc.state().is_ended()
        {
            if *pc.state() == PeerCallState::Ringing {
                let result = pc.answer(media.clone()).await;
                self.pump(ctx).await;
                self.reap();
                return result;
            }
            return Ok(());
        }

        if !self.we_initiate(ctx) {
            debug!("member {}: awaiting invite from remote", self.key);
            return Ok(());
        }

        loop {
            let engine = ctx.factory.create_peer_connection(ice).await?;
            let call_id = CallId::generate();
            debug!("member {}: placing call {}", self.key, call_id);
            let mut pc = PeerCall::new_outgoing(call_id, engine, self.polite(ctx));
            let result = pc.place_call(media.clone()).await;
            self.peer_call = Some(pc);
            self.pump(ctx).await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.reap();
                    self.retry_count += 1;
                    if self.retry_count > ctx.config.max_connect_retries {
                        warn!("member {}: giving up after {} attempts", self.key, self.retry_count);
                        return Err(e);
                    }
                    info!(
                        "member {}: call setup failed ({}), retry {}",
                        self.key, e, self.retry_count
                    );
                }
            }
        }
    }

    /// Route one inbound signalling message to the leg, resolving glare and
    /// creating the incoming leg on a first invite.
    pub(crate) async fn handle_message(
        &mut self,
        ctx: &CallContext,
        message: &SignallingMessage,
        media: Option<&Arc<LocalMedia>>,
        ice: Option<&IceServerConfig>,
    ) -> Result<(), SignallingError> {
        let call_id = &message.envelope.call_id;
        let is_invite = matches!(message.payload, SignallingPayload::Invite { .. });

        if let Some(pc) = &mut self.peer_call
            && !pc.state().is_ended()
            && pc.call_id() != call_id
        {
            if !is_invite {
                debug!(
                    "member {}: message for unknown call {}, dropping",
                    self.key, call_id
                );
                return Ok(());
            }
            if !self.resolve_glare(ctx, call_id).await {
                // Our leg won; the remote ends its own losing leg.
                return Ok(());
            }
        }

        match &mut self.peer_call {
            Some(pc) if !pc.state().is_ended() => {
                pc.handle_signalling(message).await?;
            }
            _ if is_invite => {
                let engine = ctx.factory.create_peer_connection(ice).await?;
                let polite = self.polite(ctx);
                let mut pc = PeerCall::new_incoming(call_id.clone(), engine, polite);
                pc.handle_signalling(message).await?;
                if let Some(media) = media {
                    pc.answer(media.clone()).await?;
                }
                self.peer_call = Some(pc);
            }
            _ => {
                debug!(
                    "member {}: message for unknown call {}, dropping",
                    self.key, call_id
                );
                return Ok(());
            }
        }

        self.after_activity(ctx, media, ice).await;
        Ok(())
    }

    /// Two live legs for the same pair: the lower call id wins. Returns true
    /// when the remote invite should replace our leg.
    async fn resolve_glare(&mut self, ctx: &CallContext, remote_call_id: &CallId) -> bool {
        let Some(pc) = self.peer_call.as_mut() else {
            return true;
        };
        let we_lose = match pc.direction() {
            CallDirection::Outgoing => remote_call_id < pc.call_id(),
            // A second invite with a new call id supersedes the ringing one.
            CallDirection::Incoming => true,
        };

        if we_lose {
            info!(
                "member {}: glare lost, replacing {} with {}",
                self.key,
                pc.call_id(),
                remote_call_id
            );
            pc.hangup(CallHangupReason::Replaced).await;
            self.pump(ctx).await;
            self.reap();
        } else {
            debug!(
                "member {}: glare won, keeping {} over {}",
                self.key,
                pc.call_id(),
                remote_call_id
            );
        }
        we_lose
    }

    /// Route one engine event to the leg.
    pub(crate) async fn handle_engine_event(
        &mut self,
        ctx: &CallContext,
        call_id: &CallId,
        event: crate::external::EngineEvent,
        media: Option<&Arc<LocalMedia>>,
        ice: Option<&IceServerConfig>,
    ) -> Result<(), SignallingError> {
        match &mut self.peer_call {
            Some(pc) if pc.call_id() == call_id => {
                pc.handle_engine_event(event).await?;
            }
            _ => {
                debug!(
                    "member {}: engine event for unknown call {}, dropping",
                    self.key, call_id
                );
                return Ok(());
            }
        }
        self.after_activity(ctx, media, ice).await;
        Ok(())
    }

    /// Replace local tracks on the leg.
    pub(crate) async fn set_media(
        &mut self,
        ctx: &CallContext,
        media: &Arc<LocalMedia>,
    ) -> Result<(), SignallingError> {
        self.local_media = Arc::downgrade(media);
        if let Some(pc) = &mut self.peer_call {
            let result = pc.set_media(media.clone()).await;
            self.pump(ctx).await;
            self.reap();
            result?;
        }
        Ok(())
    }

    /// Propagate a mute change as stream metadata.
    pub(crate) async fn set_muted(&mut self, ctx: &CallContext, mute: MuteSettings) {
        if let Some(pc) = &mut self.peer_call {
            pc.set_muted(mute);
            self.pump(ctx).await;
        }
    }

    /// Locally hang the leg up (used on leave).
    pub(crate) async fn hangup(&mut self, ctx: &CallContext, reason: CallHangupReason) {
        if let Some(pc) = &mut self.peer_call {
            pc.hangup(reason).await;
            self.pump(ctx).await;
            self.reap();
        }
    }

    /// Tear the leg down without signalling; releases engine resources.
    pub(crate) async fn dispose(&mut self) {
        if let Some(pc) = &mut self.peer_call {
            pc.close(None).await;
        }
        self.peer_call = None;
    }

    /// Drain and transmit the leg's outbox, then apply the retry policy if
    /// the leg ended.
    async fn after_activity(
        &mut self,
        ctx: &CallContext,
        media: Option<&Arc<LocalMedia>>,
        ice: Option<&IceServerConfig>,
    ) {
        self.pump(ctx).await;

        let Some(reason) = self.reap() else {
            return;
        };
        if !reason.is_retryable() {
            debug!(
                "member {}: leg ended ({:?}), not retryable",
                self.key, reason
            );
            return;
        }
        let Some(media) = media else {
            return;
        };

        self.retry_count += 1;
        if self.retry_count > ctx.config.max_connect_retries {
            warn!(
                "member {}: leg ended ({:?}), retries exhausted",
                self.key, reason
            );
            return;
        }
        info!(
            "member {}: leg ended ({:?}), reconnecting (retry {})",
            self.key, reason, self.retry_count
        );
        if let Err(e) = self.connect(ctx, media, ice).await {
            warn!("member {}: reconnect failed: {}", self.key, e);
        }
    }

    /// Remove an ended leg, returning its hangup reason.
    fn reap(&mut self) -> Option<CallHangupReason> {
        if let Some(PeerCallState::Ended { reason }) = self.peer_call_state().cloned() {
            self.peer_call = None;
            Some(reason)
        } else {
            None
        }
    }

    /// Stamp, encrypt and transmit everything the leg produced, in order.
    async fn pump(&mut self, ctx: &CallContext) {
        let Some(pc) = &mut self.peer_call else {
            return;
        };
        let call_id = pc.call_id().clone();
        let messages = pc.take_outbox();
        let state = pc.state().clone();

        for message in messages {
            let envelope = MessageEnvelope {
                call_id: call_id.clone(),
                conf_id: ctx.conf_id.clone(),
                party_id: PartyId::new(ctx.own_device_id.as_str()),
                device_id: ctx.own_device_id.clone(),
                sender_session_id: ctx.own_session_id.clone(),
                dest_session_id: self.session_id.clone(),
                seq: self.next_seq,
                version: VOIP_VERSION,
            };
            self.next_seq += 1;

            let payload = match message {
                PeerMessage::Invite { offer, lifetime_ms } => {
                    SignallingPayload::Invite { offer, lifetime_ms }
                }
                PeerMessage::Answer { answer } => SignallingPayload::Answer { answer },
                PeerMessage::Candidates { candidates } => {
                    SignallingPayload::Candidates { candidates }
                }
                PeerMessage::Hangup { reason } => SignallingPayload::Hangup { reason },
                PeerMessage::Negotiate { description } => {
                    SignallingPayload::Negotiate { description }
                }
                PeerMessage::SdpStreamMetadataChanged { metadata } => {
                    SignallingPayload::SdpStreamMetadataChanged { metadata }
                }
            };

            let outbound = SignallingMessage { envelope, payload };
            if let Err(e) = self.transmit(ctx, &outbound).await {
                warn!(
                    "member {}: failed to send {} for call {}: {}",
                    self.key,
                    outbound.event_type(),
                    call_id,
                    e
                );
            }
        }

        if self.last_notified_state.as_ref() != Some(&state) {
            self.last_notified_state = Some(state.clone());
            let _ = ctx.events.peer_call.send(Arc::new(PeerCallUpdate {
                room_id: ctx.room_id.clone(),
                conf_id: ctx.conf_id.clone(),
                key: self.key.clone(),
                call_id,
                state,
            }));
        }
    }

    async fn transmit(
        &self,
        ctx: &CallContext,
        message: &SignallingMessage,
    ) -> Result<(), SignallingError> {
        let plaintext_type = message.event_type().to_string();
        let content = message.to_content();

        let (event_type, body) = match ctx
            .encrypter
            .encrypt(
                &ctx.room_id,
                &self.key.user_id,
                &self.key.device_id,
                &plaintext_type,
                content.clone(),
            )
            .await
        {
            Ok(envelope) => (envelope.event_type, envelope.content),
            Err(e) if ctx.config.allow_unencrypted_fallback => {
                warn!(
                    "member {}: encryption failed ({}), sending unencrypted",
                    self.key, e
                );
                (plaintext_type, content)
            }
            Err(e) => return Err(e),
        };

        let mut devices = BTreeMap::new();
        devices.insert(self.key.device_id.clone(), body);
        let mut messages = BTreeMap::new();
        messages.insert(self.key.user_id.clone(), devices);

        let txn = txn_id();
        let mut delay = ctx.config.retry_backoff;
        for attempt in 1..=ctx.config.transport_attempts {
            let send = ctx
                .transport
                .send_to_device(&event_type, messages.clone(), &txn);
            let result = match tokio::time::timeout(ctx.config.rpc_timeout, send).await {
                Ok(result) => result,
                Err(_) => Err(SignallingError::Transport("request timed out".into())),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt == ctx.config.transport_attempts => return Err(e),
                Err(e) => {
                    warn!(
                        "member {}: to-device send attempt {} failed: {}",
                        self.key, attempt, e
                    );
                    sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        unreachable!("loop returns on the final attempt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SignallingPayload;
    use crate::group_call::SignallingConfig;
    use crate::test_support::{
        MockEncrypter, MockFactory, MockTransport, sent_payloads_of_type,
    };
    use crate::types::{CallHangupReason, MediaTrack, SessionDescription};

    fn context(
        transport: Arc<MockTransport>,
        encrypter: Arc<MockEncrypter>,
        factory: Arc<MockFactory>,
    ) -> CallContext {
        CallContext {
            room_id: "!room:hs".into(),
            conf_id: "conf1".into(),
            own_user_id: "@own:hs".into(),
            own_device_id: "OWNDEV".into(),
            own_session_id: "sess-own".into(),
            transport,
            encrypter,
            factory,
            events: Arc::new(crate::events::EventBus::new()),
            clock: Arc::new(crate::external::SystemClock),
            config: SignallingConfig::default(),
        }
    }

    fn media() -> Arc<LocalMedia> {
        Arc::new(LocalMedia::new("stream1", vec![MediaTrack::audio("a1")]))
    }

    /// Remote key below ours: we initiate.
    fn lesser_member() -> Member {
        Member::new(
            MemberKey::new("@a:hs".into(), "ADEV".into()),
            "sess-remote".into(),
            0,
            Utc::now(),
        )
    }

    /// Remote key above ours: they initiate.
    fn greater_member() -> Member {
        Member::new(
            MemberKey::new("@z:hs".into(), "ZDEV".into()),
            "sess-remote".into(),
            0,
            Utc::now(),
        )
    }

    fn inbound(call_id: &str, seq: u64, payload: SignallingPayload) -> SignallingMessage {
        SignallingMessage {
            envelope: MessageEnvelope {
                call_id: call_id.into(),
                conf_id: "conf1".into(),
                party_id: "ADEV".into(),
                device_id: "ADEV".into(),
                sender_session_id: "sess-remote".into(),
                dest_session_id: "sess-own".into(),
                seq,
                version: VOIP_VERSION,
            },
            payload,
        }
    }

    fn invite(call_id: &str, seq: u64) -> SignallingMessage {
        inbound(
            call_id,
            seq,
            SignallingPayload::Invite {
                offer: SessionDescription::offer("remote-offer"),
                lifetime_ms: 60_000,
            },
        )
    }

    #[tokio::test]
    async fn test_initiator_side_sends_invite() {
        let (transport, encrypter, factory) =
            (MockTransport::shared(), MockEncrypter::shared(), MockFactory::shared());
        let ctx = context(transport.clone(), encrypter, factory);
        let mut member = lesser_member();

        member.connect(&ctx, &media(), None).await.unwrap();

        assert_eq!(
            member.peer_call_state(),
            Some(&PeerCallState::InviteSent)
        );
        let invites = sent_payloads_of_type(&transport, "m.call.invite");
        assert_eq!(invites.len(), 1);
        assert_eq!(invites[0]["conf_id"], "conf1");
        assert_eq!(invites[0]["sender_session_id"], "sess-own");
        assert_eq!(invites[0]["dest_session_id"], "sess-remote");
        assert_eq!(invites[0]["party_id"], "OWNDEV");
        assert_eq!(invites[0]["device_id"], "OWNDEV");
    }

    #[tokio::test]
    async fn test_receiver_side_waits_for_invite() {
        let (transport, encrypter, factory) =
            (MockTransport::shared(), MockEncrypter::shared(), MockFactory::shared());
        let ctx = context(transport.clone(), encrypter, factory);
        let mut member = greater_member();

        member.connect(&ctx, &media(), None).await.unwrap();

        assert!(member.peer_call_state().is_none());
        assert!(transport.sent_to_device().is_empty());
    }

    #[tokio::test]
    async fn test_exactly_one_side_initiates() {
        // For a fixed pair, own-vs-remote and remote-vs-own must disagree
        // on `we_initiate`.
        let (transport, encrypter, factory) =
            (MockTransport::shared(), MockEncrypter::shared(), MockFactory::shared());
        let ctx = context(transport, encrypter, factory);

        let lesser = lesser_member();
        let greater = greater_member();
        assert!(lesser.we_initiate(&ctx));
        assert!(!greater.we_initiate(&ctx));
    }

    #[tokio::test]
    async fn test_incoming_invite_is_auto_answered_when_joined() {
        let (transport, encrypter, factory) =
            (MockTransport::shared(), MockEncrypter::shared(), MockFactory::shared());
        let ctx = context(transport.clone(), encrypter, factory);
        let mut member = greater_member();
        let m = media();

        member
            .handle_message(&ctx, &invite("c-remote", 0), Some(&m), None)
            .await
            .unwrap();

        assert_eq!(member.peer_call_state(), Some(&PeerCallState::Connecting));
        assert_eq!(sent_payloads_of_type(&transport, "m.call.answer").len(), 1);
    }

    #[tokio::test]
    async fn test_incoming_invite_rings_until_join() {
        let (transport, encrypter, factory) =
            (MockTransport::shared(), MockEncrypter::shared(), MockFactory::shared());
        let ctx = context(transport.clone(), encrypter, factory);
        let mut member = greater_member();

        member
            .handle_message(&ctx, &invite("c-remote", 0), None, None)
            .await
            .unwrap();
        assert_eq!(member.peer_call_state(), Some(&PeerCallState::Ringing));

        // Joining later answers the pending leg.
        member.connect(&ctx, &media(), None).await.unwrap();
        assert_eq!(member.peer_call_state(), Some(&PeerCallState::Connecting));
        assert_eq!(sent_payloads_of_type(&transport, "m.call.answer").len(), 1);
    }

    #[tokio::test]
    async fn test_glare_lower_call_id_wins() {
        let (transport, encrypter, factory) =
            (MockTransport::shared(), MockEncrypter::shared(), MockFactory::shared());
        let ctx = context(transport.clone(), encrypter, factory);
        let mut member = lesser_member();
        let m = media();

        member.connect(&ctx, &m, None).await.unwrap();
        let our_call_id = member.peer_call_id().unwrap().clone();

        // Remote invite with a call id sorting below ours always wins.
        let winning_id = "0000000000000000";
        assert!(winning_id < our_call_id.as_str());
        member
            .handle_message(&ctx, &invite(winning_id, 0), Some(&m), None)
            .await
            .unwrap();

        assert_eq!(member.peer_call_id().unwrap().as_str(), winning_id);
        assert_eq!(member.peer_call_state(), Some(&PeerCallState::Connecting));

        // The losing leg announced its replacement.
        let hangups = sent_payloads_of_type(&transport, "m.call.hangup");
        assert_eq!(hangups.len(), 1);
        assert_eq!(hangups[0]["reason"], "replaced");
        assert_eq!(hangups[0]["call_id"], our_call_id.as_str());
    }

    #[tokio::test]
    async fn test_glare_higher_call_id_is_ignored() {
        let (transport, encrypter, factory) =
            (MockTransport::shared(), MockEncrypter::shared(), MockFactory::shared());
        let ctx = context(transport.clone(), encrypter, factory);
        let mut member = lesser_member();
        let m = media();

        member.connect(&ctx, &m, None).await.unwrap();
        let our_call_id = member.peer_call_id().unwrap().clone();

        let losing_id = "ffffffffffffffffffffffffffffffff";
        assert!(losing_id > our_call_id.as_str());
        member
            .handle_message(&ctx, &invite(losing_id, 0), Some(&m), None)
            .await
            .unwrap();

        assert_eq!(member.peer_call_id(), Some(&our_call_id));
        assert_eq!(member.peer_call_state(), Some(&PeerCallState::InviteSent));
        assert!(sent_payloads_of_type(&transport, "m.call.hangup").is_empty());
    }

    #[tokio::test]
    async fn test_retryable_hangup_reconnects_with_new_call_id() {
        let (transport, encrypter, factory) =
            (MockTransport::shared(), MockEncrypter::shared(), MockFactory::shared());
        let ctx = context(transport.clone(), encrypter, factory);
        let mut member = lesser_member();
        let m = media();

        member.connect(&ctx, &m, None).await.unwrap();
        let first_call_id = member.peer_call_id().unwrap().clone();

        member
            .handle_message(
                &ctx,
                &inbound(
                    first_call_id.as_str(),
                    0,
                    SignallingPayload::Hangup {
                        reason: CallHangupReason::IceFailed,
                    },
                ),
                Some(&m),
                None,
            )
            .await
            .unwrap();

        assert_eq!(member.retry_count(), 1);
        let second_call_id = member.peer_call_id().unwrap().clone();
        assert_ne!(first_call_id, second_call_id);
        assert_eq!(member.peer_call_state(), Some(&PeerCallState::InviteSent));
        assert_eq!(sent_payloads_of_type(&transport, "m.call.invite").len(), 2);
    }

    #[tokio::test]
    async fn test_retries_stop_after_limit() {
        let (transport, encrypter, factory) =
            (MockTransport::shared(), MockEncrypter::shared(), MockFactory::shared());
        let ctx = context(transport.clone(), encrypter, factory);
        let mut member = lesser_member();
        let m = media();

        member.connect(&ctx, &m, None).await.unwrap();

        let mut seq = 0;
        for _ in 0..4 {
            let Some(call_id) = member.peer_call_id().cloned() else {
                break;
            };
            member
                .handle_message(
                    &ctx,
                    &inbound(
                        call_id.as_str(),
                        seq,
                        SignallingPayload::Hangup {
                            reason: CallHangupReason::IceFailed,
                        },
                    ),
                    Some(&m),
                    None,
                )
                .await
                .unwrap();
            seq += 1;
        }

        // 1 original + 3 retries, then the member stops.
        assert_eq!(member.retry_count(), 4);
        assert!(member.peer_call_state().is_none());
        assert_eq!(sent_payloads_of_type(&transport, "m.call.invite").len(), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_hangup_does_not_reconnect() {
        let (transport, encrypter, factory) =
            (MockTransport::shared(), MockEncrypter::shared(), MockFactory::shared());
        let ctx = context(transport.clone(), encrypter, factory);
        let mut member = lesser_member();
        let m = media();

        member.connect(&ctx, &m, None).await.unwrap();
        let call_id = member.peer_call_id().unwrap().clone();

        member
            .handle_message(
                &ctx,
                &inbound(
                    call_id.as_str(),
                    0,
                    SignallingPayload::Hangup {
                        reason: CallHangupReason::UserHangup,
                    },
                ),
                Some(&m),
                None,
            )
            .await
            .unwrap();

        assert_eq!(member.retry_count(), 0);
        assert!(member.peer_call_state().is_none());
        assert_eq!(sent_payloads_of_type(&transport, "m.call.invite").len(), 1);
    }

    #[tokio::test]
    async fn test_factory_failure_surfaces_from_connect() {
        let (transport, encrypter, factory) =
            (MockTransport::shared(), MockEncrypter::shared(), MockFactory::shared());
        factory.fail_create(true);
        let ctx = context(transport.clone(), encrypter, factory);
        let mut member = lesser_member();

        assert!(member.connect(&ctx, &media(), None).await.is_err());
        assert!(member.peer_call_state().is_none());
        assert!(transport.sent_to_device().is_empty());
    }

    #[tokio::test]
    async fn test_encryption_failure_aborts_send_by_default() {
        let (transport, encrypter, factory) =
            (MockTransport::shared(), MockEncrypter::shared(), MockFactory::shared());
        encrypter.fail(true);
        let ctx = context(transport.clone(), encrypter, factory);
        let mut member = lesser_member();

        member.connect(&ctx, &media(), None).await.unwrap();

        // The leg progressed but nothing left the building.
        assert_eq!(member.peer_call_state(), Some(&PeerCallState::InviteSent));
        assert!(transport.sent_to_device().is_empty());
    }

    #[tokio::test]
    async fn test_unencrypted_fallback_when_allowed() {
        let (transport, encrypter, factory) =
            (MockTransport::shared(), MockEncrypter::shared(), MockFactory::shared());
        encrypter.fail(true);
        let mut ctx = context(transport.clone(), encrypter, factory);
        ctx.config.allow_unencrypted_fallback = true;
        let mut member = lesser_member();

        member.connect(&ctx, &media(), None).await.unwrap();

        let sent = transport.sent_to_device();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "m.call.invite", "plaintext event type used");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_transport_failure_is_retried() {
        let (transport, encrypter, factory) =
            (MockTransport::shared(), MockEncrypter::shared(), MockFactory::shared());
        transport.fail_to_device_times(2);
        let ctx = context(transport.clone(), encrypter, factory);
        let mut member = lesser_member();

        member.connect(&ctx, &media(), None).await.unwrap();

        assert_eq!(sent_payloads_of_type(&transport, "m.call.invite").len(), 1);
    }

    #[tokio::test]
    async fn test_outbound_seq_is_monotonic() {
        let (transport, encrypter, factory) =
            (MockTransport::shared(), MockEncrypter::shared(), MockFactory::shared());
        let ctx = context(transport.clone(), encrypter, factory);
        let mut member = lesser_member();
        let m = media();

        member.connect(&ctx, &m, None).await.unwrap();
        let call_id = member.peer_call_id().unwrap().clone();
        member
            .handle_message(
                &ctx,
                &inbound(
                    call_id.as_str(),
                    0,
                    SignallingPayload::Answer {
                        answer: SessionDescription::answer("remote-answer"),
                    },
                ),
                Some(&m),
                None,
            )
            .await
            .unwrap();
        member.hangup(&ctx, CallHangupReason::UserHangup).await;

        let mut seqs = Vec::new();
        for (_, messages, _) in transport.sent_to_device() {
            for devices in messages.values() {
                for content in devices.values() {
                    let (_, payload) = crate::test_support::decrypt_mock(content);
                    seqs.push(payload["seq"].as_u64().unwrap());
                }
            }
        }
        assert!(!seqs.is_empty());
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "seqs {:?}", seqs);
    }
}
