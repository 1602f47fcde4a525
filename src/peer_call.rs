//! Per-leg call state machine.
//!
//! One `PeerCall` drives the signalling handshake between the own device and
//! one remote device: offer/answer, candidate exchange, renegotiation via the
//! Perfect Negotiation pattern, and teardown. The WebRTC engine is injected;
//! engine callbacks re-enter through [`PeerCall::handle_engine_event`] so all
//! transitions happen on the owning task.
//!
//! Outbound messages accumulate in an outbox which the owning Member drains
//! after every operation, stamps with the conference envelope and transmits.

use crate::codec::{SignallingMessage, SignallingPayload};
use crate::error::{InvalidTransition, SignallingError};
use crate::external::{EngineEvent, IceConnectionState, PeerConnectionApi};
use crate::types::{
    CallDirection, CallHangupReason, CallId, IceCandidate, LocalMedia, MuteSettings, PartyId,
    SdpType, SessionDescription,
};
use log::{debug, warn};
use std::sync::Arc;

/// Milliseconds an outbound invite stays valid.
pub const INVITE_LIFETIME_MS: u32 = 60_000;

/// Current state of one call leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCallState {
    /// Created, nothing sent or received yet.
    Fledgling,
    /// Outgoing: building the offer.
    CreateOffer,
    /// Outgoing: invite sent, waiting for the answer.
    InviteSent,
    /// Incoming: invite received, waiting for local accept.
    Ringing,
    /// Incoming: building the answer.
    CreateAnswer,
    /// Descriptions exchanged, ICE connectivity in progress.
    Connecting,
    /// Media path established.
    Connected,
    /// Terminal.
    Ended { reason: CallHangupReason },
}

impl PeerCallState {
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    /// Whether descriptions are exchanged and the leg carries media state.
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

/// Outbound message produced by the state machine, before the Member stamps
/// the conference envelope onto it.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    Invite {
        offer: SessionDescription,
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
    Negotiate {
        description: SessionDescription,
    },
    SdpStreamMetadataChanged {
        metadata: serde_json::Value,
    },
}

/// State machine for one leg.
pub struct PeerCall {
    call_id: CallId,
    direction: CallDirection,
    /// Polite side of Perfect Negotiation: rolls back on offer collision.
    polite: bool,
    state: PeerCallState,
    engine: Arc<dyn PeerConnectionApi>,
    local_media: Option<Arc<LocalMedia>>,
    local_mute: MuteSettings,
    /// Offer carried by the invite, held until `answer()`.
    remote_offer: Option<SessionDescription>,
    remote_sdp_applied: bool,
    remote_candidate_buffer: Vec<IceCandidate>,
    pending_outbound_candidates: Vec<IceCandidate>,
    remote_metadata: Option<serde_json::Value>,
    opponent_party_id: Option<PartyId>,
    last_remote_seq: Option<u64>,
    /// A local offer is in flight (initial or renegotiation).
    negotiating: bool,
    outbox: Vec<PeerMessage>,
}

impl PeerCall {
    pub fn new_outgoing(call_id: CallId, engine: Arc<dyn PeerConnectionApi>, polite: bool) -> Self {
        Self::new(call_id, CallDirection::Outgoing, engine, polite)
    }

    pub fn new_incoming(call_id: CallId, engine: Arc<dyn PeerConnectionApi>, polite: bool) -> Self {
        Self::new(call_id, CallDirection::Incoming, engine, polite)
    }

    fn new(
        call_id: CallId,
        direction: CallDirection,
        engine: Arc<dyn PeerConnectionApi>,
        polite: bool,
    ) -> Self {
        Self {
            call_id,
            direction,
            polite,
            state: PeerCallState::Fledgling,
            engine,
            local_media: None,
            local_mute: MuteSettings::default(),
            remote_offer: None,
            remote_sdp_applied: false,
            remote_candidate_buffer: Vec::new(),
            pending_outbound_candidates: Vec::new(),
            remote_metadata: None,
            opponent_party_id: None,
            last_remote_seq: None,
            negotiating: false,
            outbox: Vec::new(),
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn state(&self) -> &PeerCallState {
        &self.state
    }

    pub fn opponent_party_id(&self) -> Option<&PartyId> {
        self.opponent_party_id.as_ref()
    }

    pub fn remote_metadata(&self) -> Option<&serde_json::Value> {
        self.remote_metadata.as_ref()
    }

    /// Drain messages produced since the last drain, in production order.
    pub fn take_outbox(&mut self) -> Vec<PeerMessage> {
        std::mem::take(&mut self.outbox)
    }

    fn set_state(&mut self, next: PeerCallState) {
        debug!("call {}: {:?} -> {:?}", self.call_id, self.state, next);
        self.state = next;
    }

    fn invalid(&self, attempted: &str) -> InvalidTransition {
        InvalidTransition {
            current_state: format!("{:?}", self.state),
            attempted: attempted.to_string(),
        }
    }

    /// Tear the leg down after an engine failure mid-operation.
    async fn abort_fatal(&mut self) {
        if !self.state.is_ended() {
            self.engine.close().await;
            self.set_state(PeerCallState::Ended {
                reason: CallHangupReason::UnknownError,
            });
        }
    }

    /// Start the outgoing handshake. No-op when already past `Fledgling`.
    pub async fn place_call(&mut self, media: Arc<LocalMedia>) -> Result<(), SignallingError> {
        if self.direction != CallDirection::Outgoing {
            return Err(SignallingError::InvalidOperation(
                "place_call on an incoming leg",
            ));
        }
        if self.state != PeerCallState::Fledgling {
            return Ok(());
        }

        self.set_state(PeerCallState::CreateOffer);
        if let Err(e) = self.drive_offer(media).await {
            warn!("call {}: offer setup failed: {}", self.call_id, e);
            self.abort_fatal().await;
            return Err(e);
        }
        self.set_state(PeerCallState::InviteSent);
        Ok(())
    }

    async fn drive_offer(&mut self, media: Arc<LocalMedia>) -> Result<(), SignallingError> {
        self.engine.set_tracks(&media).await?;
        self.local_media = Some(media);
        self.negotiating = true;
        let offer = self.engine.create_offer().await?;
        self.engine.set_local_description(&offer).await?;
        self.outbox.push(PeerMessage::Invite {
            offer,
            lifetime_ms: INVITE_LIFETIME_MS,
        });
        Ok(())
    }

    /// Accept an incoming leg. Only valid while `Ringing`.
    pub async fn answer(&mut self, media: Arc<LocalMedia>) -> Result<(), SignallingError> {
        if self.state != PeerCallState::Ringing {
            return Err(self.invalid("answer").into());
        }

        self.set_state(PeerCallState::CreateAnswer);
        if let Err(e) = self.drive_answer(media).await {
            warn!("call {}: answer setup failed: {}", self.call_id, e);
            self.abort_fatal().await;
            return Err(e);
        }
        self.set_state(PeerCallState::Connecting);
        Ok(())
    }

    async fn drive_answer(&mut self, media: Arc<LocalMedia>) -> Result<(), SignallingError> {
        let offer = self
            .remote_offer
            .take()
            .ok_or(SignallingError::InvalidOperation("ringing without an offer"))?;

        self.engine.set_tracks(&media).await?;
        self.local_media = Some(media);
        self.engine.set_remote_description(&offer).await?;
        self.remote_sdp_applied = true;
        self.flush_remote_candidates().await;

        let answer = self.engine.create_answer().await?;
        self.engine.set_local_description(&answer).await?;
        self.outbox.push(PeerMessage::Answer { answer });
        self.flush_pending_outbound_candidates();
        Ok(())
    }

    /// Apply one inbound signalling message for this leg.
    pub async fn handle_signalling(
        &mut self,
        message: &SignallingMessage,
    ) -> Result<(), SignallingError> {
        let seq = message.envelope.seq;
        if let Some(last) = self.last_remote_seq
            && seq <= last
        {
            debug!(
                "call {}: duplicate message (seq {} <= {}), ignoring",
                self.call_id, seq, last
            );
            return Ok(());
        }
        self.last_remote_seq = Some(seq);

        if self.opponent_party_id.is_none() {
            self.opponent_party_id = Some(message.envelope.party_id.clone());
        }

        match &message.payload {
            SignallingPayload::Invite { offer, .. } => self.handle_invite(offer).await,
            SignallingPayload::Answer { answer } => self.handle_answer(answer).await,
            SignallingPayload::Candidates { candidates } => {
                self.handle_candidates(candidates).await;
                Ok(())
            }
            SignallingPayload::Negotiate { description } => {
                self.handle_negotiate(description).await
            }
            SignallingPayload::Hangup { reason } => {
                self.end_from_remote(*reason).await;
                Ok(())
            }
            SignallingPayload::Reject => {
                self.end_from_remote(CallHangupReason::UserHangup).await;
                Ok(())
            }
            SignallingPayload::SdpStreamMetadataChanged { metadata } => {
                if !matches!(
                    self.state,
                    PeerCallState::Fledgling | PeerCallState::Ended { .. }
                ) {
                    self.remote_metadata = Some(metadata.clone());
                }
                Ok(())
            }
            SignallingPayload::Unknown { event_type, .. } => {
                debug!(
                    "call {}: ignoring unknown message type {}",
                    self.call_id, event_type
                );
                Ok(())
            }
        }
    }

    async fn handle_invite(&mut self, offer: &SessionDescription) -> Result<(), SignallingError> {
        match self.state {
            PeerCallState::Fledgling => {
                self.remote_offer = Some(offer.clone());
                self.set_state(PeerCallState::Ringing);
                Ok(())
            }
            // Glare between two legs is resolved by the Member before the
            // message reaches this machine; an invite here is a duplicate.
            _ => {
                debug!(
                    "call {}: invite in {:?}, ignoring",
                    self.call_id, self.state
                );
                Ok(())
            }
        }
    }

    async fn handle_answer(&mut self, answer: &SessionDescription) -> Result<(), SignallingError> {
        if self.state != PeerCallState::InviteSent {
            debug!(
                "call {}: answer in {:?}, ignoring",
                self.call_id, self.state
            );
            return Ok(());
        }

        if let Err(e) = self.engine.set_remote_description(answer).await {
            warn!("call {}: applying answer failed: {}", self.call_id, e);
            self.abort_fatal().await;
            return Err(e);
        }
        self.remote_sdp_applied = true;
        self.negotiating = false;
        self.flush_remote_candidates().await;
        self.flush_pending_outbound_candidates();
        self.set_state(PeerCallState::Connecting);
        Ok(())
    }

    async fn handle_candidates(&mut self, candidates: &[IceCandidate]) {
        if self.state.is_ended() {
            return;
        }
        if !self.remote_sdp_applied {
            self.remote_candidate_buffer.extend_from_slice(candidates);
            return;
        }
        for candidate in candidates {
            self.apply_remote_candidate(candidate).await;
        }
    }

    async fn apply_remote_candidate(&mut self, candidate: &IceCandidate) {
        if candidate.is_end_of_candidates() {
            debug!("call {}: remote end of candidates", self.call_id);
            return;
        }
        if let Err(e) = self.engine.add_ice_candidate(candidate).await {
            warn!("call {}: add_ice_candidate failed: {}", self.call_id, e);
        }
    }

    async fn flush_remote_candidates(&mut self) {
        let buffered = std::mem::take(&mut self.remote_candidate_buffer);
        for candidate in &buffered {
            self.apply_remote_candidate(candidate).await;
        }
    }

    fn flush_pending_outbound_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_outbound_candidates);
        if !pending.is_empty() {
            self.outbox
                .push(PeerMessage::Candidates { candidates: pending });
        }
    }

    async fn handle_negotiate(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), SignallingError> {
        if !self.state.is_established() {
            debug!(
                "call {}: negotiate in {:?}, ignoring",
                self.call_id, self.state
            );
            return Ok(());
        }

        match description.sdp_type {
            SdpType::Offer => {
                if self.negotiating {
                    if !self.polite {
                        debug!(
                            "call {}: offer collision, impolite side ignores",
                            self.call_id
                        );
                        return Ok(());
                    }
                    self.engine.rollback().await?;
                    self.negotiating = false;
                }
                if let Err(e) = self.apply_remote_renegotiation(description).await {
                    warn!("call {}: renegotiation failed: {}", self.call_id, e);
                    self.abort_fatal().await;
                    return Err(e);
                }
                Ok(())
            }
            SdpType::Answer => {
                if !self.negotiating {
                    debug!("call {}: unsolicited negotiate answer", self.call_id);
                    return Ok(());
                }
                if let Err(e) = self.engine.set_remote_description(description).await {
                    warn!("call {}: negotiate answer failed: {}", self.call_id, e);
                    self.abort_fatal().await;
                    return Err(e);
                }
                self.negotiating = false;
                Ok(())
            }
        }
    }

    async fn apply_remote_renegotiation(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<(), SignallingError> {
        self.engine.set_remote_description(offer).await?;
        let answer = self.engine.create_answer().await?;
        self.engine.set_local_description(&answer).await?;
        self.outbox
            .push(PeerMessage::Negotiate { description: answer });
        Ok(())
    }

    /// Apply one engine event for this leg.
    pub async fn handle_engine_event(&mut self, event: EngineEvent) -> Result<(), SignallingError> {
        if self.state.is_ended() {
            return Ok(());
        }

        match event {
            EngineEvent::NegotiationNeeded => {
                // Initial negotiation runs inside place_call/answer; this
                // path covers track changes on an established leg.
                if self.state == PeerCallState::Connected && !self.negotiating {
                    self.start_renegotiation().await?;
                }
                Ok(())
            }
            EngineEvent::IceCandidate(candidate) => {
                if self.remote_sdp_applied {
                    self.push_outbound_candidate(candidate);
                } else {
                    self.pending_outbound_candidates.push(candidate);
                }
                Ok(())
            }
            EngineEvent::IceGatheringComplete => {
                if self.remote_sdp_applied {
                    self.push_outbound_candidate(IceCandidate::end_of_candidates());
                } else {
                    self.pending_outbound_candidates
                        .push(IceCandidate::end_of_candidates());
                }
                Ok(())
            }
            EngineEvent::IceConnectionState(state) => {
                self.handle_ice_state(state).await;
                Ok(())
            }
            EngineEvent::FatalError(message) => {
                warn!("call {}: engine fatal error: {}", self.call_id, message);
                self.hangup(CallHangupReason::UnknownError).await;
                Ok(())
            }
        }
    }

    async fn handle_ice_state(&mut self, ice_state: IceConnectionState) {
        match ice_state {
            IceConnectionState::Connected => {
                if self.state == PeerCallState::Connecting {
                    self.set_state(PeerCallState::Connected);
                }
            }
            IceConnectionState::Failed => {
                self.hangup(CallHangupReason::IceFailed).await;
            }
            IceConnectionState::Closed => {
                self.close(None).await;
            }
            IceConnectionState::Disconnected => {
                debug!("call {}: ICE disconnected, waiting", self.call_id);
            }
            IceConnectionState::New | IceConnectionState::Checking => {}
        }
    }

    /// Batch candidates into the trailing outbox message where possible so
    /// one gathering tick produces one `m.call.candidates`.
    fn push_outbound_candidate(&mut self, candidate: IceCandidate) {
        if let Some(PeerMessage::Candidates { candidates }) = self.outbox.last_mut() {
            candidates.push(candidate);
        } else {
            self.outbox.push(PeerMessage::Candidates {
                candidates: vec![candidate],
            });
        }
    }

    async fn start_renegotiation(&mut self) -> Result<(), SignallingError> {
        self.negotiating = true;
        let offer = match self.engine.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!("call {}: renegotiation offer failed: {}", self.call_id, e);
                self.abort_fatal().await;
                return Err(e);
            }
        };
        if let Err(e) = self.engine.set_local_description(&offer).await {
            warn!("call {}: renegotiation offer failed: {}", self.call_id, e);
            self.abort_fatal().await;
            return Err(e);
        }
        self.outbox
            .push(PeerMessage::Negotiate { description: offer });
        Ok(())
    }

    /// Replace local tracks; a changed track set triggers renegotiation.
    pub async fn set_media(&mut self, media: Arc<LocalMedia>) -> Result<(), SignallingError> {
        let tracks_changed = self
            .local_media
            .as_ref()
            .map(|old| old.track_ids() != media.track_ids())
            .unwrap_or(true);

        if self.state.is_ended() {
            return Ok(());
        }
        if !self.state.is_established() {
            self.local_media = Some(media);
            return Ok(());
        }

        self.engine.set_tracks(&media).await?;
        self.local_media = Some(media);
        if tracks_changed && !self.negotiating {
            self.start_renegotiation().await?;
        }
        Ok(())
    }

    /// Update local mute; emits stream metadata when it changed.
    pub fn set_muted(&mut self, mute: MuteSettings) {
        if self.local_mute == mute {
            return;
        }
        self.local_mute = mute;
        if !self.state.is_established() {
            return;
        }
        let stream_id = self
            .local_media
            .as_ref()
            .map(|m| m.stream_id.clone())
            .unwrap_or_default();
        self.outbox.push(PeerMessage::SdpStreamMetadataChanged {
            metadata: serde_json::json!({
                stream_id: {
                    "purpose": "m.usermedia",
                    "audio_muted": mute.audio_muted,
                    "video_muted": mute.video_muted,
                }
            }),
        });
    }

    /// Terminate locally and tell the remote. Valid in any non-ended state.
    pub async fn hangup(&mut self, reason: CallHangupReason) {
        if self.state.is_ended() {
            return;
        }
        self.outbox.push(PeerMessage::Hangup { reason });
        self.engine.close().await;
        self.set_state(PeerCallState::Ended { reason });
    }

    /// Terminate locally without signalling the remote (peer already gone).
    pub async fn close(&mut self, reason: Option<CallHangupReason>) {
        if self.state.is_ended() {
            return;
        }
        self.engine.close().await;
        self.set_state(PeerCallState::Ended {
            reason: reason.unwrap_or(CallHangupReason::UnknownError),
        });
    }

    async fn end_from_remote(&mut self, reason: CallHangupReason) {
        if self.state.is_ended() {
            return;
        }
        self.engine.close().await;
        self.set_state(PeerCallState::Ended { reason });
    }
}
