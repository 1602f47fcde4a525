//! Mock implementations of the injected capabilities, shared by the unit and
//! scenario tests.

use crate::error::SignallingError;
use crate::external::{
    Clock, DeviceMessageEncrypter, EncryptedEnvelope, HomeserverTransport, IceServerConfig,
    PeerConnectionApi, PeerConnectionFactory, ToDeviceMessages,
};
use crate::types::{
    DeviceId, IceCandidate, LocalMedia, RoomId, SdpType, SessionDescription, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Records every engine operation; individual operations can be failed.
#[derive(Default)]
pub(crate) struct MockPeerConnection {
    offers: AtomicUsize,
    answers: AtomicUsize,
    candidates: AtomicUsize,
    rollbacks: AtomicUsize,
    closed: AtomicBool,
    failing: Mutex<HashSet<&'static str>>,
    pub remote_descriptions: Mutex<Vec<SessionDescription>>,
    pub local_descriptions: Mutex<Vec<SessionDescription>>,
}

impl MockPeerConnection {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    fn check(&self, op: &'static str) -> Result<(), SignallingError> {
        if self.failing.lock().unwrap().contains(op) {
            return Err(SignallingError::WebRtc(format!("mock failure in {}", op)));
        }
        Ok(())
    }

    pub fn added_candidates(&self) -> usize {
        self.candidates.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnectionApi for MockPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, SignallingError> {
        self.check("create_offer")?;
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("mock-offer-{}", n)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SignallingError> {
        self.check("create_answer")?;
        let n = self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::answer(format!("mock-answer-{}", n)))
    }

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), SignallingError> {
        self.check("set_local_description")?;
        self.local_descriptions
            .lock()
            .unwrap()
            .push(description.clone());
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), SignallingError> {
        self.check("set_remote_description")?;
        self.remote_descriptions
            .lock()
            .unwrap()
            .push(description.clone());
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: &IceCandidate) -> Result<(), SignallingError> {
        self.check("add_ice_candidate")?;
        self.candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_tracks(&self, _media: &LocalMedia) -> Result<(), SignallingError> {
        self.check("set_tracks")
    }

    async fn rollback(&self) -> Result<(), SignallingError> {
        self.check("rollback")?;
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Creates mock connections and keeps handles for inspection.
#[derive(Default)]
pub(crate) struct MockFactory {
    pub connections: Mutex<Vec<Arc<MockPeerConnection>>>,
    fail_create: AtomicBool,
}

impl MockFactory {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn connection(&self, index: usize) -> Arc<MockPeerConnection> {
        self.connections.lock().unwrap()[index].clone()
    }

    pub fn created(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockFactory {
    async fn create_peer_connection(
        &self,
        _ice_servers: Option<&IceServerConfig>,
    ) -> Result<Arc<dyn PeerConnectionApi>, SignallingError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SignallingError::WebRtc("mock factory failure".into()));
        }
        let connection = MockPeerConnection::shared();
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

pub(crate) type SentStateEvent = (RoomId, String, String, serde_json::Value);
pub(crate) type SentToDevice = (String, ToDeviceMessages, String);

/// Records homeserver traffic; sends can be made to fail.
#[derive(Default)]
pub(crate) struct MockTransport {
    pub state_events: Mutex<Vec<SentStateEvent>>,
    pub to_device: Mutex<Vec<SentToDevice>>,
    fail_state: AtomicBool,
    fail_to_device: AtomicBool,
    /// Remaining number of to-device sends that fail before succeeding.
    fail_to_device_times: AtomicUsize,
    fail_turn: AtomicBool,
}

impl MockTransport {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_state_events(&self, fail: bool) {
        self.fail_state.store(fail, Ordering::SeqCst);
    }

    pub fn fail_to_device(&self, fail: bool) {
        self.fail_to_device.store(fail, Ordering::SeqCst);
    }

    pub fn fail_to_device_times(&self, times: usize) {
        self.fail_to_device_times.store(times, Ordering::SeqCst);
    }

    pub fn fail_turn(&self, fail: bool) {
        self.fail_turn.store(fail, Ordering::SeqCst);
    }

    pub fn sent_to_device(&self) -> Vec<SentToDevice> {
        self.to_device.lock().unwrap().clone()
    }

    pub fn sent_state_events(&self) -> Vec<SentStateEvent> {
        self.state_events.lock().unwrap().clone()
    }
}

#[async_trait]
impl HomeserverTransport for MockTransport {
    async fn send_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
        content: serde_json::Value,
    ) -> Result<String, SignallingError> {
        if self.fail_state.load(Ordering::SeqCst) {
            return Err(SignallingError::Transport("mock state send failure".into()));
        }
        let mut events = self.state_events.lock().unwrap();
        events.push((
            room_id.clone(),
            event_type.to_string(),
            state_key.to_string(),
            content,
        ));
        Ok(format!("$event{}", events.len()))
    }

    async fn send_to_device(
        &self,
        event_type: &str,
        messages: ToDeviceMessages,
        txn_id: &str,
    ) -> Result<(), SignallingError> {
        if self.fail_to_device.load(Ordering::SeqCst) {
            return Err(SignallingError::Transport(
                "mock to-device send failure".into(),
            ));
        }
        let remaining = self.fail_to_device_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_to_device_times
                .store(remaining - 1, Ordering::SeqCst);
            return Err(SignallingError::Transport(
                "mock transient to-device failure".into(),
            ));
        }
        self.to_device.lock().unwrap().push((
            event_type.to_string(),
            messages,
            txn_id.to_string(),
        ));
        Ok(())
    }

    async fn query_turn_settings(&self) -> Result<IceServerConfig, SignallingError> {
        if self.fail_turn.load(Ordering::SeqCst) {
            return Err(SignallingError::Transport("mock turn failure".into()));
        }
        Ok(IceServerConfig {
            urls: vec!["turn:turn.example.org:3478".into()],
            username: Some("user".into()),
            password: Some("pass".into()),
            ttl_secs: Some(86_400),
        })
    }
}

/// Wraps payloads in a recognizable envelope; can be made to fail.
#[derive(Default)]
pub(crate) struct MockEncrypter {
    fail: AtomicBool,
    pub encrypted: AtomicUsize,
}

impl MockEncrypter {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceMessageEncrypter for MockEncrypter {
    async fn encrypt(
        &self,
        _room_id: &RoomId,
        user_id: &UserId,
        device_id: &DeviceId,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<EncryptedEnvelope, SignallingError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SignallingError::Encryption("mock encrypter failure".into()));
        }
        self.encrypted.fetch_add(1, Ordering::SeqCst);
        Ok(EncryptedEnvelope {
            event_type: "m.room.encrypted".to_string(),
            content: json!({
                "algorithm": "m.olm.v1.curve25519-aes-sha2",
                "recipient": user_id.as_str(),
                "recipient_device": device_id.as_str(),
                "plaintext_type": event_type,
                "payload": payload,
            }),
        })
    }
}

/// Controllable clock.
pub(crate) struct TestClock {
    now: Mutex<DateTime<Utc>>,
}

impl TestClock {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()),
        })
    }

    pub fn advance_secs(&self, secs: i64) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::seconds(secs);
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Decode a mock-encrypted to-device payload back to the inner content.
pub(crate) fn decrypt_mock(content: &serde_json::Value) -> (String, serde_json::Value) {
    (
        content["plaintext_type"].as_str().unwrap().to_string(),
        content["payload"].clone(),
    )
}

/// Extract all plaintext signalling payloads of one event type sent to a
/// device, in transmission order.
pub(crate) fn sent_payloads_of_type(
    transport: &MockTransport,
    event_type: &str,
) -> Vec<serde_json::Value> {
    transport
        .sent_to_device()
        .iter()
        .flat_map(|(_, messages, _)| {
            messages
                .values()
                .flat_map(|devices| devices.values())
                .map(decrypt_mock)
                .collect::<Vec<_>>()
        })
        .filter(|(t, _)| t == event_type)
        .map(|(_, payload)| payload)
        .collect()
}
