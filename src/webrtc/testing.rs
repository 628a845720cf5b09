//! In-memory collaborators for session tests

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::config::{IceServer, IceServerSet};
use super::directory::{ChannelEndpoints, ChannelResolver, IceServerDirectory};
use super::media::{LocalMediaStream, LocalTrack, MediaCapture, MediaConstraints, MediaKind};
use super::negotiator::{NegotiationExit, RemoteStream, SharedContext, StreamSlot};
use super::peer::{
    DataChannel, PeerTransport, PeerTransportFactory, TransportEvent, TransportStats,
};
use super::session::Collaborators;
use super::signaling::{
    ConnectionState, IceCandidate, OutboundMessage, PeerId, SessionDescription,
    SignalingConnector, SignalingEvent, SignalingSession, SignalingTransport,
};
use crate::config::{CredentialCell, Role, SessionConfig};
use crate::error::{AppError, Result};
use crate::events::EventBus;
use crate::utils::LogThrottler;

// ============================================================================
// Directory
// ============================================================================

#[derive(Default)]
pub struct FakeResolver {
    failure: Mutex<Option<String>>,
}

impl FakeResolver {
    pub fn fail(&self, reason: &str) {
        *self.failure.lock() = Some(reason.to_string());
    }

    pub fn succeed(&self) {
        *self.failure.lock() = None;
    }
}

#[async_trait]
impl ChannelResolver for FakeResolver {
    async fn resolve(
        &self,
        channel: &str,
        _role: Role,
        _credentials: &CredentialCell,
    ) -> Result<ChannelEndpoints> {
        if let Some(reason) = self.failure.lock().clone() {
            return Err(AppError::ChannelResolution(reason));
        }
        Ok(ChannelEndpoints {
            channel_id: format!("channel/{}", channel),
            control_endpoint: "https://control.test".to_string(),
            signaling_endpoint: "wss://signaling.test".to_string(),
        })
    }
}

#[derive(Default)]
pub struct FakeIceDirectory {
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl FakeIceDirectory {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl IceServerDirectory for FakeIceDirectory {
    async fn fetch_ice_servers(
        &self,
        _endpoints: &ChannelEndpoints,
        _client_id: Option<&str>,
        _credentials: &CredentialCell,
    ) -> Result<Vec<IceServer>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::DirectoryUnavailable("ice lookup refused".to_string()));
        }
        Ok(vec![IceServer::relay(
            vec!["turn:relay.test:443".to_string()],
            "user",
            "pass",
        )])
    }
}

// ============================================================================
// Signaling
// ============================================================================

#[derive(Default)]
struct SignalingState {
    sent: Mutex<Vec<OutboundMessage>>,
    events: Mutex<Option<mpsc::UnboundedSender<SignalingEvent>>>,
    open_delay: Mutex<Option<Duration>>,
    close_count: AtomicUsize,
}

/// Relay stand-in; every transport it connects shares one recorded state
#[derive(Clone, Default)]
pub struct FakeSignaling {
    state: Arc<SignalingState>,
}

impl FakeSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.state.open_delay.lock() = Some(delay);
    }

    /// Deliver an event as if it came from the relay
    pub fn inject(&self, event: SignalingEvent) {
        if let Some(tx) = self.state.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    /// The relay drops the connection
    pub fn remote_close(&self) {
        if let Some(tx) = self.state.events.lock().take() {
            let _ = tx.send(SignalingEvent::Closed);
        }
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.state.sent.lock().clone()
    }

    pub fn sent_kinds(&self) -> Vec<String> {
        self.state
            .sent
            .lock()
            .iter()
            .map(|m| m.signal.kind().to_string())
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.state.close_count.load(Ordering::SeqCst)
    }
}

struct FakeSignalingTransport {
    state: Arc<SignalingState>,
}

#[async_trait]
impl SignalingTransport for FakeSignalingTransport {
    async fn open(&self, events: mpsc::UnboundedSender<SignalingEvent>) -> Result<()> {
        let delay = *self.state.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let _ = events.send(SignalingEvent::Opened);
        *self.state.events.lock() = Some(events);
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> Result<()> {
        if self.state.events.lock().is_none() {
            return Err(AppError::Signaling("not open".to_string()));
        }
        self.state.sent.lock().push(message);
        Ok(())
    }

    async fn close(&self) {
        self.state.close_count.fetch_add(1, Ordering::SeqCst);
        self.state.events.lock().take();
    }
}

#[async_trait]
impl SignalingConnector for FakeSignaling {
    async fn connect(
        &self,
        _endpoints: &ChannelEndpoints,
        _role: Role,
        _client_id: Option<&str>,
        _credentials: &CredentialCell,
    ) -> Result<Arc<dyn SignalingTransport>> {
        Ok(Arc::new(FakeSignalingTransport {
            state: self.state.clone(),
        }))
    }
}

// ============================================================================
// Transports
// ============================================================================

/// Behaviour of the transports a [`FakeTransportFactory`] creates
#[derive(Debug, Clone, Default)]
pub struct TransportScript {
    /// Hold back the end-of-gathering marker until `finish_gathering`
    pub hold_gathering_complete: bool,
    pub reject_remote_description: bool,
    pub reject_candidates: bool,
    pub create_delay: Option<Duration>,
    pub fail_create: bool,
    pub broken_data_channel: bool,
}

#[derive(Default)]
struct FactoryState {
    default_script: Mutex<TransportScript>,
    scripts: Mutex<HashMap<usize, TransportScript>>,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    attempts: AtomicUsize,
    live: Arc<AtomicUsize>,
    stats_calls: Arc<AtomicUsize>,
}

#[derive(Clone, Default)]
pub struct FakeTransportFactory {
    state: Arc<FactoryState>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script for every transport without its own
    pub fn script(&self, script: TransportScript) {
        *self.state.default_script.lock() = script;
    }

    /// Script for the transport created `index`-th (from 0)
    pub fn script_for(&self, index: usize, script: TransportScript) {
        self.state.scripts.lock().insert(index, script);
    }

    pub fn last(&self) -> Option<Arc<FakeTransport>> {
        self.state.transports.lock().last().cloned()
    }

    pub fn all(&self) -> Vec<Arc<FakeTransport>> {
        self.state.transports.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.state.transports.lock().len()
    }

    /// Transports created and not yet closed
    pub fn live(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn stats_calls(&self) -> usize {
        self.state.stats_calls.load(Ordering::SeqCst)
    }

    /// A transport outside any negotiation
    pub fn transport_for_test(&self) -> Arc<dyn PeerTransport> {
        let (events, _) = mpsc::unbounded_channel();
        self.build(TransportScript::default(), events)
    }

    fn build(
        &self,
        script: TransportScript,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<FakeTransport> {
        self.state.live.fetch_add(1, Ordering::SeqCst);
        Arc::new(FakeTransport {
            script,
            events,
            local: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            data_sent: Arc::new(Mutex::new(Vec::new())),
            descriptions: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            live: self.state.live.clone(),
            stats_calls: self.state.stats_calls.clone(),
        })
    }
}

#[async_trait]
impl PeerTransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        _ice_servers: &IceServerSet,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let index = self.state.attempts.fetch_add(1, Ordering::SeqCst);
        let script = self
            .state
            .scripts
            .lock()
            .get(&index)
            .cloned()
            .unwrap_or_else(|| self.state.default_script.lock().clone());

        if let Some(delay) = script.create_delay {
            tokio::time::sleep(delay).await;
        }
        if script.fail_create {
            return Err(AppError::TransportUnavailable("scripted failure".to_string()));
        }

        let transport = self.build(script, events);
        self.state.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

pub struct FakeTransport {
    script: TransportScript,
    events: mpsc::UnboundedSender<TransportEvent>,
    local: Mutex<Option<SessionDescription>>,
    applied: Mutex<Vec<String>>,
    data_sent: Arc<Mutex<Vec<Vec<u8>>>>,
    descriptions: AtomicUsize,
    closed: AtomicBool,
    live: Arc<AtomicUsize>,
    stats_calls: Arc<AtomicUsize>,
}

impl FakeTransport {
    pub fn applied_candidates(&self) -> Vec<String> {
        self.applied.lock().clone()
    }

    pub fn data_sent(&self) -> Vec<Vec<u8>> {
        self.data_sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn finish_gathering(&self) {
        let _ = self.events.send(TransportEvent::LocalCandidate(None));
    }

    pub fn emit_track(&self, stream_id: &str, kind: &str) {
        let kind = if kind == "audio" {
            MediaKind::Audio
        } else {
            MediaKind::Video
        };
        let _ = self.events.send(TransportEvent::Track {
            stream_id: stream_id.to_string(),
            track_id: format!("{}-{}", stream_id, kind),
            kind,
        });
    }

    pub fn emit_state(&self, state: ConnectionState) {
        let _ = self.events.send(TransportEvent::StateChanged(state));
    }

    pub fn emit_message(&self, text: &str) {
        let _ = self.events.send(TransportEvent::Message {
            label: super::peer::DATA_CHANNEL_LABEL.to_string(),
            data: Bytes::copy_from_slice(text.as_bytes()),
        });
    }

    fn next_description(&self, prefix: &str) -> String {
        let n = self.descriptions.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", prefix, n)
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, _track: &LocalTrack) -> Result<()> {
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        Ok(Arc::new(FakeDataChannel {
            label: label.to_string(),
            broken: self.script.broken_data_channel,
            sent: self.data_sent.clone(),
        }))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(self.next_description("fake-offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(self.next_description("fake-answer")))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<()> {
        *self.local.lock() = Some(description.clone());
        for i in 0..2 {
            let candidate = IceCandidate::new(format!("candidate:{} 1 udp 1 10.0.0.1 {} typ host", i, 5000 + i))
                .with_mid("0", 0);
            let _ = self.events.send(TransportEvent::LocalCandidate(Some(candidate)));
        }
        if !self.script.hold_gathering_complete {
            let _ = self.events.send(TransportEvent::LocalCandidate(None));
        }
        Ok(())
    }

    async fn set_remote_description(&self, _description: &SessionDescription) -> Result<()> {
        if self.script.reject_remote_description {
            return Err(AppError::Negotiation("malformed description".to_string()));
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        if self.script.reject_candidates {
            return Err(AppError::Candidate(candidate.candidate.clone()));
        }
        self.applied.lock().push(candidate.candidate.clone());
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        Ok(TransportStats {
            packets_sent: 10,
            packets_received: 8,
            round_trip_time: Some(0.02),
            ..Default::default()
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct FakeDataChannel {
    label: String,
    broken: bool,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if self.broken {
            return Err(AppError::DataChannel("channel closed".to_string()));
        }
        self.sent.lock().push(data.to_vec());
        Ok(())
    }

    async fn close(&self) {}
}

// ============================================================================
// Media
// ============================================================================

#[derive(Default)]
pub struct FakeCapture {
    acquired: AtomicUsize,
    failing: AtomicBool,
    last: Mutex<Option<Arc<LocalMediaStream>>>,
}

impl FakeCapture {
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<Arc<LocalMediaStream>> {
        self.last.lock().clone()
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<Arc<LocalMediaStream>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::DeviceUnavailable("permission dismissed".to_string()));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);

        let mut tracks = Vec::new();
        if constraints.video.is_some() {
            tracks.push(LocalTrack::new(MediaKind::Video, "test-video"));
        }
        if constraints.audio.is_some() {
            tracks.push(LocalTrack::new(MediaKind::Audio, "test-audio"));
        }
        let stream = Arc::new(LocalMediaStream::new(tracks));
        *self.last.lock() = Some(stream.clone());
        Ok(stream)
    }
}

// ============================================================================
// Assemblies
// ============================================================================

/// Every collaborator of a session, faked
pub struct FakeWorld {
    pub resolver: Arc<FakeResolver>,
    pub ice: Arc<FakeIceDirectory>,
    pub signaling: FakeSignaling,
    pub capture: Arc<FakeCapture>,
    pub factory: FakeTransportFactory,
}

impl FakeWorld {
    pub fn new() -> Self {
        Self {
            resolver: Arc::new(FakeResolver::default()),
            ice: Arc::new(FakeIceDirectory::default()),
            signaling: FakeSignaling::new(),
            capture: Arc::new(FakeCapture::default()),
            factory: FakeTransportFactory::new(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            resolver: self.resolver.clone(),
            ice_directory: self.ice.clone(),
            signaling: Arc::new(self.signaling.clone()),
            capture: self.capture.clone(),
            transports: Arc::new(self.factory.clone()),
        }
    }
}

/// Opened signaling plus fakes for driving single negotiations
pub struct Harness {
    pub signaling: FakeSignaling,
    pub factory: FakeTransportFactory,
    pub events: Arc<EventBus>,
    pub keyed_streams: watch::Receiver<HashMap<PeerId, RemoteStream>>,
    pub single_stream: watch::Receiver<Option<RemoteStream>>,
    role: Role,
    session: Arc<SignalingSession>,
    keyed_tx: Arc<watch::Sender<HashMap<PeerId, RemoteStream>>>,
    single_tx: Arc<watch::Sender<Option<RemoteStream>>>,
    exits_tx: mpsc::UnboundedSender<NegotiationExit>,
    exits: tokio::sync::Mutex<mpsc::UnboundedReceiver<NegotiationExit>>,
    _signals: mpsc::UnboundedReceiver<SignalingEvent>,
}

impl Harness {
    pub async fn host(config: SessionConfig) -> Self {
        Self::open(config, Role::Host).await
    }

    pub async fn watcher(config: SessionConfig) -> Self {
        Self::open(config, Role::Watcher).await
    }

    async fn open(config: SessionConfig, role: Role) -> Self {
        let signaling = FakeSignaling::new();
        let session = SignalingSession::connect(
            &config,
            role,
            &FakeResolver::default(),
            &signaling,
            &CredentialCell::default(),
        )
        .await
        .unwrap();
        let signals = session.open().await.unwrap();

        let (keyed_tx, keyed_streams) = watch::channel(HashMap::new());
        let (single_tx, single_stream) = watch::channel(None);
        let (exits_tx, exits) = mpsc::unbounded_channel();

        Self {
            signaling,
            factory: FakeTransportFactory::new(),
            events: Arc::new(EventBus::new()),
            keyed_streams,
            single_stream,
            role,
            session: Arc::new(session),
            keyed_tx: Arc::new(keyed_tx),
            single_tx: Arc::new(single_tx),
            exits_tx,
            exits: tokio::sync::Mutex::new(exits),
            _signals: signals,
        }
    }

    pub fn context(&self) -> SharedContext {
        let streams = match self.role {
            Role::Host => StreamSlot::Keyed(self.keyed_tx.clone()),
            Role::Watcher => StreamSlot::Single(self.single_tx.clone()),
        };
        SharedContext {
            ice_servers: Arc::new(IceServerSet::empty()),
            signaling: self.session.clone(),
            factory: Arc::new(self.factory.clone()),
            media: None,
            events: self.events.clone(),
            throttler: Arc::new(LogThrottler::default()),
            streams,
            exits: Some(self.exits_tx.clone()),
        }
    }

    /// Let spawned tasks drain their queues
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    pub async fn next_exit(&self) -> NegotiationExit {
        let mut exits = self.exits.lock().await;
        tokio::time::timeout(Duration::from_secs(2), exits.recv())
            .await
            .expect("no negotiation exit")
            .expect("exit channel closed")
    }
}
