//! Per-peer negotiation state machine
//!
//! Every negotiation runs in its own task with its own inbox, so one slow
//! peer never holds up another and per-peer ordering is the inbox order.
//! The task drives one transport from creation through offer/answer and
//! candidate exchange, then tears it down exactly once, whether it ends by
//! shutdown, by error or because the transport closed.
//!
//! ```text
//! NEW ─┬─ remote offer (host) ─→ HAVE_REMOTE_OFFER ─┐
//!      └─ local offer (watcher) → HAVE_LOCAL_OFFER ─┴→ NEGOTIATED
//!           → GATHERING_CANDIDATES → CONNECTED → CLOSED (from any state)
//! ```

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::candidates::{CandidateDisposition, CandidateQueue};
use super::config::IceServerSet;
use super::media::{LocalMediaStream, MediaKind};
use super::peer::{DataChannel, PeerTransport, PeerTransportFactory, TransportEvent, DATA_CHANNEL_LABEL};
use super::peer_table::Generation;
use super::signaling::{
    ConnectionState, IceCandidate, PeerId, SdpType, SessionDescription, SignalingSession,
};
use super::stats::StatsPoller;
use crate::config::{CandidateStrategy, Role};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    New,
    HaveRemoteOffer,
    HaveLocalOffer,
    Negotiated,
    GatheringCandidates,
    Connected,
    Closed,
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NegotiationState::New => "NEW",
            NegotiationState::HaveRemoteOffer => "HAVE_REMOTE_OFFER",
            NegotiationState::HaveLocalOffer => "HAVE_LOCAL_OFFER",
            NegotiationState::Negotiated => "NEGOTIATED",
            NegotiationState::GatheringCandidates => "GATHERING_CANDIDATES",
            NegotiationState::Connected => "CONNECTED",
            NegotiationState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Remote media bound to a negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_id: String,
    pub kind: MediaKind,
    /// Generation of the negotiation that bound it
    pub generation: Generation,
}

/// Where a negotiation publishes its remote stream
#[derive(Clone)]
pub enum StreamSlot {
    /// Host: one entry per peer id
    Keyed(Arc<watch::Sender<HashMap<PeerId, RemoteStream>>>),
    /// Watcher: the single remote stream
    Single(Arc<watch::Sender<Option<RemoteStream>>>),
}

impl StreamSlot {
    fn bind(&self, peer_id: Option<&PeerId>, stream: RemoteStream) {
        match self {
            StreamSlot::Keyed(tx) => {
                if let Some(peer_id) = peer_id {
                    tx.send_modify(|map| {
                        map.insert(peer_id.clone(), stream);
                    });
                }
            }
            StreamSlot::Single(tx) => {
                tx.send_replace(Some(stream));
            }
        }
    }

    /// Clear the slot if it still holds the stream of `generation`
    fn clear(&self, peer_id: Option<&PeerId>, generation: Generation) -> bool {
        match self {
            StreamSlot::Keyed(tx) => {
                let Some(peer_id) = peer_id else {
                    return false;
                };
                tx.send_if_modified(|map| match map.get(peer_id) {
                    Some(s) if s.generation == generation => {
                        map.remove(peer_id);
                        true
                    }
                    _ => false,
                })
            }
            StreamSlot::Single(tx) => tx.send_if_modified(|slot| match slot {
                Some(s) if s.generation == generation => {
                    *slot = None;
                    true
                }
                _ => false,
            }),
        }
    }
}

/// Signal routed to a negotiation
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorInput {
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
}

/// Why a negotiation ended
#[derive(Debug)]
pub enum ExitReason {
    /// Shut down by its owner
    Shutdown,
    /// The transport reported a terminal state
    TransportEnded(ConnectionState),
    /// A negotiation step failed with this error
    Failed(AppError),
}

impl ExitReason {
    /// The error to report to the owner, `None` for a clean shutdown
    pub fn into_error(self) -> Option<AppError> {
        match self {
            ExitReason::Shutdown => None,
            ExitReason::TransportEnded(state) => {
                Some(AppError::TransportUnavailable(format!("transport {}", state)))
            }
            ExitReason::Failed(error) => Some(error),
        }
    }
}

impl PartialEq for ExitReason {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ExitReason::Shutdown, ExitReason::Shutdown) => true,
            (ExitReason::TransportEnded(a), ExitReason::TransportEnded(b)) => a == b,
            (ExitReason::Failed(a), ExitReason::Failed(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}

/// Sent to the owner once a negotiation has torn down
#[derive(Debug)]
pub struct NegotiationExit {
    pub peer_id: Option<PeerId>,
    pub generation: Generation,
    pub reason: ExitReason,
}

/// Per-negotiation parameters
#[derive(Debug, Clone)]
pub struct NegotiatorParams {
    pub role: Role,
    pub peer_id: Option<PeerId>,
    pub generation: Generation,
    pub open_data_channel: bool,
    pub stats_interval: Option<Duration>,
}

/// Resources shared by every negotiation of a session
#[derive(Clone)]
pub struct SharedContext {
    pub ice_servers: Arc<IceServerSet>,
    pub signaling: Arc<SignalingSession>,
    pub factory: Arc<dyn PeerTransportFactory>,
    pub media: Option<Arc<LocalMediaStream>>,
    pub events: Arc<EventBus>,
    pub throttler: Arc<LogThrottler>,
    pub streams: StreamSlot,
    pub exits: Option<mpsc::UnboundedSender<NegotiationExit>>,
}

type DataChannelSlot = Arc<RwLock<Option<Arc<dyn DataChannel>>>>;

/// Owner's handle to a running negotiation
pub struct NegotiationHandle {
    peer_id: Option<PeerId>,
    generation: Generation,
    inbox: mpsc::UnboundedSender<NegotiatorInput>,
    data_channel: DataChannelSlot,
    state: watch::Receiver<NegotiationState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NegotiationHandle {
    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<NegotiationState> {
        self.state.clone()
    }

    /// Queue a signal. Returns `false` once the negotiation has ended.
    pub fn deliver(&self, input: NegotiatorInput) -> bool {
        self.inbox.send(input).is_ok()
    }

    pub fn has_data_channel(&self) -> bool {
        self.data_channel.read().is_some()
    }

    /// Send on the negotiation's own data channel
    pub async fn send_data(&self, data: Bytes) -> Result<()> {
        let channel = self.data_channel.read().clone();
        match channel {
            Some(channel) => channel.send(data).await,
            None => Err(AppError::DataChannel("no data channel".to_string())),
        }
    }

    /// Abandon any in-flight step and wait for teardown. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    warn!("Negotiation task for {:?} ended abnormally: {}", self.peer_id, e);
                }
            }
            None => {
                // Another caller is awaiting the task; wait for its teardown.
                // The sender drops with the task, which also ends the wait.
                let mut state = self.state.clone();
                let _ = state.wait_for(|s| *s == NegotiationState::Closed).await;
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|t| t.is_finished())
            .unwrap_or(true)
    }
}

impl Drop for NegotiationHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One negotiation with one remote peer
pub struct PeerNegotiator {
    params: NegotiatorParams,
    ctx: SharedContext,
    strategy: CandidateStrategy,
    state: watch::Sender<NegotiationState>,
    queue: CandidateQueue,
    transport: Option<Arc<dyn PeerTransport>>,
    data_channel: DataChannelSlot,
    poller: Option<StatsPoller>,
    stream_bound: bool,
    description_sent: bool,
    held_candidates: usize,
}

impl PeerNegotiator {
    /// Start a negotiation task
    ///
    /// In the watcher role the task creates and sets the local offer right
    /// away; in the host role it waits for the remote offer in its inbox.
    pub fn spawn(params: NegotiatorParams, ctx: SharedContext) -> NegotiationHandle {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(NegotiationState::New);
        let cancel = CancellationToken::new();
        let data_channel: DataChannelSlot = Arc::new(RwLock::new(None));

        let negotiator = PeerNegotiator {
            strategy: ctx.signaling.candidate_strategy(),
            params: params.clone(),
            ctx,
            state: state_tx,
            queue: CandidateQueue::new(),
            transport: None,
            data_channel: data_channel.clone(),
            poller: None,
            stream_bound: false,
            description_sent: false,
            held_candidates: 0,
        };

        let task = tokio::spawn(negotiator.run(inbox_rx, cancel.clone()));

        NegotiationHandle {
            peer_id: params.peer_id,
            generation: params.generation,
            inbox: inbox_tx,
            data_channel,
            state: state_rx,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    fn remote_label(&self) -> &str {
        self.params
            .peer_id
            .as_ref()
            .map(|p| p.as_str())
            .unwrap_or("host")
    }

    fn set_state(&self, state: NegotiationState) {
        if *self.state.borrow() == state {
            return;
        }
        debug!("Negotiation with {} -> {}", self.remote_label(), state);
        self.state.send_replace(state);
        self.ctx.events.publish(SessionEvent::PeerStateChanged {
            peer_id: self.params.peer_id.clone(),
            state,
        });
    }

    fn current_state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<NegotiatorInput>,
        cancel: CancellationToken,
    ) {
        let reason = tokio::select! {
            biased;
            _ = cancel.cancelled() => ExitReason::Shutdown,
            result = self.negotiate(&mut inbox) => match result {
                Ok(reason) => reason,
                Err(e) => {
                    warn!("Negotiation with {} failed: {}", self.remote_label(), e);
                    ExitReason::Failed(e)
                }
            },
        };

        self.teardown().await;

        if let Some(ref exits) = self.ctx.exits {
            let _ = exits.send(NegotiationExit {
                peer_id: self.params.peer_id.clone(),
                generation: self.params.generation,
                reason,
            });
        }
    }

    async fn negotiate(
        &mut self,
        inbox: &mut mpsc::UnboundedReceiver<NegotiatorInput>,
    ) -> Result<ExitReason> {
        let (events_tx, mut transport_events) = mpsc::unbounded_channel();
        let transport = self
            .ctx
            .factory
            .create(&self.ctx.ice_servers, events_tx)
            .await?;
        self.transport = Some(transport.clone());

        if let Some(ref media) = self.ctx.media {
            for track in media.tracks() {
                transport.add_track(track).await?;
            }
        }

        if self.params.open_data_channel {
            let channel = transport.create_data_channel(DATA_CHANNEL_LABEL).await?;
            *self.data_channel.write() = Some(channel);
        }

        if let Some(period) = self.params.stats_interval {
            self.poller = Some(StatsPoller::spawn(
                self.params.peer_id.clone(),
                transport.clone(),
                period,
                self.ctx.events.clone(),
                self.ctx.throttler.clone(),
            ));
        }

        if self.params.role == Role::Watcher {
            self.make_offer(&transport).await?;
        }

        loop {
            tokio::select! {
                input = inbox.recv() => match input {
                    Some(input) => self.handle_input(&transport, input).await?,
                    None => return Ok(ExitReason::Shutdown),
                },
                event = transport_events.recv() => match event {
                    Some(event) => {
                        if let Some(reason) = self.handle_transport_event(&transport, event).await? {
                            return Ok(reason);
                        }
                    }
                    None => return Ok(ExitReason::TransportEnded(ConnectionState::Closed)),
                },
            }
        }
    }

    async fn make_offer(&mut self, transport: &Arc<dyn PeerTransport>) -> Result<()> {
        let offer = transport.create_offer().await?;
        transport.set_local_description(&offer).await?;
        self.set_state(NegotiationState::HaveLocalOffer);

        if self.strategy == CandidateStrategy::Trickle {
            self.send_description(&offer).await;
        }
        Ok(())
    }

    async fn handle_input(
        &mut self,
        transport: &Arc<dyn PeerTransport>,
        input: NegotiatorInput,
    ) -> Result<()> {
        match input {
            NegotiatorInput::RemoteOffer(offer) => {
                if self.params.role != Role::Host || self.current_state() != NegotiationState::New {
                    warn!(
                        "Ignoring offer from {} in state {}",
                        self.remote_label(),
                        self.current_state()
                    );
                    return Ok(());
                }
                self.answer_offer(transport, &offer).await
            }
            NegotiatorInput::RemoteAnswer(answer) => {
                if self.params.role != Role::Watcher || self.queue.is_remote_set() {
                    warn!("Ignoring unexpected answer from {}", self.remote_label());
                    return Ok(());
                }
                transport.set_remote_description(&answer).await?;
                self.flush_candidates(transport).await;
                self.set_state(NegotiationState::Negotiated);
                Ok(())
            }
            NegotiatorInput::RemoteCandidate(candidate) => {
                match self.queue.accept(candidate) {
                    CandidateDisposition::Buffered => {
                        trace!(
                            "Buffered candidate from {} ({} pending)",
                            self.remote_label(),
                            self.queue.pending_len()
                        );
                    }
                    CandidateDisposition::ApplyNow(candidate) => {
                        self.apply_candidate(transport, &candidate).await;
                    }
                }
                Ok(())
            }
        }
    }

    async fn answer_offer(
        &mut self,
        transport: &Arc<dyn PeerTransport>,
        offer: &SessionDescription,
    ) -> Result<()> {
        if offer.sdp_type != SdpType::Offer {
            return Err(AppError::Negotiation(format!(
                "expected an offer from {}",
                self.remote_label()
            )));
        }

        self.set_state(NegotiationState::HaveRemoteOffer);
        transport.set_remote_description(offer).await?;
        self.flush_candidates(transport).await;

        let answer = transport.create_answer().await?;
        transport.set_local_description(&answer).await?;
        self.set_state(NegotiationState::Negotiated);

        if self.strategy == CandidateStrategy::Trickle {
            self.send_description(&answer).await;
        }
        Ok(())
    }

    async fn flush_candidates(&mut self, transport: &Arc<dyn PeerTransport>) {
        let pending = self.queue.mark_remote_set();
        if !pending.is_empty() {
            debug!(
                "Applying {} buffered candidates from {}",
                pending.len(),
                self.remote_label()
            );
        }
        for candidate in pending {
            self.apply_candidate(transport, &candidate).await;
        }
    }

    async fn apply_candidate(&self, transport: &Arc<dyn PeerTransport>, candidate: &IceCandidate) {
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            warn_throttled!(
                self.ctx.throttler,
                &format!("candidate:{}", self.remote_label()),
                "Candidate from {} rejected: {}",
                self.remote_label(),
                e
            );
            self.ctx.events.publish(SessionEvent::CandidateRejected {
                peer_id: self.params.peer_id.clone(),
                error: e.to_string(),
            });
        }
    }

    async fn send_description(&mut self, description: &SessionDescription) {
        let target = self.params.peer_id.as_ref();
        let sent = match description.sdp_type {
            SdpType::Offer => self.ctx.signaling.send_offer(description, target).await,
            SdpType::Answer => self.ctx.signaling.send_answer(description, target).await,
        };
        if sent {
            self.description_sent = true;
        }
    }

    /// Handle a transport event; `Some` ends the negotiation
    async fn handle_transport_event(
        &mut self,
        transport: &Arc<dyn PeerTransport>,
        event: TransportEvent,
    ) -> Result<Option<ExitReason>> {
        match event {
            TransportEvent::LocalCandidate(Some(candidate)) => {
                if self.current_state() == NegotiationState::Negotiated {
                    self.set_state(NegotiationState::GatheringCandidates);
                }
                match self.strategy {
                    CandidateStrategy::Trickle => {
                        self.ctx
                            .signaling
                            .send_candidate(&candidate, self.params.peer_id.as_ref())
                            .await?;
                    }
                    CandidateStrategy::Batched => {
                        self.held_candidates += 1;
                    }
                }
            }
            TransportEvent::LocalCandidate(None) => match self.strategy {
                CandidateStrategy::Trickle => {
                    debug!("Candidate gathering complete for {}", self.remote_label());
                }
                CandidateStrategy::Batched => {
                    if !self.description_sent {
                        match transport.local_description().await {
                            Some(description) => {
                                debug!(
                                    "Gathering complete for {}, sending description with {} candidates",
                                    self.remote_label(),
                                    self.held_candidates
                                );
                                self.send_description(&description).await;
                            }
                            None => warn!(
                                "Gathering complete for {} without a local description",
                                self.remote_label()
                            ),
                        }
                    }
                }
            },
            TransportEvent::Track {
                stream_id,
                track_id,
                kind,
            } => {
                if self.stream_bound {
                    trace!("Extra {} track from {} ignored", kind, self.remote_label());
                } else {
                    let stream = RemoteStream {
                        stream_id,
                        track_id,
                        kind,
                        generation: self.params.generation,
                    };
                    info!("Remote stream from {} bound", self.remote_label());
                    self.ctx
                        .streams
                        .bind(self.params.peer_id.as_ref(), stream.clone());
                    self.stream_bound = true;
                    self.ctx.events.publish(SessionEvent::RemoteStreamBound {
                        peer_id: self.params.peer_id.clone(),
                        stream,
                    });
                }
            }
            TransportEvent::RemoteDataChannel { label } => {
                debug!("{} opened data channel {}", self.remote_label(), label);
            }
            TransportEvent::Message { label, data } => {
                self.ctx.events.publish(SessionEvent::RemoteMessage {
                    peer_id: self.params.peer_id.clone(),
                    label,
                    data,
                });
            }
            TransportEvent::StateChanged(state) => {
                info!("Transport to {} is {}", self.remote_label(), state);
                self.ctx.events.publish(SessionEvent::ConnectionStateChanged {
                    peer_id: self.params.peer_id.clone(),
                    state,
                });
                if state == ConnectionState::Connected {
                    self.set_state(NegotiationState::Connected);
                } else if state.is_terminal() {
                    return Ok(Some(ExitReason::TransportEnded(state)));
                }
            }
        }
        Ok(None)
    }

    /// Release everything the negotiation owns
    async fn teardown(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.shutdown().await;
        }

        let channel = self.data_channel.write().take();
        if let Some(channel) = channel {
            channel.close().await;
        }

        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }

        if self.stream_bound
            && self
                .ctx
                .streams
                .clear(self.params.peer_id.as_ref(), self.params.generation)
        {
            self.ctx.events.publish(SessionEvent::RemoteStreamCleared {
                peer_id: self.params.peer_id.clone(),
            });
        }

        self.queue.reset();
        self.ctx
            .throttler
            .clear(&format!("candidate:{}", self.remote_label()));
        self.set_state(NegotiationState::Closed);
        debug!("Negotiation with {} torn down", self.remote_label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::webrtc::testing::{Harness, TransportScript};

    fn params(role: Role, peer: Option<&str>, generation: Generation) -> NegotiatorParams {
        NegotiatorParams {
            role,
            peer_id: peer.map(PeerId::from),
            generation,
            open_data_channel: true,
            stats_interval: Some(Duration::from_millis(10)),
        }
    }

    async fn wait_for(handle: &NegotiationHandle, state: NegotiationState) {
        let mut rx = handle.state_watch();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .expect("negotiation dropped");
    }

    #[tokio::test]
    async fn test_host_answers_before_sending_candidates() {
        let harness = Harness::host(SessionConfig::default()).await;
        let handle = PeerNegotiator::spawn(params(Role::Host, Some("w1"), 1), harness.context());

        // Candidates before the offer are buffered
        handle.deliver(NegotiatorInput::RemoteCandidate(IceCandidate::new("r1")));
        handle.deliver(NegotiatorInput::RemoteCandidate(IceCandidate::new("r2")));
        handle.deliver(NegotiatorInput::RemoteOffer(SessionDescription::offer("remote-offer")));
        handle.deliver(NegotiatorInput::RemoteCandidate(IceCandidate::new("r3")));

        wait_for(&handle, NegotiationState::GatheringCandidates).await;
        harness.settle().await;

        let kinds = harness.signaling.sent_kinds();
        assert_eq!(kinds.first().map(String::as_str), Some("answer"));
        assert!(kinds[1..].iter().all(|k| k == "candidate"));

        let transport = harness.factory.last().unwrap();
        assert_eq!(transport.applied_candidates(), vec!["r1", "r2", "r3"]);

        handle.shutdown().await;
        assert_eq!(handle.state(), NegotiationState::Closed);
        assert_eq!(harness.factory.live(), 0);
    }

    #[tokio::test]
    async fn test_batched_sends_description_only_after_gathering() {
        let config = SessionConfig {
            candidate_strategy: CandidateStrategy::Batched,
            ..Default::default()
        };
        let harness = Harness::watcher(config).await;
        harness.factory.script(TransportScript {
            hold_gathering_complete: true,
            ..Default::default()
        });

        let handle = PeerNegotiator::spawn(params(Role::Watcher, None, 1), harness.context());
        wait_for(&handle, NegotiationState::HaveLocalOffer).await;
        harness.settle().await;

        // Candidates gathered, sentinel not yet seen
        assert!(harness.signaling.sent().is_empty());

        harness.factory.last().unwrap().finish_gathering();
        harness.settle().await;

        assert_eq!(harness.signaling.sent_kinds(), vec!["offer"]);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_first_track_binds_once() {
        let harness = Harness::host(SessionConfig::default()).await;
        let handle = PeerNegotiator::spawn(params(Role::Host, Some("w1"), 7), harness.context());
        handle.deliver(NegotiatorInput::RemoteOffer(SessionDescription::offer("o")));
        wait_for(&handle, NegotiationState::GatheringCandidates).await;

        let transport = harness.factory.last().unwrap();
        transport.emit_track("stream-a", "video");
        transport.emit_track("stream-b", "audio");
        harness.settle().await;

        let streams = harness.keyed_streams.borrow().clone();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[&PeerId::from("w1")].stream_id, "stream-a");

        handle.shutdown().await;
        assert!(harness.keyed_streams.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_offer_fails_negotiation() {
        let harness = Harness::host(SessionConfig::default()).await;
        harness.factory.script(TransportScript {
            reject_remote_description: true,
            ..Default::default()
        });
        let handle = PeerNegotiator::spawn(params(Role::Host, Some("w1"), 1), harness.context());
        handle.deliver(NegotiatorInput::RemoteOffer(SessionDescription::offer("garbage")));

        let exit = harness.next_exit().await;
        assert!(matches!(exit.reason, ExitReason::Failed(AppError::Negotiation(_))));
        assert_eq!(handle.state(), NegotiationState::Closed);
        assert_eq!(harness.factory.live(), 0);
        assert!(harness.signaling.sent().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_ends_negotiation() {
        let harness = Harness::host(SessionConfig::default()).await;
        let handle = PeerNegotiator::spawn(params(Role::Host, Some("w1"), 1), harness.context());
        handle.deliver(NegotiatorInput::RemoteOffer(SessionDescription::offer("o")));
        wait_for(&handle, NegotiationState::GatheringCandidates).await;

        harness.factory.last().unwrap().emit_state(ConnectionState::Connected);
        wait_for(&handle, NegotiationState::Connected).await;

        harness.factory.last().unwrap().emit_state(ConnectionState::Failed);
        let exit = harness.next_exit().await;
        assert_eq!(exit.reason, ExitReason::TransportEnded(ConnectionState::Failed));
        assert_eq!(harness.factory.live(), 0);
    }

    #[tokio::test]
    async fn test_creation_failure_keeps_its_error() {
        let harness = Harness::host(SessionConfig::default()).await;
        harness.factory.script(TransportScript {
            fail_create: true,
            ..Default::default()
        });
        let handle = PeerNegotiator::spawn(params(Role::Host, Some("w1"), 1), harness.context());

        let exit = harness.next_exit().await;
        let error = exit.reason.into_error().expect("failure expected");
        assert!(matches!(error, AppError::TransportUnavailable(_)));
        assert_eq!(error.scope(), crate::error::ErrorScope::Peer);
        assert_eq!(handle.state(), NegotiationState::Closed);
    }

    #[tokio::test]
    async fn test_rejected_candidate_does_not_abort() {
        let harness = Harness::host(SessionConfig::default()).await;
        harness.factory.script(TransportScript {
            reject_candidates: true,
            ..Default::default()
        });
        let mut events = harness.events.subscribe();

        let handle = PeerNegotiator::spawn(params(Role::Host, Some("w1"), 1), harness.context());
        handle.deliver(NegotiatorInput::RemoteOffer(SessionDescription::offer("o")));
        handle.deliver(NegotiatorInput::RemoteCandidate(IceCandidate::new("bad")));
        wait_for(&handle, NegotiationState::GatheringCandidates).await;
        harness.settle().await;

        let mut rejected = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::CandidateRejected { .. }) {
                rejected = true;
            }
        }
        assert!(rejected);
        assert_ne!(handle.state(), NegotiationState::Closed);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_during_creation_leaks_nothing() {
        let harness = Harness::host(SessionConfig::default()).await;
        harness.factory.script(TransportScript {
            create_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });

        let handle = PeerNegotiator::spawn(params(Role::Host, Some("w1"), 1), harness.context());
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown().await;
        handle.shutdown().await;

        assert_eq!(handle.state(), NegotiationState::Closed);
        assert_eq!(harness.factory.live(), 0);
        assert!(!handle.deliver(NegotiatorInput::RemoteOffer(SessionDescription::offer("late"))));
    }

    #[tokio::test]
    async fn test_inbound_messages_are_published() {
        let harness = Harness::host(SessionConfig::default()).await;
        let mut events = harness.events.subscribe();
        let handle = PeerNegotiator::spawn(params(Role::Host, Some("w1"), 1), harness.context());
        handle.deliver(NegotiatorInput::RemoteOffer(SessionDescription::offer("o")));
        wait_for(&handle, NegotiationState::GatheringCandidates).await;

        harness
            .factory
            .last()
            .unwrap()
            .emit_message("hello");

        let message = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(SessionEvent::RemoteMessage { peer_id, data, .. }) = events.recv().await {
                    return (peer_id, data);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(message.0, Some(PeerId::from("w1")));
        assert_eq!(&message.1[..], b"hello");
        handle.shutdown().await;
    }
}
