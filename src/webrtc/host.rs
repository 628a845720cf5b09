//! Host role: one negotiation per watcher
//!
//! The host waits for offers. Each offer from a new peer id gets its own
//! negotiation; a second offer from a known peer id replaces the old
//! negotiation. Local media is acquired once and shared by all of them.
//!
//! ```text
//! signaling events ─→ dispatch loop ─┬─→ negotiation (w1) ─→ transport
//!                          ↑         ├─→ negotiation (w2) ─→ transport
//!                          │         └─→ ...
//!                          └──────── exits (peer id, generation)
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::media::LocalMediaStream;
use super::negotiator::{
    ExitReason, NegotiationExit, NegotiationHandle, NegotiationState, NegotiatorInput,
    NegotiatorParams, PeerNegotiator, RemoteStream, SharedContext, StreamSlot,
};
use super::peer_table::PeerTable;
use super::session::{acquire_media, resolve_ice_servers, Collaborators, PeerSession};
use super::signaling::{
    IceCandidate, PeerId, SessionDescription, SignalingEvent, SignalingSession,
};
use crate::config::{CredentialCell, Credentials, Role, SessionConfig};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::utils::LogThrottler;
use crate::{debug_throttled, warn_throttled};

/// Candidates held per unknown peer until its offer arrives
const MAX_EARLY_CANDIDATES: usize = 64;

/// Distinct unknown peers whose candidates are held
const MAX_EARLY_PEERS: usize = 256;

/// Ended peers remembered so their late candidates are dropped
const MAX_DEPARTED_PEERS: usize = 256;

type Peers = Arc<Mutex<PeerTable<Arc<NegotiationHandle>>>>;
type Retired = Arc<Mutex<Vec<Arc<NegotiationHandle>>>>;
type Running = Arc<Mutex<Option<RunningHost>>>;

struct RunningHost {
    signaling: Arc<SignalingSession>,
    media: Option<Arc<LocalMediaStream>>,
    cancel: CancellationToken,
    dispatch: JoinHandle<()>,
}

/// Host session orchestrator
pub struct HostOrchestrator {
    collaborators: Collaborators,
    credentials: CredentialCell,
    events: Arc<EventBus>,
    throttler: Arc<LogThrottler>,
    streams: Arc<watch::Sender<HashMap<PeerId, RemoteStream>>>,
    peers: Peers,
    retired: Retired,
    running: Running,
    epoch: Arc<AtomicU64>,
}

impl HostOrchestrator {
    pub fn new(collaborators: Collaborators) -> Self {
        let (streams, _) = watch::channel(HashMap::new());
        Self {
            collaborators,
            credentials: CredentialCell::default(),
            events: Arc::new(EventBus::new()),
            throttler: Arc::new(LogThrottler::default()),
            streams: Arc::new(streams),
            peers: Arc::new(Mutex::new(PeerTable::new())),
            retired: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(Mutex::new(None)),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Inject refreshed credentials into the running session
    pub fn set_credentials(&self, credentials: Credentials) {
        self.credentials.set(credentials);
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.lock().peer_ids()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn peer_state(&self, peer_id: &PeerId) -> Option<NegotiationState> {
        self.peers.lock().get(peer_id).map(|h| h.state())
    }

    /// Observable peer id to remote stream map
    pub fn remote_streams(&self) -> watch::Receiver<HashMap<PeerId, RemoteStream>> {
        self.streams.subscribe()
    }

    /// Resolve the channel, open signaling and start accepting offers
    ///
    /// If [`stop`](Self::stop) runs meanwhile, everything acquired so far is
    /// released and `Stopped` is returned.
    pub async fn start(&self, config: SessionConfig) -> Result<()> {
        if self.is_running() {
            return Err(AppError::Config("host session already running".to_string()));
        }
        config.validate()?;
        if let Some(ref credentials) = config.credentials {
            self.credentials.set(credentials.clone());
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Starting host on channel {}", config.channel_name);

        let signaling = Arc::new(
            SignalingSession::connect(
                &config,
                Role::Host,
                self.collaborators.resolver.as_ref(),
                self.collaborators.signaling.as_ref(),
                &self.credentials,
            )
            .await?,
        );
        if self.epoch.load(Ordering::SeqCst) != epoch {
            signaling.close().await;
            return Err(AppError::Stopped);
        }

        let ice_servers = match resolve_ice_servers(
            &config,
            &signaling,
            self.collaborators.ice_directory.as_ref(),
            &self.credentials,
        )
        .await
        {
            Ok(set) => set,
            Err(e) => {
                signaling.close().await;
                return Err(e);
            }
        };

        let media = acquire_media(&config, self.collaborators.capture.as_ref(), &self.events).await;

        let signals = match signaling.open().await {
            Ok(rx) => rx,
            Err(e) => {
                signaling.close().await;
                if let Some(ref media) = media {
                    media.stop();
                }
                return Err(e);
            }
        };

        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let ctx = SharedContext {
            ice_servers: Arc::new(ice_servers),
            signaling: signaling.clone(),
            factory: self.collaborators.transports.clone(),
            media: media.clone(),
            events: self.events.clone(),
            throttler: self.throttler.clone(),
            streams: StreamSlot::Keyed(self.streams.clone()),
            exits: Some(exits_tx),
        };
        let dispatcher = Dispatcher {
            ctx,
            open_data_channel: config.open_data_channel,
            stats_interval: config.stats_interval(),
            peers: self.peers.clone(),
            retired: self.retired.clone(),
            early_candidates: HashMap::new(),
            departed: VecDeque::new(),
            streams: self.streams.clone(),
            running: self.running.clone(),
            epoch: self.epoch.clone(),
            started_epoch: epoch,
        };

        let stopped = {
            let mut running = self.running.lock();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                true
            } else {
                let cancel = CancellationToken::new();
                let dispatch = tokio::spawn(dispatcher.run(signals, exits_rx, cancel.clone()));
                *running = Some(RunningHost {
                    signaling: signaling.clone(),
                    media: media.clone(),
                    cancel,
                    dispatch,
                });
                false
            }
        };

        if stopped {
            signaling.close().await;
            if let Some(ref media) = media {
                media.stop();
            }
            return Err(AppError::Stopped);
        }

        info!("Host ready, waiting for offers");
        Ok(())
    }

    /// Stop the session
    ///
    /// Closes signaling, tears down every negotiation, then stops local
    /// media. Safe to call at any time, including while `start` is still
    /// running.
    pub async fn stop(&self) {
        let running = {
            let mut running = self.running.lock();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            running.take()
        };
        let Some(running) = running else {
            return;
        };

        info!("Stopping host");
        running.signaling.close().await;

        running.cancel.cancel();
        if let Err(e) = running.dispatch.await {
            warn!("Host dispatch loop ended abnormally: {}", e);
        }

        let closed = shutdown_all(&self.peers, &self.retired).await;
        debug!("Closed {} negotiations", closed);

        if let Some(media) = running.media {
            media.stop();
        }

        self.streams.send_replace(HashMap::new());
        self.throttler.clear_all();
        info!("Host stopped");
    }

    /// Send a message to every peer with a data channel
    ///
    /// Best effort, at most once per peer: a failing peer is logged and
    /// skipped. Returns how many peers accepted the message.
    pub async fn send_to_all(&self, data: Bytes) -> usize {
        let handles: Vec<Arc<NegotiationHandle>> = self
            .peers
            .lock()
            .iter()
            .filter(|(_, h)| h.has_data_channel())
            .map(|(_, h)| h.clone())
            .collect();

        let sends = handles.iter().map(|handle| {
            let data = data.clone();
            async move { (handle.peer_id().cloned(), handle.send_data(data).await) }
        });

        let mut delivered = 0;
        for (peer_id, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    let peer = peer_id.map(|p| p.to_string()).unwrap_or_default();
                    warn_throttled!(
                        self.throttler,
                        &format!("send:{}", peer),
                        "Send to {} failed: {}",
                        peer,
                        e
                    );
                }
            }
        }
        delivered
    }
}

#[async_trait]
impl PeerSession for HostOrchestrator {
    fn role(&self) -> Role {
        Role::Host
    }

    async fn start(&self, config: SessionConfig) -> Result<()> {
        HostOrchestrator::start(self, config).await
    }

    async fn stop(&self) {
        HostOrchestrator::stop(self).await
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn send(&self, data: Bytes) -> usize {
        self.send_to_all(data).await
    }
}

/// Shut down every live and retired negotiation concurrently
async fn shutdown_all(peers: &Peers, retired: &Retired) -> usize {
    let mut handles: Vec<Arc<NegotiationHandle>> =
        peers.lock().drain().into_iter().map(|(_, h)| h).collect();
    handles.extend(retired.lock().drain(..));

    let count = handles.len();
    join_all(handles.iter().map(|h| h.shutdown())).await;
    count
}

/// Serialized handling of signaling events and negotiation exits
struct Dispatcher {
    ctx: SharedContext,
    open_data_channel: bool,
    stats_interval: Option<std::time::Duration>,
    peers: Peers,
    retired: Retired,
    early_candidates: HashMap<PeerId, Vec<IceCandidate>>,
    departed: VecDeque<PeerId>,
    streams: Arc<watch::Sender<HashMap<PeerId, RemoteStream>>>,
    running: Running,
    epoch: Arc<AtomicU64>,
    started_epoch: u64,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut signals: mpsc::UnboundedReceiver<SignalingEvent>,
        mut exits: mpsc::UnboundedReceiver<NegotiationExit>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(exit) = exits.recv() => self.on_exit(exit),
                event = signals.recv() => match event {
                    Some(event) => {
                        if !self.on_signal(event) {
                            break;
                        }
                    }
                    None => {
                        self.ctx.events.publish(SessionEvent::SignalingClosed);
                        break;
                    }
                },
            }
        }

        if !cancel.is_cancelled() {
            // The relay went away on its own
            let closed = shutdown_all(&self.peers, &self.retired).await;
            info!("Signaling ended, closed {} negotiations", closed);
            self.release().await;
        }
        debug!("Host dispatch loop exited");
    }

    /// Uninstall the session this loop belongs to so it can be started again
    async fn release(&self) {
        self.ctx.signaling.close().await;

        let mut running = self.running.lock();
        if self.epoch.load(Ordering::SeqCst) != self.started_epoch {
            return;
        }
        if let Some(released) = running.take() {
            if let Some(ref media) = released.media {
                media.stop();
            }
            self.streams.send_replace(HashMap::new());
            self.ctx.throttler.clear_all();
            info!("Host session ended");
        }
    }

    /// Handle one signaling event; `false` ends the loop
    fn on_signal(&mut self, event: SignalingEvent) -> bool {
        match event {
            SignalingEvent::Opened => {
                self.ctx.events.publish(SessionEvent::SignalingOpened);
            }
            SignalingEvent::OfferReceived { offer, peer_id } => match peer_id {
                Some(peer_id) => self.on_offer(peer_id, offer),
                None => warn!("Offer without sender id ignored"),
            },
            SignalingEvent::AnswerReceived { peer_id, .. } => {
                warn!("Host ignores answer from {:?}", peer_id);
            }
            SignalingEvent::CandidateReceived { candidate, peer_id } => match peer_id {
                Some(peer_id) => self.on_candidate(peer_id, candidate),
                None => warn!("Candidate without sender id ignored"),
            },
            SignalingEvent::Closed => {
                info!("Signaling closed by relay");
                self.ctx.events.publish(SessionEvent::SignalingClosed);
                return false;
            }
            SignalingEvent::Failed(reason) => {
                warn!("Signaling failed: {}", reason);
                self.ctx
                    .events
                    .publish(SessionEvent::SignalingFailed { reason });
                return false;
            }
        }
        true
    }

    fn on_offer(&mut self, peer_id: PeerId, offer: SessionDescription) {
        let generation = self.peers.lock().next_generation();
        let handle = Arc::new(PeerNegotiator::spawn(
            NegotiatorParams {
                role: Role::Host,
                peer_id: Some(peer_id.clone()),
                generation,
                open_data_channel: self.open_data_channel,
                stats_interval: self.stats_interval,
            },
            self.ctx.clone(),
        ));

        handle.deliver(NegotiatorInput::RemoteOffer(offer));
        self.departed.retain(|p| p != &peer_id);
        for candidate in self.early_candidates.remove(&peer_id).unwrap_or_default() {
            handle.deliver(NegotiatorInput::RemoteCandidate(candidate));
        }

        let stale = self.peers.lock().insert(peer_id.clone(), generation, handle);
        match stale {
            Some(stale) => {
                info!("Offer from {} replaces its previous negotiation", peer_id);
                self.retired.lock().push(stale.clone());
                tokio::spawn(async move { stale.shutdown().await });
            }
            None => info!("Offer from {}, negotiating", peer_id),
        }
    }

    fn on_candidate(&mut self, peer_id: PeerId, candidate: IceCandidate) {
        let handle = self.peers.lock().get(&peer_id).cloned();
        match handle {
            Some(handle) => {
                if !handle.deliver(NegotiatorInput::RemoteCandidate(candidate)) {
                    debug!("Candidate for finished negotiation {} dropped", peer_id);
                }
            }
            None if self.departed.contains(&peer_id) => {
                trace!("Late candidate from departed peer {} dropped", peer_id);
            }
            None => {
                if !self.early_candidates.contains_key(&peer_id)
                    && self.early_candidates.len() >= MAX_EARLY_PEERS
                {
                    warn_throttled!(
                        self.ctx.throttler,
                        "early-peers",
                        "Holding candidates for {} unknown peers, dropping those from {}",
                        MAX_EARLY_PEERS,
                        peer_id
                    );
                    return;
                }
                let early = self.early_candidates.entry(peer_id.clone()).or_default();
                if early.len() < MAX_EARLY_CANDIDATES {
                    early.push(candidate);
                    debug_throttled!(
                        self.ctx.throttler,
                        &format!("held:{}", peer_id),
                        "Holding candidates from {} until its offer",
                        peer_id
                    );
                } else {
                    warn_throttled!(
                        self.ctx.throttler,
                        &format!("early:{}", peer_id),
                        "Too many candidates from {} before its offer, dropping",
                        peer_id
                    );
                }
            }
        }
    }

    fn on_exit(&mut self, exit: NegotiationExit) {
        let Some(peer_id) = exit.peer_id else {
            return;
        };

        let removed = self.peers.lock().remove(&peer_id, exit.generation);
        if removed.is_none() {
            // Replaced earlier, already out of the table
            self.retired
                .lock()
                .retain(|h| h.generation() != exit.generation);
            return;
        }

        self.early_candidates.remove(&peer_id);
        if self.departed.len() >= MAX_DEPARTED_PEERS {
            self.departed.pop_front();
        }
        self.departed.push_back(peer_id.clone());

        self.ctx.throttler.clear_prefix(&format!("send:{}", peer_id));
        match exit.reason {
            ExitReason::Shutdown => debug!("Negotiation with {} shut down", peer_id),
            ExitReason::TransportEnded(state) => {
                info!("Peer {} left (transport {})", peer_id, state);
                self.ctx.events.publish(SessionEvent::PeerFailed {
                    peer_id: Some(peer_id),
                    error: format!("transport {}", state),
                });
            }
            ExitReason::Failed(error) => {
                warn!("Peer {} dropped: {}", peer_id, error);
                self.ctx.events.publish(SessionEvent::PeerFailed {
                    peer_id: Some(peer_id),
                    error: error.to_string(),
                });
            }
        }
    }
}
