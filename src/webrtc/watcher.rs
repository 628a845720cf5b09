//! Watcher role: a single negotiation with the host
//!
//! The watcher creates the offer itself as soon as signaling is open and
//! applies the host's answer and candidates as they arrive. Whatever ends
//! that one negotiation (the relay closing, a rejected answer, the
//! transport failing) ends the session.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::media::LocalMediaStream;
use super::negotiator::{
    NegotiationExit, NegotiationHandle, NegotiationState, NegotiatorInput,
    NegotiatorParams, PeerNegotiator, RemoteStream, SharedContext, StreamSlot,
};
use super::session::{acquire_media, resolve_ice_servers, Collaborators, PeerSession};
use super::signaling::{SignalingEvent, SignalingSession};
use crate::config::{CredentialCell, Credentials, Role, SessionConfig};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::utils::LogThrottler;

struct RunningWatcher {
    signaling: Arc<SignalingSession>,
    media: Option<Arc<LocalMediaStream>>,
    negotiation: Arc<NegotiationHandle>,
    cancel: CancellationToken,
    dispatch: JoinHandle<()>,
}

/// Watcher session
pub struct WatcherSession {
    collaborators: Collaborators,
    credentials: CredentialCell,
    events: Arc<EventBus>,
    throttler: Arc<LogThrottler>,
    stream: Arc<watch::Sender<Option<RemoteStream>>>,
    state: Mutex<Option<watch::Receiver<NegotiationState>>>,
    starting: Mutex<Option<CancellationToken>>,
    running: Arc<Mutex<Option<RunningWatcher>>>,
    epoch: Arc<AtomicU64>,
}

impl WatcherSession {
    pub fn new(collaborators: Collaborators) -> Self {
        let (stream, _) = watch::channel(None);
        Self {
            collaborators,
            credentials: CredentialCell::default(),
            events: Arc::new(EventBus::new()),
            throttler: Arc::new(LogThrottler::default()),
            stream: Arc::new(stream),
            state: Mutex::new(None),
            starting: Mutex::new(None),
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

    pub fn set_credentials(&self, credentials: Credentials) {
        self.credentials.set(credentials);
    }

    /// State of the negotiation, `New` before the first start
    pub fn state(&self) -> NegotiationState {
        self.state
            .lock()
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(NegotiationState::New)
    }

    /// Observable remote stream of the host
    pub fn remote_stream(&self) -> watch::Receiver<Option<RemoteStream>> {
        self.stream.subscribe()
    }

    /// Connect to the host
    ///
    /// Returns once the local offer is set (`HAVE_LOCAL_OFFER`) or fails with
    /// the error that ended the negotiation. The answer is applied later, as
    /// it arrives.
    pub async fn start(&self, config: SessionConfig) -> Result<()> {
        if self.is_running() {
            return Err(AppError::Config("watcher session already running".to_string()));
        }
        config.validate()?;
        if let Some(ref credentials) = config.credentials {
            self.credentials.set(credentials.clone());
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let abort = CancellationToken::new();
        *self.starting.lock() = Some(abort.clone());
        info!("Starting watcher on channel {}", config.channel_name);

        let signaling = Arc::new(
            SignalingSession::connect(
                &config,
                Role::Watcher,
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
                release(&signaling, media.as_ref()).await;
                return Err(e);
            }
        };

        let (exits_tx, mut exits) = mpsc::unbounded_channel();
        let ctx = SharedContext {
            ice_servers: Arc::new(ice_servers),
            signaling: signaling.clone(),
            factory: self.collaborators.transports.clone(),
            media: media.clone(),
            events: self.events.clone(),
            throttler: self.throttler.clone(),
            streams: StreamSlot::Single(self.stream.clone()),
            exits: Some(exits_tx),
        };
        let negotiation = Arc::new(PeerNegotiator::spawn(
            NegotiatorParams {
                role: Role::Watcher,
                peer_id: None,
                generation: epoch,
                open_data_channel: config.open_data_channel,
                stats_interval: config.stats_interval(),
            },
            ctx,
        ));
        *self.state.lock() = Some(negotiation.state_watch());

        let offered = tokio::select! {
            _ = abort.cancelled() => Err(AppError::Stopped),
            result = wait_for_offer(&negotiation, &mut exits) => result,
        };
        if let Err(e) = offered {
            negotiation.shutdown().await;
            release(&signaling, media.as_ref()).await;
            return Err(e);
        }

        let installed = {
            let mut running = self.running.lock();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                false
            } else {
                let cancel = CancellationToken::new();
                let dispatch = tokio::spawn(
                    WatcherDispatch {
                        negotiation: negotiation.clone(),
                        signaling: signaling.clone(),
                        media: media.clone(),
                        events: self.events.clone(),
                        running: self.running.clone(),
                        epoch: self.epoch.clone(),
                        started_epoch: epoch,
                    }
                    .run(signals, exits, cancel.clone()),
                );
                *running = Some(RunningWatcher {
                    signaling: signaling.clone(),
                    media: media.clone(),
                    negotiation: negotiation.clone(),
                    cancel,
                    dispatch,
                });
                true
            }
        };

        if !installed {
            negotiation.shutdown().await;
            release(&signaling, media.as_ref()).await;
            return Err(AppError::Stopped);
        }

        info!("Watcher offer ready as {}", signaling.client_id().unwrap_or("?"));
        Ok(())
    }

    /// Stop the session
    ///
    /// Tears down the negotiation, stops local media and closes signaling.
    /// Idempotent, and aborts a `start` still in progress.
    pub async fn stop(&self) {
        let running = {
            let mut running = self.running.lock();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            if let Some(abort) = self.starting.lock().take() {
                abort.cancel();
            }
            running.take()
        };
        let Some(running) = running else {
            return;
        };

        info!("Stopping watcher");
        running.cancel.cancel();
        if let Err(e) = running.dispatch.await {
            warn!("Watcher dispatch loop ended abnormally: {}", e);
        }

        running.negotiation.shutdown().await;
        if let Some(ref media) = running.media {
            media.stop();
        }
        running.signaling.close().await;

        self.stream.send_replace(None);
        self.throttler.clear_all();
        info!("Watcher stopped");
    }

    /// Send on the data channel
    ///
    /// Does nothing if no data channel was opened.
    pub async fn send_message(&self, data: Bytes) -> Result<()> {
        let negotiation = self
            .running
            .lock()
            .as_ref()
            .map(|r| r.negotiation.clone());
        match negotiation {
            Some(negotiation) if negotiation.has_data_channel() => negotiation.send_data(data).await,
            _ => {
                debug!("No data channel, message dropped");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl PeerSession for WatcherSession {
    fn role(&self) -> Role {
        Role::Watcher
    }

    async fn start(&self, config: SessionConfig) -> Result<()> {
        WatcherSession::start(self, config).await
    }

    async fn stop(&self) {
        WatcherSession::stop(self).await
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn send(&self, data: Bytes) -> usize {
        match self.send_message(data).await {
            Ok(()) => 1,
            Err(e) => {
                warn!("Send to host failed: {}", e);
                0
            }
        }
    }
}

/// Wait until the local offer is set or the negotiation has ended
async fn wait_for_offer(
    negotiation: &NegotiationHandle,
    exits: &mut mpsc::UnboundedReceiver<NegotiationExit>,
) -> Result<()> {
    let mut state = negotiation.state_watch();
    let reached = state
        .wait_for(|s| *s != NegotiationState::New)
        .await
        .map(|s| *s)
        .unwrap_or(NegotiationState::Closed);
    if reached != NegotiationState::Closed {
        return Ok(());
    }

    let error = exits
        .recv()
        .await
        .and_then(|exit| exit.reason.into_error())
        .unwrap_or_else(|| AppError::Negotiation("negotiation shut down".to_string()));
    Err(error)
}

async fn release(signaling: &SignalingSession, media: Option<&Arc<LocalMediaStream>>) {
    if let Some(media) = media {
        media.stop();
    }
    signaling.close().await;
}

struct WatcherDispatch {
    negotiation: Arc<NegotiationHandle>,
    signaling: Arc<SignalingSession>,
    media: Option<Arc<LocalMediaStream>>,
    events: Arc<EventBus>,
    running: Arc<Mutex<Option<RunningWatcher>>>,
    epoch: Arc<AtomicU64>,
    started_epoch: u64,
}

impl WatcherDispatch {
    async fn run(
        self,
        mut signals: mpsc::UnboundedReceiver<SignalingEvent>,
        mut exits: mpsc::UnboundedReceiver<NegotiationExit>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                Some(exit) = exits.recv() => {
                    self.on_exit(exit);
                    break;
                }
                event = signals.recv() => match event {
                    Some(SignalingEvent::Opened) => {
                        self.events.publish(SessionEvent::SignalingOpened);
                    }
                    Some(SignalingEvent::AnswerReceived { answer, .. }) => {
                        self.negotiation.deliver(NegotiatorInput::RemoteAnswer(answer));
                    }
                    Some(SignalingEvent::CandidateReceived { candidate, .. }) => {
                        self.negotiation.deliver(NegotiatorInput::RemoteCandidate(candidate));
                    }
                    Some(SignalingEvent::OfferReceived { .. }) => {
                        warn!("Watcher ignores offers");
                    }
                    Some(SignalingEvent::Failed(reason)) => {
                        warn!("Signaling failed: {}", reason);
                        self.events.publish(SessionEvent::SignalingFailed { reason });
                        break;
                    }
                    Some(SignalingEvent::Closed) | None => {
                        info!("Signaling closed by relay");
                        self.events.publish(SessionEvent::SignalingClosed);
                        break;
                    }
                },
            }
        }

        // The session ended on its own
        self.negotiation.shutdown().await;
        self.signaling.close().await;
        let released = {
            let mut running = self.running.lock();
            if let Some(ref media) = self.media {
                media.stop();
            }
            if self.epoch.load(Ordering::SeqCst) == self.started_epoch {
                running.take()
            } else {
                None
            }
        };
        if released.is_some() {
            info!("Watcher session ended");
        }
        debug!("Watcher dispatch loop exited");
    }

    fn on_exit(&self, exit: NegotiationExit) {
        let Some(error) = exit.reason.into_error() else {
            return;
        };
        warn!("Connection to host ended: {}", error);
        self.events.publish(SessionEvent::PeerFailed {
            peer_id: None,
            error: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::signaling::{ConnectionState, IceCandidate, SessionDescription};
    use crate::webrtc::testing::{FakeWorld, TransportScript};
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig {
            open_data_channel: true,
            ..Default::default()
        }
    }

    fn answer() -> SignalingEvent {
        SignalingEvent::AnswerReceived {
            answer: SessionDescription::answer("host-answer"),
            peer_id: None,
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_offer_then_answer() {
        let world = FakeWorld::new();
        let watcher = WatcherSession::new(world.collaborators());
        watcher.start(config()).await.unwrap();

        assert_eq!(watcher.state(), NegotiationState::HaveLocalOffer);
        wait_until(|| !world.signaling.sent().is_empty()).await;
        let sent = world.signaling.sent();
        assert_eq!(sent[0].signal.kind(), "offer");
        assert_eq!(sent[0].recipient, None);

        // Candidate ahead of the answer waits for it
        world.signaling.inject(SignalingEvent::CandidateReceived {
            candidate: IceCandidate::new("host-c1"),
            peer_id: None,
        });
        world.signaling.inject(answer());
        wait_until(|| watcher.state() == NegotiationState::Negotiated).await;

        let transport = world.factory.last().unwrap();
        wait_until(|| transport.applied_candidates() == vec!["host-c1"]).await;

        transport.emit_track("host-stream", "video");
        wait_until(|| watcher.remote_stream().borrow().is_some()).await;

        watcher.stop().await;
        assert_eq!(watcher.state(), NegotiationState::Closed);
        assert!(watcher.remote_stream().borrow().is_none());
        assert_eq!(world.factory.live(), 0);
        assert!(world.capture.last().unwrap().is_stopped());
        assert_eq!(world.signaling.close_count(), 1);
    }

    #[tokio::test]
    async fn test_relay_close_before_answer() {
        let world = FakeWorld::new();
        let watcher = WatcherSession::new(world.collaborators());
        let mut events = watcher.events().subscribe();
        watcher.start(config()).await.unwrap();

        world.signaling.remote_close();
        wait_until(|| watcher.state() == NegotiationState::Closed).await;
        wait_until(|| world.factory.live() == 0).await;
        wait_until(|| !watcher.is_running()).await;
        assert!(world.capture.last().unwrap().is_stopped());

        let mut closed = false;
        while let Ok(event) = events.try_recv() {
            closed |= matches!(event, SessionEvent::SignalingClosed);
        }
        assert!(closed);

        // A new session can be started right away
        watcher.start(config()).await.unwrap();
        assert_eq!(watcher.state(), NegotiationState::HaveLocalOffer);
        assert_eq!(world.factory.live(), 1);
        watcher.stop().await;
        assert_eq!(world.factory.live(), 0);
    }

    #[tokio::test]
    async fn test_stop_after_connected() {
        let world = FakeWorld::new();
        let watcher = WatcherSession::new(world.collaborators());
        watcher
            .start(SessionConfig {
                stats_interval_ms: 10,
                ..config()
            })
            .await
            .unwrap();

        world.signaling.inject(answer());
        wait_until(|| watcher.state() == NegotiationState::Negotiated).await;
        world
            .factory
            .last()
            .unwrap()
            .emit_state(ConnectionState::Connected);
        wait_until(|| watcher.state() == NegotiationState::Connected).await;
        wait_until(|| world.factory.stats_calls() > 0).await;

        watcher.stop().await;
        watcher.stop().await;

        assert!(!watcher.is_running());
        assert_eq!(watcher.state(), NegotiationState::Closed);
        assert_eq!(world.factory.live(), 0);
        assert!(world.capture.last().unwrap().is_stopped());
        assert_eq!(world.signaling.close_count(), 1);
        let polled = world.factory.stats_calls();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(world.factory.stats_calls(), polled);
    }

    #[tokio::test]
    async fn test_rejected_answer_aborts_session() {
        let world = FakeWorld::new();
        world.factory.script(TransportScript {
            reject_remote_description: true,
            ..Default::default()
        });
        let watcher = WatcherSession::new(world.collaborators());
        let mut events = watcher.events().subscribe();
        watcher.start(config()).await.unwrap();

        world.signaling.inject(answer());
        wait_until(|| watcher.state() == NegotiationState::Closed).await;
        wait_until(|| world.signaling.close_count() == 1).await;

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            failed |= matches!(event, SessionEvent::PeerFailed { peer_id: None, .. });
        }
        assert!(failed);
        assert_eq!(world.factory.live(), 0);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_start_fails_without_transport() {
        let world = FakeWorld::new();
        world.factory.script(TransportScript {
            fail_create: true,
            ..Default::default()
        });
        let watcher = WatcherSession::new(world.collaborators());

        let result = watcher.start(config()).await;
        assert!(matches!(result, Err(AppError::TransportUnavailable(_))));
        assert!(!watcher.is_running());
        assert_eq!(world.signaling.close_count(), 1);
        assert!(world.capture.last().unwrap().is_stopped());
    }

    #[tokio::test]
    async fn test_stop_during_start() {
        let world = FakeWorld::new();
        world.factory.script(TransportScript {
            create_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let watcher = Arc::new(WatcherSession::new(world.collaborators()));

        let starter = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.start(config()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        watcher.stop().await;

        assert!(matches!(starter.await.unwrap(), Err(AppError::Stopped)));
        assert_eq!(world.factory.live(), 0);
        assert_eq!(watcher.state(), NegotiationState::Closed);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_send_message() {
        let world = FakeWorld::new();
        let watcher = WatcherSession::new(world.collaborators());
        watcher.start(config()).await.unwrap();

        watcher.send_message(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(world.factory.last().unwrap().data_sent(), vec![b"ping".to_vec()]);
        watcher.stop().await;

        // Without a data channel it is a no-op
        let world = FakeWorld::new();
        let watcher = WatcherSession::new(world.collaborators());
        watcher.start(SessionConfig::default()).await.unwrap();
        watcher.send_message(Bytes::from_static(b"ping")).await.unwrap();
        assert!(world.factory.last().unwrap().data_sent().is_empty());
        watcher.stop().await;
    }

    #[tokio::test]
    async fn test_batched_offer_waits_for_gathering() {
        let world = FakeWorld::new();
        world.factory.script(TransportScript {
            hold_gathering_complete: true,
            ..Default::default()
        });
        let watcher = WatcherSession::new(world.collaborators());
        watcher
            .start(SessionConfig {
                candidate_strategy: crate::config::CandidateStrategy::Batched,
                ..Default::default()
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(world.signaling.sent().is_empty());

        world.factory.last().unwrap().finish_gathering();
        wait_until(|| world.signaling.sent_kinds() == vec!["offer"]).await;
        watcher.stop().await;
    }
}
