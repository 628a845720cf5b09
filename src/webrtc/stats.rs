//! Periodic statistics polling

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::peer::{PeerTransport, TransportStats};
use super::signaling::PeerId;
use crate::events::{EventBus, SessionEvent};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Timestamped statistics of one connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub peer_id: Option<PeerId>,
    pub timestamp: DateTime<Utc>,
    pub stats: TransportStats,
}

/// Polls one transport on a fixed period until cancelled
///
/// Cancelled explicitly by the owning negotiation, or on drop.
pub struct StatsPoller {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StatsPoller {
    pub fn spawn(
        peer_id: Option<PeerId>,
        transport: Arc<dyn PeerTransport>,
        period: Duration,
        events: Arc<EventBus>,
        throttler: Arc<LogThrottler>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let throttle_key = format!(
                "stats:{}",
                peer_id.as_ref().map(|p| p.as_str()).unwrap_or("host")
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let result = tokio::select! {
                    _ = token.cancelled() => break,
                    result = transport.stats() => result,
                };

                match result {
                    Ok(stats) => {
                        trace!("Stats for {:?}: {:?}", peer_id, stats);
                        events.publish(SessionEvent::Stats(StatsReport {
                            peer_id: peer_id.clone(),
                            timestamp: Utc::now(),
                            stats,
                        }));
                    }
                    Err(e) => {
                        warn_throttled!(
                            throttler,
                            &throttle_key,
                            "Stats poll for {:?} failed: {}",
                            peer_id,
                            e
                        );
                    }
                }
            }
        });

        Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop polling. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel and wait for the polling task to exit
    pub async fn shutdown(&self) {
        self.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for StatsPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::testing::FakeTransportFactory;

    #[tokio::test]
    async fn test_publishes_until_cancelled() {
        let factory = FakeTransportFactory::new();
        let transport = factory.transport_for_test();
        let events = Arc::new(EventBus::new());
        let mut rx = events.subscribe();

        let poller = StatsPoller::spawn(
            Some(PeerId::from("w1")),
            transport.clone(),
            Duration::from_millis(10),
            events.clone(),
            Arc::new(LogThrottler::default()),
        );

        match rx.recv().await.unwrap() {
            SessionEvent::Stats(report) => assert_eq!(report.peer_id, Some(PeerId::from("w1"))),
            other => panic!("unexpected event {:?}", other),
        }

        poller.shutdown().await;
        poller.shutdown().await;
        assert!(poller.is_cancelled());

        let polled = factory.stats_calls();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(factory.stats_calls(), polled);
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let factory = FakeTransportFactory::new();
        let transport = factory.transport_for_test();

        let poller = StatsPoller::spawn(
            None,
            transport,
            Duration::from_millis(5),
            Arc::new(EventBus::new()),
            Arc::new(LogThrottler::default()),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(poller);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let polled = factory.stats_calls();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(factory.stats_calls(), polled);
    }
}
