//! Session event bus
//!
//! Outward notifications of a running session (remote messages, stream
//! binding, per-peer state and failures, statistics) are published here for
//! any number of subscribers.

pub mod types;

pub use types::SessionEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Broadcast bus for session events
///
/// Every subscriber sees every event published after it subscribed.
/// Subscribers that fall more than the capacity behind receive `Lagged`
/// and miss events.
///
/// # Example
///
/// ```no_run
/// use rendezvous::events::{EventBus, SessionEvent};
///
/// # async fn run() {
/// let bus = EventBus::new();
/// let mut rx = bus.subscribe();
///
/// bus.publish(SessionEvent::SignalingOpened);
///
/// tokio::spawn(async move {
///     while let Ok(event) = rx.recv().await {
///         println!("{}", event.event_name());
///     }
/// });
/// # }
/// ```
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create an event bus with room for 256 undelivered events
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// Dropped if nobody is subscribed.
    ///
    /// # Arguments
    ///
    /// * `event` - The notification to deliver
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
