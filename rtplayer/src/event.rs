//! Event sink interface and event stream adapter

use crate::state::PlayState;
use parking_lot::RwLock;
use rtplayer_core::{ErrorKind, TrackKind};
use rtplayer_diagnostics::StatisticsSnapshot;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Receiver of player notifications
///
/// Every method has an empty default so implementors only override what
/// they need. Calls arrive on a player-owned task, one at a time and in the
/// order they were raised; implementations should return quickly.
pub trait EventSink: Send + Sync {
    /// An unrecoverable error ended the session
    fn on_error(&self, _kind: ErrorKind, _message: &str) {}

    /// The playback state changed (never called with [`PlayState::Error`])
    fn on_state_changed(&self, _state: PlayState) {}

    /// Periodic statistics, see [`crate::RtPlayer::set_statistics_interval`]
    fn on_statistics(&self, _snapshot: &StatisticsSnapshot) {}

    /// The first frame of a track was reassembled
    fn on_track_received(&self, _kind: TrackKind) {}

    /// The first frame of a track was decoded
    fn on_first_frame_decoded(&self, _kind: TrackKind) {}
}

/// Player notification as a value
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// See [`EventSink::on_error`]
    Error {
        /// Error category
        kind: ErrorKind,
        /// Human readable description
        message: String,
    },
    /// See [`EventSink::on_state_changed`]
    StateChanged(PlayState),
    /// See [`EventSink::on_statistics`]
    Statistics(StatisticsSnapshot),
    /// See [`EventSink::on_track_received`]
    TrackReceived(TrackKind),
    /// See [`EventSink::on_first_frame_decoded`]
    FirstFrameDecoded(TrackKind),
}

impl PlayerEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            PlayerEvent::Error { .. } => "error",
            PlayerEvent::StateChanged(_) => "state_changed",
            PlayerEvent::Statistics(_) => "statistics",
            PlayerEvent::TrackReceived(_) => "track_received",
            PlayerEvent::FirstFrameDecoded(_) => "first_frame_decoded",
        }
    }

    /// Call the matching sink method
    pub fn deliver(&self, sink: &dyn EventSink) {
        match self {
            PlayerEvent::Error { kind, message } => sink.on_error(*kind, message),
            PlayerEvent::StateChanged(state) => sink.on_state_changed(*state),
            PlayerEvent::Statistics(snapshot) => sink.on_statistics(snapshot),
            PlayerEvent::TrackReceived(kind) => sink.on_track_received(*kind),
            PlayerEvent::FirstFrameDecoded(kind) => sink.on_first_frame_decoded(*kind),
        }
    }
}

/// The sink currently attached to a player, held weakly
#[derive(Clone, Default)]
pub(crate) struct SinkSlot {
    sink: Arc<RwLock<Option<Weak<dyn EventSink>>>>,
}

impl SinkSlot {
    pub(crate) fn set(&self, sink: &Arc<dyn EventSink>) {
        *self.sink.write() = Some(Arc::downgrade(sink));
    }

    pub(crate) fn clear(&self) {
        *self.sink.write() = None;
    }

    pub(crate) fn get(&self) -> Option<Arc<dyn EventSink>> {
        self.sink.read().as_ref().and_then(Weak::upgrade)
    }
}

/// Deliver queued events to whatever sink is attached at delivery time
pub(crate) async fn dispatch_events(mut rx: mpsc::UnboundedReceiver<PlayerEvent>, slot: SinkSlot) {
    while let Some(event) = rx.recv().await {
        match slot.get() {
            Some(sink) => {
                trace!("Delivering {} event", event.event_type());
                event.deliver(sink.as_ref());
            }
            None => debug!("No event sink, {} event dropped", event.event_type()),
        }
    }
}

/// Sink that forwards every notification into an [`EventStream`]
#[derive(Debug)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<PlayerEvent>,
}

impl ChannelEventSink {
    /// Create a sink and the stream it feeds
    ///
    /// The player only holds the sink weakly; keep the returned `Arc` alive
    /// for as long as events should flow.
    pub fn new() -> (Arc<Self>, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), EventStream::new(rx))
    }

    fn forward(&self, event: PlayerEvent) {
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelEventSink {
    fn on_error(&self, kind: ErrorKind, message: &str) {
        self.forward(PlayerEvent::Error {
            kind,
            message: message.to_string(),
        });
    }

    fn on_state_changed(&self, state: PlayState) {
        self.forward(PlayerEvent::StateChanged(state));
    }

    fn on_statistics(&self, snapshot: &StatisticsSnapshot) {
        self.forward(PlayerEvent::Statistics(snapshot.clone()));
    }

    fn on_track_received(&self, kind: TrackKind) {
        self.forward(PlayerEvent::TrackReceived(kind));
    }

    fn on_first_frame_decoded(&self, kind: TrackKind) {
        self.forward(PlayerEvent::FirstFrameDecoded(kind));
    }
}

/// Stream of player events for async iteration
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<PlayerEvent>,
}

impl EventStream {
    /// Create a new event stream with a receiver
    pub fn new(receiver: mpsc::UnboundedReceiver<PlayerEvent>) -> Self {
        Self { receiver }
    }

    /// Get the next event from the stream
    pub async fn next(&mut self) -> Option<PlayerEvent> {
        self.receiver.recv().await
    }

    /// Try to get the next event without blocking
    pub fn try_next(&mut self) -> Result<Option<PlayerEvent>, mpsc::error::TryRecvError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(mpsc::error::TryRecvError::Disconnected)
            }
        }
    }

    /// Every event queued right now
    pub fn drain(&mut self) -> Vec<PlayerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Close the event stream
    pub fn close(&mut self) {
        self.receiver.close();
    }
}
