//! Playback session: supervisor and pipeline workers
//!
//! ```text
//! transport I/O ──frames──> sync buffer ──frames──> decoder (per track) ──> output gate ──> surface
//!        │                                                  │
//!        └──────────────── fatal errors ──> supervisor <────┘
//! ```
//!
//! Each stage owns its state and hands frames to the next through a bounded
//! channel. The session's cancellation token is checked in every `select!`;
//! the supervisor cancels it on a fatal error or when the caller stops, then
//! waits for every worker before returning.

use crate::config::PlayerConfig;
use crate::event::PlayerEvent;
use crate::state::{StateMachine, Transition};
use parking_lot::RwLock;
use rtplayer_core::{
    PlayUrl, PlayerError, PlayerResult, SessionNegotiator, SignalingMessage, SignalingResponse,
    StreamCounters, TrackDescription, TrackKind, TransportConnection, TransportEvent,
};
use rtplayer_diagnostics::{StatisticsCollector, StatisticsInterval};
use rtplayer_media::{
    CodecRegistry, DemuxEvent, Depacketizer, EncodedFrame, MediaDecoder, MediaFrame, OutputGate,
    RenderSurface, SyncBuffer,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Frames in flight between the transport and the sync buffer
const TRANSPORT_QUEUE: usize = 256;
/// How often reassembly and unknown-track timeouts are checked
const DEMUX_POLL: Duration = Duration::from_millis(20);
/// Upper bound on the goodbye sent to the origin during teardown
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Render surface shared by the player and its decode workers
pub(crate) type SurfaceSlot = Arc<RwLock<Arc<dyn RenderSurface>>>;

/// Input of the sync and decode stages
#[derive(Debug)]
pub(crate) enum StageInput {
    /// A track became known; decoders are created from it
    Track(TrackDescription),
    /// A reassembled frame
    Frame(EncodedFrame),
}

/// Everything a session needs from its player
pub(crate) struct SessionContext {
    pub id: u64,
    pub url: PlayUrl,
    pub support_https: bool,
    pub config: PlayerConfig,
    pub registry: CodecRegistry,
    pub machine: Arc<StateMachine>,
    pub gate: Arc<OutputGate>,
    pub surface: SurfaceSlot,
    pub statistics: StatisticsInterval,
    pub cancel: CancellationToken,
    pub controls: mpsc::Receiver<SignalingMessage>,
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

/// Negotiate, run the pipeline and tear it down
///
/// Returns once every worker has exited. A fatal error commits the Error
/// transition exactly once.
pub(crate) async fn run_session(ctx: SessionContext) {
    let SessionContext {
        id,
        url,
        support_https,
        config,
        registry,
        machine,
        gate,
        surface,
        statistics,
        cancel,
        controls,
    } = ctx;

    let fail = |error: PlayerError| {
        error!("Session {} failed: {}", id, error);
        machine.apply(Transition::Fail {
            session: id,
            kind: error.kind(),
            message: error.to_string(),
        });
    };

    let negotiator = SessionNegotiator::new(config.effective_connection(registry.list_codecs()));
    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Session {} cancelled during negotiation", id);
            return;
        }
        connected = negotiator.connect(&url, support_https) => connected,
    };
    let mut transport = match connected {
        Ok(transport) => transport,
        Err(e) => {
            fail(e);
            return;
        }
    };
    info!(
        "Session {} negotiated over {:?} ({})",
        id,
        transport.mode(),
        transport.session_id()
    );

    if let Some(track) = transport.tracks().iter().find(|t| !registry.supports(&t.codec)) {
        let codec = track.codec.clone();
        let _ = transport.close().await;
        fail(PlayerError::UnsupportedCodec { codec });
        return;
    }

    let counters = Arc::new(StreamCounters::new());
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<PlayerError>(4);
    let (frame_tx, frame_rx) = mpsc::channel::<StageInput>(TRANSPORT_QUEUE);

    let mut decoders = HashMap::new();
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    for kind in TrackKind::ALL {
        let (tx, rx) = mpsc::channel(config.decode.decoder_queue.max(1));
        decoders.insert(kind, tx);
        let worker = DecodeWorker {
            session: id,
            kind,
            registry: registry.clone(),
            decoder: None,
            machine: machine.clone(),
            gate: gate.clone(),
            surface: surface.clone(),
            counters: counters.clone(),
            max_errors: config.decode.max_consecutive_decode_errors.max(1),
            consecutive_errors: 0,
            first_decoded: false,
        };
        workers.push(tokio::spawn(worker.run(rx, fatal_tx.clone(), cancel.clone())));
    }

    let sync = SyncWorker {
        buffer: SyncBuffer::new(config.jitter.clone()).with_counters(counters.clone()),
        decoders,
        counters: counters.clone(),
    };
    workers.push(tokio::spawn(sync.run(frame_rx, fatal_tx.clone(), cancel.clone())));

    let depacketizer = Depacketizer::new(config.depacketizer.clone(), transport.tracks(), counters.clone());
    workers.push(tokio::spawn(io_worker(
        id,
        transport,
        depacketizer,
        machine.clone(),
        frame_tx,
        controls,
        fatal_tx,
        cancel.clone(),
    )));

    let collector = StatisticsCollector::new(counters, &statistics);
    let stats_machine = machine.clone();
    workers.push(tokio::spawn(collector.run(cancel.clone(), move |snapshot| {
        stats_machine.emit(id, PlayerEvent::Statistics(snapshot));
    })));

    let fatal = tokio::select! {
        _ = cancel.cancelled() => None,
        error = fatal_rx.recv() => Some(error.unwrap_or_else(|| PlayerError::TransportClosed {
            reason: "session workers exited".to_string(),
        })),
    };
    if let Some(error) = fatal {
        fail(error);
    }

    cancel.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            error!("Session {} worker panicked: {}", id, e);
        }
    }
    info!("Session {} torn down", id);
}

#[allow(clippy::too_many_arguments)]
async fn io_worker(
    session: u64,
    mut transport: TransportConnection,
    mut depacketizer: Depacketizer,
    machine: Arc<StateMachine>,
    frames: mpsc::Sender<StageInput>,
    mut controls: mpsc::Receiver<SignalingMessage>,
    fatal: mpsc::Sender<PlayerError>,
    cancel: CancellationToken,
) {
    for track in transport.tracks() {
        if frames.send(StageInput::Track(track.clone())).await.is_err() {
            return;
        }
    }

    let mut poll = tokio::time::interval(DEMUX_POLL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let failure = 'io: loop {
        let events = tokio::select! {
            _ = cancel.cancelled() => break None,
            Some(message) = controls.recv() => {
                if let Err(e) = transport.send_control(message).await {
                    warn!("Control message not sent: {}", e);
                }
                continue;
            }
            event = transport.next_event() => match event {
                Ok(TransportEvent::Packet(packet)) => depacketizer.push(packet, now()),
                Ok(TransportEvent::Signal(SignalingResponse::TrackAnnounced(desc))) => {
                    if frames.send(StageInput::Track(desc.clone())).await.is_err() {
                        break None;
                    }
                    depacketizer.announce_track(desc, now())
                }
                Ok(TransportEvent::Signal(SignalingResponse::EndOfStream)) => {
                    break Some(PlayerError::TransportClosed {
                        reason: "origin ended the stream".to_string(),
                    });
                }
                Ok(TransportEvent::Signal(SignalingResponse::Error { error, error_code })) => {
                    break Some(PlayerError::from_remote(&error_code, &error));
                }
                Ok(TransportEvent::Signal(other)) => {
                    debug!("Ignoring signaling message {:?}", other);
                    continue;
                }
                Ok(TransportEvent::Closed) => {
                    break Some(PlayerError::TransportClosed {
                        reason: "origin closed the connection".to_string(),
                    });
                }
                Err(e) => break Some(e),
            },
            _ = poll.tick() => depacketizer.poll(now()),
        };

        for event in events {
            match event {
                DemuxEvent::TrackReceived(kind) => {
                    info!("Session {}: {} track received", session, kind);
                    machine.emit(session, PlayerEvent::TrackReceived(kind));
                }
                DemuxEvent::Frame(frame) => {
                    if frames.send(StageInput::Frame(frame)).await.is_err() {
                        break 'io None;
                    }
                }
            }
        }
    };

    if let Some(error) = failure {
        let _ = fatal.send(error).await;
    }
    if tokio::time::timeout(CLOSE_GRACE, transport.close()).await.is_err() {
        debug!("Session {}: origin did not acknowledge close", session);
    }
}

struct SyncWorker {
    buffer: SyncBuffer,
    decoders: HashMap<TrackKind, mpsc::Sender<StageInput>>,
    counters: Arc<StreamCounters>,
}

impl SyncWorker {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<StageInput>,
        fatal: mpsc::Sender<PlayerError>,
        cancel: CancellationToken,
    ) {
        loop {
            let deadline = self.buffer.next_deadline().map(Instant::from_std);
            tokio::select! {
                _ = cancel.cancelled() => break,
                input = rx.recv() => match input {
                    Some(StageInput::Track(desc)) => self.forward(desc.kind, StageInput::Track(desc)),
                    Some(StageInput::Frame(frame)) => match self.buffer.push(frame, now()) {
                        Ok(_) => {}
                        Err(e) => {
                            let _ = fatal.send(e).await;
                            break;
                        }
                    },
                    None => break,
                },
                _ = sleep_until(deadline) => {}
            }

            for frame in self.buffer.pop_ready(now()) {
                self.forward(frame.kind, StageInput::Frame(frame));
            }
        }
        self.buffer.flush();
    }

    /// Hand off without waiting; a full decoder queue drops the frame
    fn forward(&self, kind: TrackKind, input: StageInput) {
        let Some(tx) = self.decoders.get(&kind) else {
            return;
        };
        match tx.try_send(input) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(StageInput::Frame(frame))) => {
                self.counters.record_dropped(kind);
                warn!("{} decoder backlogged, dropped frame pts={:?}", kind, frame.pts);
            }
            Err(mpsc::error::TrySendError::Full(StageInput::Track(desc))) => {
                warn!("{} decoder backlogged, lost track update for {}", kind, desc.codec);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct DecodeWorker {
    session: u64,
    kind: TrackKind,
    registry: CodecRegistry,
    decoder: Option<Box<dyn MediaDecoder>>,
    machine: Arc<StateMachine>,
    gate: Arc<OutputGate>,
    surface: SurfaceSlot,
    counters: Arc<StreamCounters>,
    max_errors: u32,
    consecutive_errors: u32,
    first_decoded: bool,
}

impl DecodeWorker {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<StageInput>,
        fatal: mpsc::Sender<PlayerError>,
        cancel: CancellationToken,
    ) {
        loop {
            let input = tokio::select! {
                _ = cancel.cancelled() => return,
                input = rx.recv() => match input {
                    Some(input) => input,
                    None => return,
                },
            };
            let outcome = match input {
                StageInput::Track(desc) => self.configure(&desc),
                StageInput::Frame(frame) => self.decode(&frame),
            };
            if let Err(e) = outcome {
                let _ = fatal.send(e).await;
                return;
            }
        }
    }

    fn configure(&mut self, desc: &TrackDescription) -> PlayerResult<()> {
        let decoder = self.registry.create_decoder(desc)?;
        info!("{} decoder ready: {:?}", self.kind, decoder.codec_info());
        self.decoder = Some(decoder);
        Ok(())
    }

    /// Decode and render one frame; only repeated failures are fatal
    fn decode(&mut self, frame: &EncodedFrame) -> PlayerResult<()> {
        let Some(decoder) = self.decoder.as_mut() else {
            self.counters.record_dropped(self.kind);
            warn!("No {} decoder, dropped frame pts={:?}", self.kind, frame.pts);
            return Ok(());
        };

        let decoded = match decoder.decode(frame) {
            Ok(decoded) => {
                self.consecutive_errors = 0;
                decoded
            }
            Err(e) => {
                self.consecutive_errors += 1;
                self.counters.record_dropped(self.kind);
                warn!(
                    "{} decode failed ({} in a row): {}",
                    self.kind, self.consecutive_errors, e
                );
                if self.consecutive_errors >= self.max_errors {
                    return Err(PlayerError::Decoding {
                        codec: frame.codec.clone(),
                        reason: format!("{} consecutive failures, last: {}", self.consecutive_errors, e),
                    });
                }
                return Ok(());
            }
        };
        let Some(media) = decoded else {
            return Ok(());
        };

        self.counters.record_decoded(self.kind);
        if !self.first_decoded {
            self.first_decoded = true;
            info!("Session {}: first {} frame decoded", self.session, self.kind);
            self.machine
                .emit(self.session, PlayerEvent::FirstFrameDecoded(self.kind));
            self.machine
                .apply(Transition::FirstFrameDecoded { session: self.session });
        }

        let surface = self.surface.read().clone();
        let rendered = match media {
            MediaFrame::Audio(audio) => self.gate.render_audio(surface.as_ref(), audio),
            MediaFrame::Video(video) => {
                self.counters.set_video_size(video.width, video.height);
                self.machine
                    .record_video_size(self.session, video.width, video.height);
                self.gate.render_video(surface.as_ref(), &video)
            }
        };
        if rendered {
            self.counters.record_rendered(self.kind);
        }
        Ok(())
    }
}
